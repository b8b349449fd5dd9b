use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use fs2::FileExt;
use serde_json::Value;
use tracing::warn;

use crate::config::Paths;
use crate::task::{new_task_id, now_rfc3339, strip_runtime_keys, Task, RUNTIME_KEYS};

/// Durable task configuration store: one pretty-printed JSON array at
/// `<base>/task/tasks.json`, replaced atomically on every mutation. Reads
/// tolerate a missing or unparsable file and dedupe by id, keeping the entry
/// with the newest `updated_date`.
pub struct TaskStore {
    path: PathBuf,
    write_lock: Mutex<()>,
    _lock: File,
}

pub struct DedupeReport {
    pub removed: usize,
    pub total: usize,
}

impl TaskStore {
    pub fn open(paths: &Paths) -> Result<Self> {
        paths.ensure_dirs()?;
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(paths.store_lock_path())?;
        if lock_file.try_lock_exclusive().is_err() {
            bail!(
                "task store is locked by another process: {}",
                paths.store_lock_path().display()
            );
        }
        Ok(Self {
            path: paths.tasks_path(),
            write_lock: Mutex::new(()),
            _lock: lock_file,
        })
    }

    fn read_raw(&self) -> Vec<Task> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!("task store read failed: {e}");
                return Vec::new();
            }
        };
        match serde_json::from_slice::<Vec<Task>>(&raw) {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!("task store parse failed, treating as empty: {e}");
                Vec::new()
            }
        }
    }

    fn dedupe_tasks(tasks: Vec<Task>) -> (Vec<Task>, usize) {
        let mut kept: Vec<Task> = Vec::with_capacity(tasks.len());
        let mut removed = 0usize;
        for task in tasks {
            match kept.iter().position(|t| t.id == task.id) {
                Some(pos) => {
                    removed += 1;
                    if task.updated_date > kept[pos].updated_date {
                        kept[pos] = task;
                    }
                }
                None => kept.push(task),
            }
        }
        (kept, removed)
    }

    fn write(&self, tasks: &[Task]) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(tasks)?;
        let parent = self
            .path
            .parent()
            .ok_or_else(|| anyhow!("missing parent for {}", self.path.display()))?;
        fs::create_dir_all(parent)?;
        let tmp = parent.join(format!(".tasks.json.tmp.{}", std::process::id()));
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        fs::rename(tmp, &self.path)?;
        Ok(())
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| anyhow!("store lock poisoned"))
    }

    pub fn list(&self) -> Vec<Task> {
        Self::dedupe_tasks(self.read_raw()).0
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.list().into_iter().find(|t| t.id == id)
    }

    pub fn create(&self, mut body: Value) -> Result<Task> {
        let _guard = self.guard()?;
        let mut tasks = Self::dedupe_tasks(self.read_raw()).0;
        if let Some(id) = body.get("id").and_then(Value::as_str) {
            if let Some(existing) = tasks.iter().find(|t| t.id == id) {
                return Ok(existing.clone());
            }
        }
        strip_runtime_keys(&mut body);
        let mut task: Task = serde_json::from_value(body).context("invalid task body")?;
        validate(&task)?;
        if task.id.trim().is_empty() {
            task.id = new_task_id();
        }
        let now = now_rfc3339();
        task.created_date = now.clone();
        task.updated_date = now;
        tasks.push(task.clone());
        self.write(&tasks)?;
        Ok(task)
    }

    pub fn update(&self, id: &str, patch: Value) -> Result<Option<Task>> {
        let _guard = self.guard()?;
        let mut tasks = Self::dedupe_tasks(self.read_raw()).0;
        let Some(pos) = tasks.iter().position(|t| t.id == id) else {
            return Ok(None);
        };
        let mut merged = serde_json::to_value(&tasks[pos])?;
        if let (Some(target), Some(patch)) = (merged.as_object_mut(), patch.as_object()) {
            for (key, value) in patch {
                if key == "id" || key == "created_date" || RUNTIME_KEYS.contains(&key.as_str()) {
                    continue;
                }
                target.insert(key.clone(), value.clone());
            }
        }
        let mut task: Task = serde_json::from_value(merged).context("invalid task patch")?;
        validate(&task)?;
        task.updated_date = now_rfc3339();
        tasks[pos] = task.clone();
        self.write(&tasks)?;
        Ok(Some(task))
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let _guard = self.guard()?;
        let mut tasks = Self::dedupe_tasks(self.read_raw()).0;
        let before = tasks.len();
        tasks.retain(|t| t.id != id);
        if tasks.len() == before {
            return Ok(false);
        }
        self.write(&tasks)?;
        Ok(true)
    }

    pub fn dedupe(&self) -> Result<DedupeReport> {
        let _guard = self.guard()?;
        let (tasks, removed) = Self::dedupe_tasks(self.read_raw());
        self.write(&tasks)?;
        Ok(DedupeReport {
            removed,
            total: tasks.len(),
        })
    }

    /// User-action bookkeeping: applies the mutation and advances
    /// `updated_date`. Unknown ids are a no-op.
    pub fn update_flags(&self, id: &str, apply: impl FnOnce(&mut Task)) -> Result<()> {
        let _guard = self.guard()?;
        let mut tasks = Self::dedupe_tasks(self.read_raw()).0;
        if let Some(task) = tasks.iter_mut().find(|t| t.id == id) {
            apply(task);
            task.updated_date = now_rfc3339();
            self.write(&tasks)?;
        }
        Ok(())
    }

    /// Guardian bookkeeping: same as `update_flags` but leaves `updated_date`
    /// untouched.
    pub fn update_counters(&self, id: &str, apply: impl FnOnce(&mut Task)) -> Result<()> {
        let _guard = self.guard()?;
        let mut tasks = Self::dedupe_tasks(self.read_raw()).0;
        if let Some(task) = tasks.iter_mut().find(|t| t.id == id) {
            apply(task);
            self.write(&tasks)?;
        }
        Ok(())
    }
}

fn validate(task: &Task) -> Result<()> {
    if task.port == Some(0) {
        bail!("port must be between 1 and 65535");
    }
    Ok(())
}
