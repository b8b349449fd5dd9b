use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

/// Bounded FIFO of captured output lines; overflow evicts from the head.
#[derive(Debug)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LogSnapshot {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// In-memory state for a task that is currently or was recently spawned.
/// The generation ties the entry to the child that produced it, so a driver
/// for a replaced child can never clobber the entry of its successor.
pub struct LiveEntry {
    pub generation: u64,
    pub pid: i32,
    pub command: String,
    pub cwd: PathBuf,
    pub status: RunStatus,
    pub started_at: String,
    pub exit: Option<ExitInfo>,
    pub stdout: Arc<Mutex<LogBuffer>>,
    pub stderr: Arc<Mutex<LogBuffer>>,
}

/// Thread-safe map from task id to live entry. The buffers hang off the
/// entries behind their own locks so drain tasks never hold the map lock.
#[derive(Default)]
pub struct Registry {
    entries: RwLock<HashMap<String, LiveEntry>>,
    generations: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub async fn insert(&self, id: &str, entry: LiveEntry) {
        self.entries.write().await.insert(id.to_string(), entry);
    }

    pub async fn remove(&self, id: &str) {
        self.entries.write().await.remove(id);
    }

    pub async fn is_running(&self, id: &str) -> bool {
        self.entries
            .read()
            .await
            .get(id)
            .map(|e| e.status == RunStatus::Running)
            .unwrap_or(false)
    }

    pub async fn running_pid(&self, id: &str) -> Option<i32> {
        let entries = self.entries.read().await;
        entries
            .get(id)
            .filter(|e| e.status == RunStatus::Running)
            .map(|e| e.pid)
    }

    pub async fn command_of(&self, id: &str) -> Option<String> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|e| e.command.clone())
    }

    pub async fn status_of(&self, id: &str) -> Option<(RunStatus, i32)> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|e| (e.status, e.pid))
    }

    pub async fn mark_stopped(&self, id: &str) {
        if let Some(entry) = self.entries.write().await.get_mut(id) {
            entry.status = RunStatus::Stopped;
        }
    }

    pub async fn mark_exited(&self, id: &str, generation: u64, exit: ExitInfo) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(id) {
            if entry.generation == generation {
                entry.status = RunStatus::Stopped;
                entry.exit = Some(exit);
            }
        }
    }

    pub async fn buffers(&self, id: &str) -> Option<(Arc<Mutex<LogBuffer>>, Arc<Mutex<LogBuffer>>)> {
        let entries = self.entries.read().await;
        entries
            .get(id)
            .map(|e| (e.stdout.clone(), e.stderr.clone()))
    }

    pub async fn logs(&self, id: &str) -> LogSnapshot {
        match self.buffers(id).await {
            Some((stdout, stderr)) => LogSnapshot {
                stdout: stdout.lock().await.snapshot(),
                stderr: stderr.lock().await.snapshot(),
            },
            None => LogSnapshot::default(),
        }
    }

    pub async fn clear_logs(&self, id: &str) {
        if let Some((stdout, stderr)) = self.buffers(id).await {
            stdout.lock().await.clear();
            stderr.lock().await.clear();
        }
    }

    pub async fn running_ids(&self) -> Vec<(String, i32)> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.status == RunStatus::Running)
            .map(|(id, e)| (id.clone(), e.pid))
            .collect()
    }
}
