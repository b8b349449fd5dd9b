use anyhow::Result;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_GUARDIAN_TICK_SECS: u64 = 5;
pub const LOG_CAPACITY: usize = 500;
pub const PORT_SCAN_RANGE: u16 = 10;

/// Base run directory layout. Everything the server persists lives under
/// `<base>/task/`.
#[derive(Debug, Clone)]
pub struct Paths {
    base_dir: PathBuf,
}

impl Paths {
    pub fn detect(base_override: Option<PathBuf>) -> Result<Self> {
        let base_dir = match base_override {
            Some(dir) => dir,
            None => match std::env::var_os("TASKDOCK_HOME") {
                Some(dir) => PathBuf::from(dir),
                None => std::env::current_dir()?,
            },
        };
        Ok(Self { base_dir })
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(self.task_dir())?;
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn task_dir(&self) -> PathBuf {
        self.base_dir.join("task")
    }

    pub fn tasks_path(&self) -> PathBuf {
        self.task_dir().join("tasks.json")
    }

    pub fn store_lock_path(&self) -> PathBuf {
        self.task_dir().join("store.lock")
    }

    pub fn config_path(&self) -> PathBuf {
        self.task_dir().join("config.toml")
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    server: ConfigServer,
    #[serde(default)]
    supervisor: ConfigSupervisor,
    #[serde(default)]
    guardian: ConfigGuardian,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigServer {
    port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigSupervisor {
    startup_timeout_ms: Option<u64>,
    login_shell: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigGuardian {
    tick_secs: Option<u64>,
}

/// Effective settings after merging the CLI, the `PORT` environment variable
/// and the optional `<base>/task/config.toml` over compiled defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub paths: Paths,
    pub port: u16,
    pub startup_timeout_ms: u64,
    pub login_shell: bool,
    pub guardian_tick_secs: u64,
}

impl Settings {
    pub fn load(paths: Paths, port_flag: Option<u16>, plain_shell: bool) -> Result<Self> {
        let cfg = if paths.config_path().exists() {
            let raw = fs::read_to_string(paths.config_path())?;
            toml::from_str::<ConfigFile>(&raw)?
        } else {
            ConfigFile::default()
        };

        let env_port = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok());
        let port = port_flag
            .or(env_port)
            .or(cfg.server.port)
            .unwrap_or(DEFAULT_PORT);

        let login_shell = if plain_shell {
            false
        } else {
            cfg.supervisor.login_shell.unwrap_or(true)
        };

        Ok(Self {
            paths,
            port,
            startup_timeout_ms: cfg
                .supervisor
                .startup_timeout_ms
                .unwrap_or(DEFAULT_STARTUP_TIMEOUT_MS),
            login_shell,
            guardian_tick_secs: cfg
                .guardian
                .tick_secs
                .unwrap_or(DEFAULT_GUARDIAN_TICK_SECS)
                .max(1),
        })
    }

    /// Working directories resolve against the base run dir; anything that is
    /// not an existing directory silently falls back to the base dir.
    pub fn resolve_workdir(&self, requested: Option<&str>) -> PathBuf {
        match requested {
            Some(raw) if !raw.trim().is_empty() => {
                let p = PathBuf::from(raw);
                let abs = if p.is_absolute() {
                    p
                } else {
                    self.base_dir().join(p)
                };
                if abs.is_dir() {
                    abs
                } else {
                    self.base_dir().to_path_buf()
                }
            }
            _ => self.base_dir().to_path_buf(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        self.paths.base_dir()
    }
}
