use chrono::{SecondsFormat, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Keys that describe runtime state and must never reach the store file.
pub const RUNTIME_KEYS: [&str; 2] = ["status", "runtime_pid"];

/// Persisted task configuration. Runtime state (status, pid, buffers) lives
/// in the process registry and is never serialized here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub description: String,
    pub group: String,
    pub category: String,
    pub notes: String,
    pub working_directory: Option<String>,
    pub start_command: String,
    pub stop_command: Option<String>,
    pub port: Option<u16>,
    pub environment_variables: HashMap<String, String>,
    pub auto_restart: bool,
    pub max_restarts: u32,
    pub restart_interval: u64,
    pub restart_count: u32,
    pub manual_stopped: bool,
    pub was_running_before_shutdown: bool,
    pub last_started: Option<String>,
    pub scheduled_start: Option<String>,
    pub scheduled_stop: Option<String>,
    pub created_date: String,
    pub updated_date: String,
}

impl Default for Task {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            description: String::new(),
            group: String::new(),
            category: String::new(),
            notes: String::new(),
            working_directory: None,
            start_command: String::new(),
            stop_command: None,
            port: None,
            environment_variables: HashMap::new(),
            auto_restart: false,
            max_restarts: 0,
            restart_interval: 5,
            restart_count: 0,
            manual_stopped: false,
            was_running_before_shutdown: false,
            last_started: None,
            scheduled_start: None,
            scheduled_stop: None,
            created_date: String::new(),
            updated_date: String::new(),
        }
    }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn to_base36(mut n: u128) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).to_string()
}

/// `proj_` + base36 millisecond timestamp + base36 random suffix.
pub fn new_task_id() -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u128;
    let suffix = OsRng.next_u64() as u128 & 0xffff_ffff;
    format!("proj_{}{}", to_base36(millis), to_base36(suffix))
}

pub fn strip_runtime_keys(value: &mut Value) {
    if let Some(obj) = value.as_object_mut() {
        for key in RUNTIME_KEYS {
            obj.remove(key);
        }
    }
}
