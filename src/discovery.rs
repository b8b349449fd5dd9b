use anyhow::Result;
use serde::Serialize;

#[cfg(unix)]
use anyhow::{anyhow, bail};
#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::sys::signal::{kill, Signal};
#[cfg(unix)]
use nix::unistd::Pid;
#[cfg(target_os = "linux")]
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Serialize)]
pub struct ProcessMatch {
    pub pid: i32,
    pub command: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortHolder {
    pub pid: i32,
    pub command: String,
    pub name: Option<String>,
}

/// All OS processes whose command line contains `needle`,
/// case-insensitively. The server's own pid is excluded.
#[cfg(target_os = "linux")]
pub fn search_by_name(needle: &str) -> Result<Vec<ProcessMatch>> {
    let needle = needle.to_ascii_lowercase();
    let own = std::process::id() as i32;
    let mut matches = Vec::new();
    for (pid, command) in all_processes()? {
        if pid == own {
            continue;
        }
        if command.to_ascii_lowercase().contains(&needle) {
            matches.push(ProcessMatch { pid, command });
        }
    }
    Ok(matches)
}

#[cfg(target_os = "linux")]
fn all_processes() -> Result<Vec<(i32, String)>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir("/proc")?.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        let command = read_command(pid);
        if command.is_empty() {
            continue;
        }
        out.push((pid, command));
    }
    Ok(out)
}

#[cfg(target_os = "linux")]
fn read_command(pid: i32) -> String {
    let cmdline = std::fs::read(format!("/proc/{pid}/cmdline")).unwrap_or_default();
    let joined = cmdline
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).to_string())
        .collect::<Vec<_>>()
        .join(" ");
    if !joined.is_empty() {
        return joined;
    }
    std::fs::read_to_string(format!("/proc/{pid}/comm"))
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Processes holding the given TCP/UDP port locally. TCP sockets are matched
/// in LISTEN state; UDP sockets have no state to filter on.
#[cfg(target_os = "linux")]
pub fn list_by_port(port: u16) -> Result<Vec<PortHolder>> {
    let mut inodes = HashSet::new();
    for table in ["tcp", "tcp6"] {
        collect_inodes(&format!("/proc/net/{table}"), port, true, &mut inodes);
    }
    for table in ["udp", "udp6"] {
        collect_inodes(&format!("/proc/net/{table}"), port, false, &mut inodes);
    }
    if inodes.is_empty() {
        return Ok(Vec::new());
    }

    let mut holders = Vec::new();
    for (pid, command) in all_processes()? {
        if !owns_socket(pid, &inodes) {
            continue;
        }
        let name = std::fs::read_to_string(format!("/proc/{pid}/comm"))
            .ok()
            .map(|s| s.trim().to_string());
        holders.push(PortHolder { pid, command, name });
    }
    Ok(holders)
}

#[cfg(target_os = "linux")]
fn collect_inodes(path: &str, port: u16, listen_only: bool, inodes: &mut HashSet<u64>) {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return;
    };
    for line in raw.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let local_port = fields[1]
            .rsplit(':')
            .next()
            .and_then(|hex| u16::from_str_radix(hex, 16).ok());
        if local_port != Some(port) {
            continue;
        }
        if listen_only && fields[3] != "0A" {
            continue;
        }
        if let Ok(inode) = fields[9].parse::<u64>() {
            inodes.insert(inode);
        }
    }
}

#[cfg(target_os = "linux")]
fn owns_socket(pid: i32, inodes: &HashSet<u64>) -> bool {
    let Ok(entries) = std::fs::read_dir(format!("/proc/{pid}/fd")) else {
        return false;
    };
    for entry in entries.flatten() {
        let Ok(target) = std::fs::read_link(entry.path()) else {
            continue;
        };
        let Some(target) = target.to_str() else {
            continue;
        };
        let inode = target
            .strip_prefix("socket:[")
            .and_then(|rest| rest.strip_suffix(']'))
            .and_then(|n| n.parse::<u64>().ok());
        if inode.map(|n| inodes.contains(&n)).unwrap_or(false) {
            return true;
        }
    }
    false
}

#[cfg(target_os = "linux")]
fn descendants_of(root: i32) -> Vec<i32> {
    let mut children_of: HashMap<i32, Vec<i32>> = HashMap::new();
    if let Ok(entries) = std::fs::read_dir("/proc") {
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok())
            else {
                continue;
            };
            if let Some(ppid) = parse_ppid(pid) {
                children_of.entry(ppid).or_default().push(pid);
            }
        }
    }
    let mut out = Vec::new();
    let mut queue = vec![root];
    while let Some(pid) = queue.pop() {
        if let Some(children) = children_of.get(&pid) {
            for child in children {
                out.push(*child);
                queue.push(*child);
            }
        }
    }
    out
}

// stat is "pid (comm) state ppid ..."; comm may contain spaces and parens,
// so fields are taken after the last ')'.
#[cfg(target_os = "linux")]
fn parse_ppid(pid: i32) -> Option<i32> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(1)?.parse::<i32>().ok()
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn search_by_name(needle: &str) -> Result<Vec<ProcessMatch>> {
    use anyhow::Context;
    let needle = needle.to_ascii_lowercase();
    let own = std::process::id() as i32;
    let output = std::process::Command::new("ps")
        .args(["-axo", "pid=,command="])
        .output()
        .context("ps failed")?;
    let mut matches = Vec::new();
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let trimmed = line.trim_start();
        let Some((pid, command)) = trimmed.split_once(char::is_whitespace) else {
            continue;
        };
        let Ok(pid) = pid.parse::<i32>() else {
            continue;
        };
        if pid == own {
            continue;
        }
        let command = command.trim().to_string();
        if command.to_ascii_lowercase().contains(&needle) {
            matches.push(ProcessMatch { pid, command });
        }
    }
    Ok(matches)
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn list_by_port(port: u16) -> Result<Vec<PortHolder>> {
    use anyhow::Context;
    let output = std::process::Command::new("lsof")
        .args(["-nP", &format!("-i:{port}")])
        .output()
        .context("lsof failed")?;
    let mut holders: Vec<PortHolder> = Vec::new();
    for line in String::from_utf8_lossy(&output.stdout).lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 {
            continue;
        }
        let Ok(pid) = fields[1].parse::<i32>() else {
            continue;
        };
        if holders.iter().any(|h| h.pid == pid) {
            continue;
        }
        holders.push(PortHolder {
            pid,
            command: fields[0].to_string(),
            name: Some(fields[0].to_string()),
        });
    }
    Ok(holders)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn descendants_of(root: i32) -> Vec<i32> {
    let Ok(output) = std::process::Command::new("ps")
        .args(["-axo", "pid=,ppid="])
        .output()
    else {
        return Vec::new();
    };
    let mut children_of: std::collections::HashMap<i32, Vec<i32>> =
        std::collections::HashMap::new();
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let mut parts = line.split_whitespace();
        let (Some(pid), Some(ppid)) = (parts.next(), parts.next()) else {
            continue;
        };
        if let (Ok(pid), Ok(ppid)) = (pid.parse::<i32>(), ppid.parse::<i32>()) {
            children_of.entry(ppid).or_default().push(pid);
        }
    }
    let mut out = Vec::new();
    let mut queue = vec![root];
    while let Some(pid) = queue.pop() {
        if let Some(children) = children_of.get(&pid) {
            for child in children {
                out.push(*child);
                queue.push(*child);
            }
        }
    }
    out
}

/// Deliver `signal` to `pid` and every transitive descendant. Children are
/// signalled before the parent so a shell cannot respawn what was just
/// killed. Success is judged by the delivery to the root pid.
#[cfg(unix)]
pub fn kill_tree(pid: i32, signal: &str) -> Result<()> {
    if pid <= 0 {
        bail!("invalid pid: {pid}");
    }
    let sig = crate::launcher::parse_signal(signal)?;
    for child in descendants_of(pid) {
        let _ = signal_pid(child, sig);
    }
    // Group leaders take their whole group along.
    let _ = crate::launcher::kill_group(pid, signal);
    signal_pid(pid, sig)
}

#[cfg(unix)]
fn signal_pid(pid: i32, sig: Signal) -> Result<()> {
    match kill(Pid::from_raw(pid), sig) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(anyhow!(e)),
    }
}

#[cfg(windows)]
pub fn search_by_name(needle: &str) -> Result<Vec<ProcessMatch>> {
    let needle = needle.to_ascii_lowercase();
    // wmic carries full command lines; tasklist is the fallback when wmic is
    // unavailable and only yields image names.
    let wmic = std::process::Command::new("wmic")
        .args(["process", "get", "ProcessId,CommandLine", "/format:csv"])
        .output();
    let mut matches = Vec::new();
    if let Ok(output) = wmic {
        for line in String::from_utf8_lossy(&output.stdout).lines().skip(1) {
            let fields: Vec<&str> = line.split(',').collect();
            if fields.len() < 3 {
                continue;
            }
            let command = fields[1..fields.len() - 1].join(",");
            let Ok(pid) = fields[fields.len() - 1].trim().parse::<i32>() else {
                continue;
            };
            if command.to_ascii_lowercase().contains(&needle) {
                matches.push(ProcessMatch { pid, command });
            }
        }
        return Ok(matches);
    }
    let output = std::process::Command::new("tasklist")
        .args(["/FO", "CSV", "/NH"])
        .output()?;
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let fields: Vec<&str> = line.split("\",\"").collect();
        if fields.len() < 2 {
            continue;
        }
        let command = fields[0].trim_matches('"').to_string();
        let Ok(pid) = fields[1].trim_matches('"').parse::<i32>() else {
            continue;
        };
        if command.to_ascii_lowercase().contains(&needle) {
            matches.push(ProcessMatch { pid, command });
        }
    }
    Ok(matches)
}

#[cfg(windows)]
pub fn list_by_port(port: u16) -> Result<Vec<PortHolder>> {
    let output = std::process::Command::new("netstat").args(["-ano"]).output()?;
    let suffix = format!(":{port}");
    let mut holders: Vec<PortHolder> = Vec::new();
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        if !fields[1].ends_with(&suffix) {
            continue;
        }
        let Ok(pid) = fields[fields.len() - 1].parse::<i32>() else {
            continue;
        };
        if holders.iter().any(|h| h.pid == pid) {
            continue;
        }
        holders.push(PortHolder {
            pid,
            command: String::new(),
            name: None,
        });
    }
    Ok(holders)
}

#[cfg(windows)]
pub fn kill_tree(pid: i32, _signal: &str) -> Result<()> {
    if pid <= 0 {
        anyhow::bail!("invalid pid: {pid}");
    }
    crate::launcher::kill_group(pid, _signal)
}
