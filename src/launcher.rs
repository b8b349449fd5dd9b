use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use anyhow::Result;
use tokio::process::Command;

#[cfg(unix)]
use anyhow::{anyhow, bail};
#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// Platform-aware command spawn wrapper. On Unix the command runs under the
/// user's shell with `-i -c` so dotfile initialization (conda and friends)
/// applies; `login_shell = false` drops the `-i`, which keeps shell banners
/// out of captured logs. On Windows the command goes through `cmd /C`.
#[derive(Debug, Clone, Copy)]
pub struct Launcher {
    pub login_shell: bool,
}

impl Launcher {
    pub fn new(login_shell: bool) -> Self {
        Self { login_shell }
    }

    #[cfg(unix)]
    pub fn command(
        &self,
        command_line: &str,
        cwd: &Path,
        env: &HashMap<String, String>,
    ) -> Command {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| {
            if Path::new("/bin/bash").exists() {
                "/bin/bash".to_string()
            } else {
                "/bin/sh".to_string()
            }
        });
        let mut cmd = Command::new(shell);
        if self.login_shell {
            cmd.arg("-i");
        }
        cmd.arg("-c")
            .arg(command_line)
            .current_dir(cwd)
            .envs(env)
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    #[cfg(windows)]
    pub fn command(
        &self,
        command_line: &str,
        cwd: &Path,
        env: &HashMap<String, String>,
    ) -> Command {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C")
            .arg(command_line)
            .current_dir(cwd)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

/// Signal the whole process group created for a supervised child. A group
/// that is already gone counts as success.
#[cfg(unix)]
pub fn kill_group(pid: i32, signal: &str) -> Result<()> {
    let sig = parse_signal(signal)?;
    match killpg(Pid::from_raw(pid), sig) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(anyhow!(e)),
    }
}

#[cfg(windows)]
pub fn kill_group(pid: i32, _signal: &str) -> Result<()> {
    let status = std::process::Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .status()?;
    if status.success() {
        Ok(())
    } else {
        anyhow::bail!("taskkill exited with {:?}", status.code())
    }
}

#[cfg(unix)]
pub fn parse_signal(name: &str) -> Result<Signal> {
    let upper = name.to_ascii_uppercase();
    let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
    match bare {
        "TERM" => Ok(Signal::SIGTERM),
        "KILL" => Ok(Signal::SIGKILL),
        "INT" => Ok(Signal::SIGINT),
        "HUP" => Ok(Signal::SIGHUP),
        "QUIT" => Ok(Signal::SIGQUIT),
        "USR1" => Ok(Signal::SIGUSR1),
        "USR2" => Ok(Signal::SIGUSR2),
        "STOP" => Ok(Signal::SIGSTOP),
        "CONT" => Ok(Signal::SIGCONT),
        other => bail!("unsupported signal: {other}"),
    }
}

#[cfg(unix)]
fn to_signal_name(sig: Option<i32>) -> Option<String> {
    sig.and_then(|n| Signal::try_from(n).ok())
        .map(|s| format!("{s:?}").trim_start_matches("SIG").to_string())
}

#[cfg(unix)]
pub fn exit_info(status: &std::process::ExitStatus) -> (Option<i32>, Option<String>) {
    use std::os::unix::process::ExitStatusExt;
    (status.code(), to_signal_name(status.signal()))
}

#[cfg(not(unix))]
pub fn exit_info(status: &std::process::ExitStatus) -> (Option<i32>, Option<String>) {
    (status.code(), None)
}
