use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const KILL_GRACE: Duration = Duration::from_millis(500);

/// How to spawn a child process.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub timeout: Option<Duration>,
    pub log_prefix: String,
    pub env: Vec<(String, String)>,
    /// Written to the child's stdin, which is then closed.
    pub stdin_data: Option<String>,
}

impl ProcessConfig {
    /// A shell command line run through `sh -c`.
    pub fn shell(command_line: &str, working_dir: PathBuf, log_prefix: &str) -> Self {
        Self {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), command_line.to_string()],
            working_dir,
            timeout: None,
            log_prefix: log_prefix.to_string(),
            env: Vec::new(),
            stdin_data: None,
        }
    }
}

#[derive(Debug)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none()
    }

    pub fn stdout(&self) -> String {
        self.stdout_lines.join("\n")
    }

    /// The last `max_lines` stderr lines, for error payloads.
    pub fn stderr_tail(&self, max_lines: usize) -> String {
        let skip = self.stderr_lines.len().saturating_sub(max_lines);
        self.stderr_lines[skip..].join("\n")
    }
}

/// Spawn a child process, stream its output line by line into the log, and
/// forward SIGINT/SIGTERM to it.
///
/// The child runs in its own process group on Unix so a timeout can kill the
/// whole tree (test runners like to fork).
pub async fn spawn_and_stream(config: ProcessConfig) -> Result<ProcessOutput> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .current_dir(&config.working_dir)
        .stdin(if config.stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Process(format!("failed to spawn '{}': {e}", config.command)))?;

    let pid = child
        .id()
        .ok_or_else(|| Error::Process("child has no pid".into()))?;
    debug!(pid, command = %config.command, "spawned child process");

    if let Some(data) = config.stdin_data {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Process("child stdin is not piped".into()))?;
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(data.as_bytes()).await {
                warn!(error = %e, "failed to write child stdin");
            }
            // dropping stdin closes the pipe
        });
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Process("child stdout is not piped".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Process("child stderr is not piped".into()))?;

    let stdout_task = tokio::spawn(collect_lines(stdout, config.log_prefix.clone(), false));
    let stderr_task = tokio::spawn(collect_lines(stderr, config.log_prefix.clone(), true));

    #[cfg(unix)]
    let forwarder = tokio::spawn(forward_signals(pid as i32));

    let waited = match config.timeout {
        Some(limit) => tokio::time::timeout(limit, child.wait()).await.ok(),
        None => Some(child.wait().await),
    };

    #[cfg(unix)]
    forwarder.abort();

    let Some(status) = waited else {
        terminate_group(pid as i32).await;
        let _ = child.wait().await;
        stdout_task.abort();
        stderr_task.abort();
        return Err(Error::Timeout(format!(
            "'{}' did not finish within {:?}",
            config.command,
            config.timeout.unwrap_or_default()
        )));
    };
    let status = status.map_err(|e| Error::Process(format!("wait error: {e}")))?;

    let stdout_lines = stdout_task
        .await
        .map_err(|e| Error::Process(format!("stdout reader failed: {e}")))?;
    let stderr_lines = stderr_task
        .await
        .map_err(|e| Error::Process(format!("stderr reader failed: {e}")))?;

    let (exit_code, signal) = exit_info(&status);
    debug!(pid, exit_code, ?signal, "child process exited");

    Ok(ProcessOutput {
        exit_code,
        signal,
        stdout_lines,
        stderr_lines,
    })
}

/// Log every line under `[prefix]` and keep it; stderr is logged at warn.
async fn collect_lines<R>(reader: R, prefix: String, is_stderr: bool) -> Vec<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut collected = Vec::new();
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            warn!("[{prefix}] {line}");
        } else {
            info!("[{prefix}] {line}");
        }
        collected.push(line);
    }
    collected
}

/// Relay SIGINT/SIGTERM received by covloop to the child's process group.
#[cfg(unix)]
async fn forward_signals(pgid: i32) {
    use tokio::signal::unix::{SignalKind, signal};
    let (Ok(mut sigint), Ok(mut sigterm)) = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) else {
        warn!("could not install signal forwarding for child process");
        return;
    };
    loop {
        let sig = tokio::select! {
            _ = sigint.recv() => libc::SIGINT,
            _ = sigterm.recv() => libc::SIGTERM,
        };
        signal_group(pgid, sig);
    }
}

#[cfg(unix)]
fn signal_group(pgid: i32, sig: i32) {
    // SAFETY: killpg has no memory-safety preconditions; a stale pgid only yields ESRCH.
    unsafe {
        libc::killpg(pgid, sig);
    }
}

/// TERM, a short grace period, then KILL for the whole group.
async fn terminate_group(pgid: i32) {
    #[cfg(unix)]
    signal_group(pgid, libc::SIGTERM);
    tokio::time::sleep(KILL_GRACE).await;
    #[cfg(unix)]
    signal_group(pgid, libc::SIGKILL);
    #[cfg(not(unix))]
    let _ = pgid;
}

fn exit_info(status: &std::process::ExitStatus) -> (i32, Option<i32>) {
    if let Some(code) = status.code() {
        return (code, None);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return (128 + sig, Some(sig));
        }
    }
    (-1, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(stderr: &[&str]) -> ProcessOutput {
        ProcessOutput {
            exit_code: 1,
            signal: None,
            stdout_lines: vec!["a".into(), "b".into()],
            stderr_lines: stderr.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_stderr_tail() {
        let out = output(&["one", "two", "three"]);
        assert_eq!(out.stderr_tail(2), "two\nthree");
        assert_eq!(out.stderr_tail(10), "one\ntwo\nthree");
        assert_eq!(out.stdout(), "a\nb");
        assert!(!out.success());
    }

    #[test]
    fn test_shell_config() {
        let config = ProcessConfig::shell("echo hi", PathBuf::from("/tmp"), "tests");
        assert_eq!(config.command, "sh");
        assert_eq!(config.args, vec!["-c", "echo hi"]);
        assert!(config.stdin_data.is_none());
    }
}
