//! Subprocess worker implementation.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::output::extract_trailing_json;
use crate::progress::parse_line;
use dubflow_config::RuntimeProfiles;
use dubflow_core::worker::{CancelToken, Worker, WorkerJob, WorkerProgress};
use dubflow_core::{Error, Result};

/// How many trailing stderr lines are kept for error reporting.
const STDERR_TAIL_LINES: usize = 40;

/// Invokes external workers as subprocesses selected by per-stage runtime
/// profiles.
pub struct SubprocessWorker {
    profiles: RuntimeProfiles,
    grace: Duration,
}

impl SubprocessWorker {
    pub fn new(profiles: RuntimeProfiles) -> Self {
        Self {
            profiles,
            grace: Duration::from_secs(10),
        }
    }

    /// Override the terminate-to-kill grace period.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Terminate, wait out the grace period, then force-kill.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!("worker ignored terminate signal, killing");
                let _ = child.kill().await;
            }
        }
    }
}

enum Exit {
    Finished(std::process::ExitStatus),
    Cancelled,
    TimedOut,
}

#[async_trait]
impl Worker for SubprocessWorker {
    fn name(&self) -> &'static str {
        "subprocess"
    }

    async fn invoke(
        &self,
        job: WorkerJob,
        progress: mpsc::Sender<WorkerProgress>,
        cancel: CancelToken,
    ) -> Result<Value> {
        let profile = self.profiles.profile(job.stage).ok_or_else(|| {
            Error::WorkerUnavailable(format!("no runtime profile for stage {}", job.stage))
        })?;

        if let Some(parent) = job.request_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&job.request_path, serde_json::to_vec_pretty(&job.request)?).await?;

        let mut command = Command::new(&profile.command);
        command
            .args(&profile.args)
            .arg(&job.request_path)
            .envs(&profile.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &profile.working_dir {
            command.current_dir(dir);
        }

        info!(task_id = %job.task_id, language = %job.language, stage = %job.stage,
            command = %profile.command.display(), "spawning worker");

        let mut child = command.spawn().map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                Error::WorkerUnavailable(format!("{}: {err}", profile.command.display()))
            }
            _ => Error::Internal(err.to_string()),
        })?;

        // Both pipes are drained concurrently. Draining them one after the
        // other deadlocks once either pipe buffer fills.
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("worker stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("worker stderr not captured".to_string()))?;

        let stdout_task = tokio::spawn(drain_stream(stdout, progress.clone(), StreamRole::Stdout));
        let stderr_task = tokio::spawn(drain_stream(stderr, progress, StreamRole::Stderr));

        let exit = tokio::select! {
            status = child.wait() => Exit::Finished(status.map_err(|e| Error::Internal(e.to_string()))?),
            _ = cancel.cancelled() => Exit::Cancelled,
            _ = tokio::time::sleep(job.timeout) => Exit::TimedOut,
        };

        let exit = match exit {
            Exit::Finished(status) => Ok(status),
            Exit::Cancelled => {
                info!(task_id = %job.task_id, stage = %job.stage, "cancel requested, terminating worker");
                self.terminate(&mut child).await;
                Err(Error::Cancelled)
            }
            Exit::TimedOut => {
                warn!(task_id = %job.task_id, stage = %job.stage,
                    timeout_secs = job.timeout.as_secs(), "worker exceeded wall-clock limit");
                self.terminate(&mut child).await;
                Err(Error::Timeout(format!(
                    "{} exceeded {}s",
                    job.stage,
                    job.timeout.as_secs()
                )))
            }
        };

        let stdout_text = stdout_task.await.unwrap_or_default();
        let stderr_tail = stderr_task.await.unwrap_or_default();
        let status = exit?;

        if !status.success() {
            return Err(Error::WorkerFailed(format!(
                "{} worker exited with {}: {}",
                job.stage,
                status.code().map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()),
                stderr_tail.trim()
            )));
        }

        extract_trailing_json(&stdout_text).ok_or_else(|| {
            Error::WorkerFailed(format!("{} worker produced no result", job.stage))
        })
    }
}

#[derive(Clone, Copy)]
enum StreamRole {
    Stdout,
    Stderr,
}

/// Drain one pipe line by line (lossy UTF-8), forwarding progress
/// observations. Returns the full stdout text, or the stderr tail.
async fn drain_stream(
    stream: impl AsyncRead + Unpin,
    progress: mpsc::Sender<WorkerProgress>,
    role: StreamRole,
) -> String {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut stdout_text = String::new();
    let mut tail: VecDeque<String> = VecDeque::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                debug!(line, "worker output");

                if let Some(observation) = parse_line(line) {
                    let _ = progress.try_send(observation);
                }

                match role {
                    StreamRole::Stdout => {
                        stdout_text.push_str(line);
                        stdout_text.push('\n');
                    }
                    StreamRole::Stderr => {
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line.to_string());
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "worker pipe read failed");
                break;
            }
        }
    }

    match role {
        StreamRole::Stdout => stdout_text,
        StreamRole::Stderr => tail.into_iter().collect::<Vec<_>>().join("\n"),
    }
}
