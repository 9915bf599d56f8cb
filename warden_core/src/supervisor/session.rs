use super::process::{CallError, WorkerProcess};
use super::{SessionKey, SupervisorConfig, SupervisorError};
use crate::error::WorkerError;
use crate::protocol::{CommandKind, RequestBody, ResponseBody};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// One live worker bound to the key it was configured with.
///
/// The key is applied once at startup and never changes; a different key
/// gets a different session.
pub struct WorkerSession {
    key: SessionKey,
    process: WorkerProcess,
    stop_grace: Duration,
    usable: AtomicBool,
    closed: AtomicBool,
}

impl WorkerSession {
    /// Spawns a worker and runs the setup commands for `key`. A failed
    /// setup releases the worker before returning.
    pub fn start(
        key: SessionKey,
        config: &SupervisorConfig,
        command: CommandKind,
        context: &str,
    ) -> Result<Self, SupervisorError> {
        let argv = config.worker_argv();
        let process = WorkerProcess::spawn(&argv, config.working_dir.as_deref()).map_err(|e| {
            SupervisorError::Spawn {
                command,
                context: context.to_string(),
                reason: format!("{}: {e}", argv.join(" ")),
            }
        })?;
        let session = Self {
            key,
            process,
            stop_grace: config.stop_grace,
            usable: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        };

        let classpath = &session.key.classpath;
        session.call(
            RequestBody::AddPaths {
                user_paths: classpath.user_paths.iter().map(|p| p.display().to_string()).collect(),
                dependency_paths: classpath
                    .dependency_paths
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect(),
            },
            config.setup_timeout,
        )?;
        session.call(
            RequestBody::SetInstrumentation {
                kind: session.key.kind,
            },
            config.setup_timeout,
        )?;
        if config.warmup_on_start {
            session.call(RequestBody::Warmup, config.setup_timeout)?;
        }

        log::info!(
            "worker {} ready with {} instrumentation over {} user path(s)",
            session.pid(),
            session.key.kind,
            classpath.user_paths.len()
        );
        Ok(session)
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    /// False once the worker timed out or was closed, and once its process
    /// is gone for any reason, including an idle exit.
    pub fn is_usable(&self) -> bool {
        self.usable.load(Ordering::Acquire) && self.process.is_alive()
    }

    pub fn call(&self, body: RequestBody, timeout: Duration) -> Result<ResponseBody, SupervisorError> {
        let command = body.kind();
        let context = body.context();
        match self.process.call(body, timeout) {
            Ok(ResponseBody::Error(source)) => {
                if matches!(source, WorkerError::Internal(_)) {
                    self.usable.store(false, Ordering::Release);
                }
                Err(SupervisorError::Worker {
                    command,
                    context,
                    source,
                })
            }
            Ok(body) if body.answers(command) => Ok(body),
            Ok(body) => Err(SupervisorError::ProtocolViolation {
                command,
                context,
                detail: format!("unexpected {} response", body.name()),
            }),
            Err(CallError::Timeout(timeout)) => {
                self.usable.store(false, Ordering::Release);
                let status = self.process.kill();
                log::warn!(
                    "worker {} timed out on {command} {context} after {timeout:?}, killed ({status})",
                    self.pid()
                );
                Err(SupervisorError::WorkerTimeout {
                    command,
                    context,
                    timeout,
                })
            }
            Err(CallError::Disconnected) => {
                self.usable.store(false, Ordering::Release);
                let status = self.process.reap(self.stop_grace);
                log::error!("worker {} died during {command} {context}: {status}", self.pid());
                Err(SupervisorError::WorkerCrash {
                    command,
                    context,
                    status,
                })
            }
            Err(CallError::Transport(reason)) => Err(SupervisorError::Transport {
                command,
                context,
                reason,
            }),
        }
    }

    /// Stops the worker gracefully, force-killing it after the grace period.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.usable.store(false, Ordering::Release);
        let status = self.process.shutdown(self.stop_grace);
        log::info!("worker {} closed: {status}", self.pid());
    }
}

impl Drop for WorkerSession {
    fn drop(&mut self) {
        self.close();
    }
}
