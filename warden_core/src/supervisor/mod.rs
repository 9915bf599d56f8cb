//! Client side: spawns workers, correlates requests and recovers from
//! timeouts and crashes.

pub mod process;
pub mod session;

pub use process::{CallError, WorkerProcess, describe_exit};
pub use session::WorkerSession;

use crate::coverage::CoverageInfo;
use crate::error::WorkerError;
use crate::executor::{ExecutionResult, StaticEnvironment};
use crate::instrument::InstrumentationKind;
use crate::lock;
use crate::protocol::{CommandKind, FieldDescriptor, InvokeRequest, RequestBody, ResponseBody};
use crate::value::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("{command} [{context}] failed in the worker: {source}")]
    Worker {
        command: CommandKind,
        context: String,
        source: WorkerError,
    },

    #[error("{command} [{context}] protocol violation: {detail}")]
    ProtocolViolation {
        command: CommandKind,
        context: String,
        detail: String,
    },

    #[error("{command} [{context}] worker crashed: {status}")]
    WorkerCrash {
        command: CommandKind,
        context: String,
        status: String,
    },

    #[error("{command} [{context}] worker timed out after {timeout:?}")]
    WorkerTimeout {
        command: CommandKind,
        context: String,
        timeout: Duration,
    },

    #[error("{command} [{context}] could not spawn a worker: {reason}")]
    Spawn {
        command: CommandKind,
        context: String,
        reason: String,
    },

    #[error("{command} [{context}] transport error: {reason}")]
    Transport {
        command: CommandKind,
        context: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Program and leading arguments of the worker.
    pub worker_command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub request_timeout: Duration,
    /// Budget for each setup command sent when a worker starts.
    pub setup_timeout: Duration,
    pub stop_grace: Duration,
    pub max_sessions: usize,
    pub warmup_on_start: bool,
    pub worker_idle_timeout: Option<Duration>,
    pub max_call_depth: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_command: vec!["warden-worker".to_string()],
            working_dir: None,
            request_timeout: Duration::from_millis(2000),
            setup_timeout: Duration::from_millis(10_000),
            stop_grace: Duration::from_millis(500),
            max_sessions: 1,
            warmup_on_start: false,
            worker_idle_timeout: Some(Duration::from_millis(120_000)),
            max_call_depth: 256,
        }
    }
}

impl SupervisorConfig {
    pub fn worker_argv(&self) -> Vec<String> {
        let idle_ms = self
            .worker_idle_timeout
            .map_or(0, |timeout| timeout.as_millis().max(1));
        let mut argv = self.worker_command.clone();
        argv.extend([
            "--idle-timeout-ms".to_string(),
            idle_ms.to_string(),
            "--max-call-depth".to_string(),
            self.max_call_depth.to_string(),
        ]);
        argv
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Classpath {
    pub user_paths: Vec<PathBuf>,
    pub dependency_paths: Vec<PathBuf>,
}

/// Identifies a worker configuration. Equal keys share one worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub classpath: Classpath,
    pub kind: InstrumentationKind,
}

impl SessionKey {
    pub fn new(classpath: Classpath, kind: InstrumentationKind) -> Self {
        Self { classpath, kind }
    }
}

type Slot = Arc<Mutex<Option<Arc<WorkerSession>>>>;

/// Pool of worker sessions keyed by [`SessionKey`].
///
/// The slot list is ordered least recently used first. Its mutex only
/// guards membership; starting a worker happens under the key's own slot
/// mutex so concurrent first use of one key spawns one worker while other
/// keys proceed.
pub struct Supervisor {
    config: SupervisorConfig,
    slots: Mutex<Vec<(SessionKey, Slot)>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            slots: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Sends `body` to the worker for `key`, starting one if needed.
    pub fn request(
        &self,
        key: &SessionKey,
        body: RequestBody,
        timeout: Duration,
    ) -> Result<ResponseBody, SupervisorError> {
        let session = self.session(key, body.kind(), &body.context())?;
        let result = session.call(body, timeout);
        if !session.is_usable() {
            self.invalidate(key, &session);
        }
        result
    }

    pub fn invoke(
        &self,
        key: &SessionKey,
        unit: &str,
        member: &str,
        args: Vec<Value>,
        env: StaticEnvironment,
    ) -> Result<ExecutionResult, SupervisorError> {
        let body = RequestBody::InvokeMethod(InvokeRequest {
            unit: unit.to_string(),
            member: member.to_string(),
            args,
            env,
        });
        let context = body.context();
        match self.request(key, body, self.config.request_timeout)? {
            ResponseBody::Invocation(result) => Ok(result),
            other => Err(unexpected(CommandKind::InvokeMethod, context, &other)),
        }
    }

    pub fn collect_coverage(&self, key: &SessionKey, unit: &str) -> Result<CoverageInfo, SupervisorError> {
        let body = RequestBody::CollectCoverage {
            unit: unit.to_string(),
        };
        match self.request(key, body, self.config.request_timeout)? {
            ResponseBody::Coverage(info) => Ok(info),
            other => Err(unexpected(CommandKind::CollectCoverage, unit.to_string(), &other)),
        }
    }

    pub fn compute_static_field(
        &self,
        key: &SessionKey,
        unit: &str,
        field: &str,
    ) -> Result<Value, SupervisorError> {
        let body = RequestBody::ComputeStaticField(FieldDescriptor {
            unit: unit.to_string(),
            field: field.to_string(),
        });
        let context = body.context();
        match self.request(key, body, self.config.request_timeout)? {
            ResponseBody::StaticValue(value) => Ok(value),
            other => Err(unexpected(CommandKind::ComputeStaticField, context, &other)),
        }
    }

    pub fn warmup(&self, key: &SessionKey) -> Result<(), SupervisorError> {
        match self.request(key, RequestBody::Warmup, self.config.setup_timeout)? {
            ResponseBody::Ack => Ok(()),
            other => Err(unexpected(CommandKind::Warmup, String::new(), &other)),
        }
    }

    /// Pid of the live worker for `key`, if there is one.
    pub fn worker_pid(&self, key: &SessionKey) -> Option<u32> {
        let slot = self.slot_for(key)?;
        let guard = lock(&slot);
        guard.as_ref().filter(|s| s.is_usable()).map(|s| s.pid())
    }

    pub fn live_sessions(&self) -> usize {
        let slots: Vec<Slot> = lock(&self.slots).iter().map(|(_, slot)| Arc::clone(slot)).collect();
        slots
            .iter()
            .filter(|slot| lock(slot).as_ref().is_some_and(|s| s.is_usable()))
            .count()
    }

    /// Closes every session.
    pub fn close(&self) {
        let slots: Vec<(SessionKey, Slot)> = lock(&self.slots).drain(..).collect();
        for (_, slot) in slots {
            let session = lock(&slot).take();
            if let Some(session) = session {
                session.close();
            }
        }
    }

    fn slot_for(&self, key: &SessionKey) -> Option<Slot> {
        lock(&self.slots)
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, slot)| Arc::clone(slot))
    }

    fn session(
        &self,
        key: &SessionKey,
        command: CommandKind,
        context: &str,
    ) -> Result<Arc<WorkerSession>, SupervisorError> {
        let (slot, evicted) = {
            let mut slots = lock(&self.slots);
            let entry = match slots.iter().position(|(k, _)| k == key) {
                Some(index) => slots.remove(index),
                None => (key.clone(), Arc::new(Mutex::new(None))),
            };
            let slot = Arc::clone(&entry.1);
            slots.push(entry);
            let excess = slots.len().saturating_sub(self.config.max_sessions.max(1));
            let evicted: Vec<(SessionKey, Slot)> = slots.drain(..excess).collect();
            (slot, evicted)
        };
        for (old_key, old_slot) in evicted {
            let session = lock(&old_slot).take();
            if let Some(session) = session {
                log::info!("evicting worker {} for {:?}", session.pid(), old_key.kind);
                session.close();
            }
        }

        let mut guard = lock(&slot);
        if let Some(session) = guard.as_ref() {
            if session.is_usable() {
                return Ok(Arc::clone(session));
            }
        }
        if let Some(stale) = guard.take() {
            log::debug!("replacing worker {} for {:?}", stale.pid(), key.kind);
            stale.close();
        }
        let session = Arc::new(WorkerSession::start(key.clone(), &self.config, command, context)?);
        *guard = Some(Arc::clone(&session));
        Ok(session)
    }

    fn invalidate(&self, key: &SessionKey, session: &Arc<WorkerSession>) {
        let Some(slot) = self.slot_for(key) else {
            return;
        };
        let stale = {
            let mut guard = lock(&slot);
            match guard.as_ref() {
                Some(current) if Arc::ptr_eq(current, session) => guard.take(),
                _ => None,
            }
        };
        if let Some(stale) = stale {
            log::info!("discarding worker {}", stale.pid());
            stale.close();
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.close();
    }
}

fn unexpected(command: CommandKind, context: String, body: &ResponseBody) -> SupervisorError {
    SupervisorError::ProtocolViolation {
        command,
        context,
        detail: format!("unexpected {} response", body.name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(kind: InstrumentationKind) -> SessionKey {
        SessionKey::new(
            Classpath {
                user_paths: vec![PathBuf::from("units")],
                dependency_paths: vec![],
            },
            kind,
        )
    }

    #[test]
    fn worker_argv_carries_limits() {
        let config = SupervisorConfig {
            worker_command: vec!["/bin/warden-worker".into(), "--quiet".into()],
            worker_idle_timeout: None,
            max_call_depth: 64,
            ..SupervisorConfig::default()
        };
        assert_eq!(
            config.worker_argv(),
            vec![
                "/bin/warden-worker",
                "--quiet",
                "--idle-timeout-ms",
                "0",
                "--max-call-depth",
                "64"
            ]
        );
    }

    #[test]
    fn keys_differ_by_kind_and_paths() {
        let branch = key(InstrumentationKind::BranchCoverage);
        assert_eq!(branch, key(InstrumentationKind::BranchCoverage));
        assert_ne!(branch, key(InstrumentationKind::Invoke));
        let mut other = branch.clone();
        other.classpath.dependency_paths.push(PathBuf::from("lib"));
        assert_ne!(branch, other);
    }

    #[test]
    fn spawn_failure_carries_the_command() {
        let supervisor = Supervisor::new(SupervisorConfig {
            worker_command: vec!["/nonexistent/warden-worker".into()],
            ..SupervisorConfig::default()
        });
        let err = supervisor
            .collect_coverage(&key(InstrumentationKind::BranchCoverage), "demo.Calc")
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { command: CommandKind::CollectCoverage, .. }));
        assert_eq!(supervisor.live_sessions(), 0);
    }
}
