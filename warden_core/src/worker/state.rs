use crate::protocol::CommandKind;
use std::fmt;
use thiserror::Error;

/// Lifecycle phase of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Idle,
    PathsConfigured,
    InstrumentationInstalled,
    WarmedUp,
    Ready,
    Busy,
    Crashed,
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{command} is not allowed while the worker is {phase}")]
pub struct PhaseViolation {
    pub command: CommandKind,
    pub phase: WorkerPhase,
}

/// Enforces the command order of the worker protocol.
///
/// `admit` is called by the reader before a command is queued and applies
/// the transitions of configuration commands immediately, so commands read
/// back to back are judged against the phase they will actually run in.
/// `complete` is called by the executor after a command ran and before its
/// response is written.
#[derive(Debug)]
pub struct PhaseMachine {
    phase: WorkerPhase,
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self {
            phase: WorkerPhase::Idle,
        }
    }

    pub fn phase(&self) -> WorkerPhase {
        self.phase
    }

    pub fn is_busy(&self) -> bool {
        self.phase == WorkerPhase::Busy
    }

    pub fn admit(&mut self, command: CommandKind) -> Result<(), PhaseViolation> {
        use WorkerPhase::*;
        let violation = Err(PhaseViolation {
            command,
            phase: self.phase,
        });
        if command == CommandKind::StopProcess {
            return Ok(());
        }
        if matches!(self.phase, Busy | Crashed) {
            return violation;
        }
        let next = match (command, self.phase) {
            (CommandKind::AddPaths, Idle) => PathsConfigured,
            (CommandKind::AddPaths, phase) => phase,
            (CommandKind::SetInstrumentation, PathsConfigured) => InstrumentationInstalled,
            (CommandKind::Warmup, InstrumentationInstalled) => WarmedUp,
            (CommandKind::Warmup, phase @ (WarmedUp | Ready)) => phase,
            (CommandKind::InvokeMethod, InstrumentationInstalled | WarmedUp | Ready) => Busy,
            (CommandKind::CollectCoverage, phase) => phase,
            (CommandKind::ComputeStaticField, phase) if phase != Idle => phase,
            _ => return violation,
        };
        self.phase = next;
        Ok(())
    }

    pub fn complete(&mut self, command: CommandKind) {
        if command == CommandKind::InvokeMethod && self.phase == WorkerPhase::Busy {
            self.phase = WorkerPhase::Ready;
        }
    }

    pub fn crash(&mut self) {
        self.phase = WorkerPhase::Crashed;
    }
}
