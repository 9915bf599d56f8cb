//! The worker side of the protocol: phase machine, command handler and the
//! reader/executor server loop run by `warden-worker`.

pub mod handler;
pub mod server;
pub mod state;

pub use handler::{Disposition, WorkerHandler};
pub use server::{CRASH_EXIT_CODE, ServeOutcome, ServerConfig, serve};
pub use state::{PhaseMachine, PhaseViolation, WorkerPhase};
