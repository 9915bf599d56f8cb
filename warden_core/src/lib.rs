pub mod config;
pub mod coverage;
pub mod error;
pub mod executor;
pub mod instrument;
pub mod loader;
pub mod protocol;
pub mod runtime;
pub mod supervisor;
pub mod unit;
pub mod value;
pub mod vm;
pub mod worker;

pub use config::WardenConfig;
pub use coverage::{CoverageCollector, CoverageInfo};
pub use error::{DispatchError, ProbeAccessError, TransformError, WorkerError};
pub use executor::{ExecutionResult, InvocationExecutor, StaticEnvironment, TargetFault};
pub use instrument::{InstrumentationKind, InstrumentationStrategy, IndexRange, ProbeLayout, Rewriter};
pub use loader::{LoadError, UnitLoader};
pub use protocol::{CommandKind, Request, RequestBody, Response, ResponseBody, WireError};
pub use supervisor::{Classpath, SessionKey, Supervisor, SupervisorConfig, SupervisorError};
pub use unit::{ClassFile, FieldDef, Insn, MethodDef, Visibility};
pub use value::{Value, ValueType};
pub use worker::{ServeOutcome, ServerConfig, serve};

use std::sync::{Mutex, MutexGuard, PoisonError};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
