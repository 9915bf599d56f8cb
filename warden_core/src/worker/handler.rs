use crate::error::WorkerError;
use crate::executor::{InvocationExecutor, InvocationOutcome};
use crate::instrument::{self, InstrumentationStrategy};
use crate::loader::{LoadError, UnitLoader};
use crate::protocol::{FieldDescriptor, RequestBody, ResponseBody};
use crate::runtime::FieldAccessor;
use crate::vm::ExecutionLimits;
use std::path::PathBuf;
use std::rc::Rc;

/// What the server does after a command was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Reply(ResponseBody),
    /// Target code halted the process. No response is written.
    Exit(i32),
}

impl From<Result<ResponseBody, WorkerError>> for Disposition {
    fn from(result: Result<ResponseBody, WorkerError>) -> Self {
        Disposition::Reply(result.unwrap_or_else(ResponseBody::Error))
    }
}

fn fail(err: impl Into<WorkerError>) -> Disposition {
    Disposition::Reply(ResponseBody::Error(err.into()))
}

/// Executes admitted commands against the worker's unit loader.
///
/// Lives on the executor thread for the whole life of the worker. Phase
/// checks happen before a command reaches it; the checks left here depend
/// on the handler's own state.
pub struct WorkerHandler {
    loader: UnitLoader,
    strategy: Option<Rc<dyn InstrumentationStrategy>>,
    executor: InvocationExecutor,
    warmed_up: bool,
}

impl WorkerHandler {
    pub fn new(limits: ExecutionLimits) -> Self {
        Self {
            loader: UnitLoader::new(limits),
            strategy: None,
            executor: InvocationExecutor::new(),
            warmed_up: false,
        }
    }

    pub fn loader(&self) -> &UnitLoader {
        &self.loader
    }

    pub fn handle(&mut self, body: &RequestBody) -> Disposition {
        match body {
            RequestBody::AddPaths {
                user_paths,
                dependency_paths,
            } => {
                self.loader.add_paths(
                    user_paths.iter().map(PathBuf::from),
                    dependency_paths.iter().map(PathBuf::from),
                );
                log::debug!(
                    "paths now {} user, {} dependency",
                    self.loader.user_paths().len(),
                    self.loader.dependency_paths().len()
                );
                Disposition::Reply(ResponseBody::Ack)
            }
            RequestBody::SetInstrumentation { kind } => {
                if let Some(installed) = &self.strategy {
                    return fail(WorkerError::ProtocolViolation(format!(
                        "{} instrumentation is already installed",
                        installed.kind()
                    )));
                }
                let strategy = instrument::create(*kind);
                self.loader.install_hook(Rc::clone(&strategy));
                self.strategy = Some(strategy);
                log::info!("installed {kind} instrumentation");
                Disposition::Reply(ResponseBody::Ack)
            }
            RequestBody::Warmup => self.warmup(),
            RequestBody::InvokeMethod(invoke) => {
                match self.executor.invoke(
                    &mut self.loader,
                    &invoke.unit,
                    &invoke.member,
                    &invoke.args,
                    &invoke.env,
                ) {
                    Ok(InvocationOutcome::Completed(result)) => {
                        Disposition::Reply(ResponseBody::Invocation(result))
                    }
                    Ok(InvocationOutcome::Exit(code)) => Disposition::Exit(code),
                    Err(e) => fail(e),
                }
            }
            RequestBody::CollectCoverage { unit } => self.collect_coverage(body, unit),
            RequestBody::ComputeStaticField(field) => self.compute_static_field(field),
            RequestBody::StopProcess => Disposition::Reply(ResponseBody::Ack),
        }
    }

    fn warmup(&mut self) -> Disposition {
        if self.warmed_up {
            log::debug!("warmup already happened");
            return Disposition::Reply(ResponseBody::Ack);
        }
        let names = self.loader.discover();
        let mut loaded = 0;
        for name in &names {
            match self.loader.load(name) {
                Ok(_) => loaded += 1,
                Err(LoadError::Exited { unit, code }) => {
                    log::warn!("initializer of {unit} halted during warmup");
                    return Disposition::Exit(code);
                }
                Err(e) => log::warn!("warmup skipped {name}: {e}"),
            }
        }
        self.warmed_up = true;
        log::info!("warmup loaded {loaded} of {} units", names.len());
        Disposition::Reply(ResponseBody::Ack)
    }

    fn collect_coverage(&mut self, body: &RequestBody, unit: &str) -> Disposition {
        let Some(strategy) = self.strategy.clone() else {
            return fail(WorkerError::ProtocolViolation(
                "no instrumentation is installed".to_string(),
            ));
        };
        match self.loader.load(unit) {
            Ok(_) => {}
            Err(LoadError::Exited { code, .. }) => return Disposition::Exit(code),
            Err(e) => return fail(e),
        }
        match strategy.handle(body, &mut self.loader) {
            Some(result) => result.into(),
            None => fail(WorkerError::ProtocolViolation(format!(
                "{} instrumentation does not collect coverage",
                strategy.kind()
            ))),
        }
    }

    fn compute_static_field(&mut self, field: &FieldDescriptor) -> Disposition {
        let unit = match self.loader.load(&field.unit) {
            Ok(unit) => unit,
            Err(LoadError::Exited { code, .. }) => return Disposition::Exit(code),
            Err(e) => return fail(e),
        };
        let read = unit
            .grant_access(&field.field)
            .and_then(|_access| unit.read_static(&field.field));
        match read {
            Ok(value) => Disposition::Reply(ResponseBody::StaticValue(value.to_value())),
            Err(e) => fail(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DispatchError, ProbeAccessError};
    use crate::executor::{ExecutionResult, StaticEnvironment};
    use crate::instrument::{InstrumentationKind, PROBE_FIELD};
    use crate::loader::tests::write_unit;
    use crate::protocol::InvokeRequest;
    use crate::unit::tests::{calc_unit, method};
    use crate::unit::{ClassFile, INITIALIZER_NAME, Insn};
    use crate::value::{Value, ValueType};
    use tempfile::{TempDir, tempdir};

    fn configured(kind: InstrumentationKind, units: &[ClassFile]) -> (TempDir, WorkerHandler) {
        let dir = tempdir().unwrap();
        for unit in units {
            write_unit(dir.path(), unit);
        }
        let mut handler = WorkerHandler::new(ExecutionLimits::default());
        let add = RequestBody::AddPaths {
            user_paths: vec![dir.path().display().to_string()],
            dependency_paths: vec![],
        };
        assert_eq!(handler.handle(&add), Disposition::Reply(ResponseBody::Ack));
        assert_eq!(
            handler.handle(&RequestBody::SetInstrumentation { kind }),
            Disposition::Reply(ResponseBody::Ack)
        );
        (dir, handler)
    }

    fn invoke(unit: &str, member: &str, args: Vec<Value>) -> RequestBody {
        RequestBody::InvokeMethod(InvokeRequest {
            unit: unit.into(),
            member: member.into(),
            args,
            env: StaticEnvironment::default(),
        })
    }

    fn reply(disposition: Disposition) -> ResponseBody {
        match disposition {
            Disposition::Reply(body) => body,
            Disposition::Exit(code) => panic!("unexpected exit {code}"),
        }
    }

    #[test]
    fn invoke_then_collect_reports_the_executed_member() {
        let (_dir, mut handler) = configured(InstrumentationKind::BranchCoverage, &[calc_unit()]);
        let result = reply(handler.handle(&invoke("demo.Calc", "add(II)I", vec![Value::Int(2), Value::Int(3)])));
        assert_eq!(result, ResponseBody::Invocation(ExecutionResult::Success(Value::Int(5))));

        let collect = RequestBody::CollectCoverage {
            unit: "demo.Calc".into(),
        };
        let ResponseBody::Coverage(info) = reply(handler.handle(&collect)) else {
            panic!("expected coverage");
        };
        assert!(!info.visited_in("add(II)I").is_empty());
        assert!(info.visited_in("abs(I)I").is_empty());
    }

    #[test]
    fn collect_before_any_invocation_is_empty() {
        let (_dir, mut handler) = configured(InstrumentationKind::InstructionCoverage, &[calc_unit()]);
        let collect = RequestBody::CollectCoverage {
            unit: "demo.Calc".into(),
        };
        let ResponseBody::Coverage(info) = reply(handler.handle(&collect)) else {
            panic!("expected coverage");
        };
        assert!(info.is_empty());
    }

    #[test]
    fn invoke_strategy_does_not_collect_coverage() {
        let (_dir, mut handler) = configured(InstrumentationKind::Invoke, &[calc_unit()]);
        let collect = RequestBody::CollectCoverage {
            unit: "demo.Calc".into(),
        };
        assert!(matches!(
            reply(handler.handle(&collect)),
            ResponseBody::Error(WorkerError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn collecting_a_dependency_unit_is_a_probe_access_error() {
        let dir = tempdir().unwrap();
        write_unit(dir.path(), &calc_unit());
        let mut handler = WorkerHandler::new(ExecutionLimits::default());
        handler.handle(&RequestBody::AddPaths {
            user_paths: vec![],
            dependency_paths: vec![dir.path().display().to_string()],
        });
        handler.handle(&RequestBody::SetInstrumentation {
            kind: InstrumentationKind::BranchCoverage,
        });
        let collect = RequestBody::CollectCoverage {
            unit: "demo.Calc".into(),
        };
        assert!(matches!(
            reply(handler.handle(&collect)),
            ResponseBody::Error(WorkerError::ProbeAccess(ProbeAccessError::NotInstrumented { .. }))
        ));
    }

    #[test]
    fn second_instrumentation_is_rejected() {
        let (_dir, mut handler) = configured(InstrumentationKind::BranchCoverage, &[]);
        let again = RequestBody::SetInstrumentation {
            kind: InstrumentationKind::Invoke,
        };
        assert!(matches!(
            reply(handler.handle(&again)),
            ResponseBody::Error(WorkerError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn warmup_loads_every_user_unit_once() {
        let other = ClassFile {
            name: "demo.util.Other".into(),
            fields: vec![],
            methods: vec![method("f", vec![], ValueType::Void, vec![Insn::Return])],
        };
        let (_dir, mut handler) = configured(InstrumentationKind::BranchCoverage, &[calc_unit(), other]);
        assert_eq!(handler.handle(&RequestBody::Warmup), Disposition::Reply(ResponseBody::Ack));
        assert_eq!(handler.loader().loaded_count(), 2);
        assert_eq!(handler.handle(&RequestBody::Warmup), Disposition::Reply(ResponseBody::Ack));
    }

    #[test]
    fn static_field_is_read_without_leaving_it_accessible() {
        let (_dir, mut handler) = configured(InstrumentationKind::Invoke, &[calc_unit()]);
        let read = RequestBody::ComputeStaticField(FieldDescriptor {
            unit: "demo.Calc".into(),
            field: "counter".into(),
        });
        assert_eq!(reply(handler.handle(&read)), ResponseBody::StaticValue(Value::Int(0)));
        let unit = handler.loader().loaded("demo.Calc").unwrap();
        assert!(!unit.is_accessible("counter").unwrap());

        let missing = RequestBody::ComputeStaticField(FieldDescriptor {
            unit: "demo.Calc".into(),
            field: "nope".into(),
        });
        assert!(matches!(
            reply(handler.handle(&missing)),
            ResponseBody::Error(WorkerError::Dispatch(DispatchError::FieldNotFound { .. }))
        ));
    }

    #[test]
    fn coverage_field_is_out_of_reach_of_callers() {
        let (_dir, mut handler) = configured(InstrumentationKind::BranchCoverage, &[calc_unit()]);
        let read = RequestBody::ComputeStaticField(FieldDescriptor {
            unit: "demo.Calc".into(),
            field: PROBE_FIELD.into(),
        });
        assert!(matches!(
            reply(handler.handle(&read)),
            ResponseBody::Error(WorkerError::Dispatch(DispatchError::FieldInaccessible { .. }))
        ));

        let clobber = RequestBody::InvokeMethod(InvokeRequest {
            unit: "demo.Calc".into(),
            member: "add(II)I".into(),
            args: vec![Value::Int(1), Value::Int(2)],
            env: StaticEnvironment::default().with("demo.Calc", PROBE_FIELD, Value::Null),
        });
        assert!(matches!(
            reply(handler.handle(&clobber)),
            ResponseBody::Error(WorkerError::Dispatch(DispatchError::FieldInaccessible { .. }))
        ));

        let result = reply(handler.handle(&invoke("demo.Calc", "add(II)I", vec![Value::Int(1), Value::Int(2)])));
        assert_eq!(result, ResponseBody::Invocation(ExecutionResult::Success(Value::Int(3))));
        let collect = RequestBody::CollectCoverage {
            unit: "demo.Calc".into(),
        };
        let ResponseBody::Coverage(info) = reply(handler.handle(&collect)) else {
            panic!("expected coverage");
        };
        assert!(!info.visited_in("add(II)I").is_empty());
    }

    #[test]
    fn halting_initializer_exits_the_worker() {
        let halting = ClassFile {
            name: "demo.Quit".into(),
            fields: vec![],
            methods: vec![
                method(INITIALIZER_NAME, vec![], ValueType::Void, vec![Insn::PushInt(3), Insn::Halt]),
                method("f", vec![], ValueType::Void, vec![Insn::Return]),
            ],
        };
        let (_dir, mut handler) = configured(InstrumentationKind::Invoke, &[halting]);
        assert_eq!(handler.handle(&invoke("demo.Quit", "f()V", vec![])), Disposition::Exit(3));
    }
}
