use crate::error::{DispatchError, WorkerError};
use crate::loader::{LoadError, UnitLoader};
use crate::runtime::{FieldAccessor, LoadedUnit, MemberInvoker, RtValue};
use crate::value::Value;
use crate::vm::{Completion, Machine};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::rc::Rc;

/// A fault raised by target code. This is data, not an infrastructure error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct TargetFault {
    pub kind: String,
    pub message: String,
    /// Innermost frame first, `unit.member@pc`.
    pub trace: Vec<String>,
}

impl fmt::Display for TargetFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(&self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum ExecutionResult {
    Success(Value),
    Failure(TargetFault),
}

impl ExecutionResult {
    pub fn fault(&self) -> Option<&TargetFault> {
        match self {
            ExecutionResult::Success(_) => None,
            ExecutionResult::Failure(f) => Some(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct StaticBinding {
    pub unit: String,
    pub field: String,
    pub value: Value,
}

/// Static field values written, in order, right before a call.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, Encode, Decode)]
pub struct StaticEnvironment {
    pub bindings: Vec<StaticBinding>,
}

impl StaticEnvironment {
    pub fn with(mut self, unit: &str, field: &str, value: Value) -> Self {
        self.bindings.push(StaticBinding {
            unit: unit.to_string(),
            field: field.to_string(),
            value,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    Completed(ExecutionResult),
    /// Target code asked the hosting process to exit.
    Exit(i32),
}

enum Resolved {
    Unit(Rc<LoadedUnit>),
    Done(InvocationOutcome),
}

#[derive(Debug, Default)]
pub struct InvocationExecutor;

impl InvocationExecutor {
    pub fn new() -> Self {
        Self
    }

    pub fn invoke(
        &self,
        loader: &mut UnitLoader,
        unit_name: &str,
        member: &str,
        args: &[Value],
        env: &StaticEnvironment,
    ) -> Result<InvocationOutcome, WorkerError> {
        let unit = match resolve(loader, unit_name)? {
            Resolved::Unit(unit) => unit,
            Resolved::Done(outcome) => return Ok(outcome),
        };

        let (index, method) = unit
            .class()
            .find_method(member)
            .filter(|(_, m)| !m.is_initializer())
            .ok_or_else(|| DispatchError::MemberNotFound {
                unit: unit_name.to_string(),
                member: member.to_string(),
            })?;
        if args.len() != method.params.len() {
            return Err(DispatchError::ArityMismatch {
                member: member.to_string(),
                expected: method.params.len(),
                found: args.len(),
            }
            .into());
        }
        for (position, (arg, ty)) in args.iter().zip(&method.params).enumerate() {
            if !arg.conforms_to(*ty) {
                return Err(DispatchError::ArgumentType {
                    member: member.to_string(),
                    index: position,
                    expected: *ty,
                    found: arg.type_name().to_string(),
                }
                .into());
            }
        }

        // Every binding is checked before the first one is written, so a
        // rejected call leaves static state untouched.
        let mut writes = Vec::with_capacity(env.bindings.len());
        for binding in &env.bindings {
            let owner = match resolve(loader, &binding.unit)? {
                Resolved::Unit(owner) => owner,
                Resolved::Done(outcome) => return Ok(outcome),
            };
            let value = {
                let _access = owner.grant_access(&binding.field)?;
                let ty = owner.field_type(&binding.field)?;
                let value = RtValue::from_value(&binding.value.clone().settle_empty_array(ty));
                owner.check_static(&binding.field, &value)?;
                value
            };
            writes.push((owner, binding.field.as_str(), value));
        }
        for (owner, field, value) in writes {
            let _access = owner.grant_access(field)?;
            owner.write_static(field, value)?;
        }

        let args = args.iter().map(RtValue::from_value).collect();
        let outcome = match Machine::new(loader).invoke_member(&unit, index, args) {
            Completion::Returned(value) => {
                InvocationOutcome::Completed(ExecutionResult::Success(value.to_value()))
            }
            Completion::Faulted(fault) => {
                InvocationOutcome::Completed(ExecutionResult::Failure(fault))
            }
            Completion::Exited(code) => InvocationOutcome::Exit(code),
        };
        Ok(outcome)
    }
}

// Initializer faults surface as the call's result, everything else as a
// dispatch error.
fn resolve(loader: &mut UnitLoader, name: &str) -> Result<Resolved, WorkerError> {
    match loader.load(name) {
        Ok(unit) => Ok(Resolved::Unit(unit)),
        Err(LoadError::Initializer { fault, .. }) => Ok(Resolved::Done(
            InvocationOutcome::Completed(ExecutionResult::Failure(fault)),
        )),
        Err(LoadError::Exited { code, .. }) => Ok(Resolved::Done(InvocationOutcome::Exit(code))),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic type".to_string()
    }
}
