use crate::executor::TargetFault;
use crate::instrument::{PROBE_FIELD, original_pc};
use crate::loader::{LoadError, UnitLoader};
use crate::runtime::{LoadedUnit, MemberInvoker, RtValue};
use crate::unit::{Insn, MethodDef};
use crate::value::ValueType;
use std::cell::RefCell;
use std::rc::Rc;

pub const ARITHMETIC_ERROR: &str = "ArithmeticError";
pub const INDEX_OUT_OF_BOUNDS: &str = "IndexOutOfBoundsError";
pub const NULL_POINTER: &str = "NullPointerError";
pub const TYPE_ERROR: &str = "TypeError";
pub const NEGATIVE_ARRAY_SIZE: &str = "NegativeArraySizeError";
pub const OUT_OF_MEMORY: &str = "OutOfMemoryError";
pub const STACK_OVERFLOW: &str = "StackOverflowError";
pub const NO_SUCH_FIELD: &str = "NoSuchFieldError";
pub const NO_SUCH_METHOD: &str = "NoSuchMethodError";
pub const NO_CLASS_DEF_FOUND: &str = "NoClassDefFoundError";
pub const INITIALIZER_ERROR: &str = "ExceptionInInitializerError";
pub const LINKAGE_ERROR: &str = "LinkageError";
pub const VERIFY_ERROR: &str = "VerifyError";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub max_call_depth: usize,
    pub max_array_len: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_call_depth: 256,
            max_array_len: 1 << 20,
        }
    }
}

/// How a run of target code ended.
#[derive(Debug, Clone)]
pub enum Completion {
    Returned(RtValue),
    Faulted(TargetFault),
    /// Target code executed `Halt`; the hosting process should exit.
    Exited(i32),
}

struct Frame {
    unit: Rc<LoadedUnit>,
    method: usize,
    pc: usize,
    locals: Vec<RtValue>,
    stack: Vec<RtValue>,
}

impl Frame {
    fn enter(unit: Rc<LoadedUnit>, method: usize, mut args: Vec<RtValue>) -> Self {
        let slots = unit.class().methods[method].local_slots();
        if args.len() < slots {
            args.resize(slots, RtValue::Null);
        }
        Self {
            unit,
            method,
            pc: 0,
            locals: args,
            stack: Vec::new(),
        }
    }

    /// Trace entry for the instruction last executed, in the numbering of
    /// the unit as compiled.
    fn location(&self) -> String {
        let method = &self.unit.class().methods[self.method];
        let mut pc = self.pc.saturating_sub(1);
        if self.unit.layout().is_some() {
            pc = original_pc(&method.code, pc);
        }
        format!("{}.{}@{}", self.unit.name(), method.signature(), pc)
    }

    fn push(&mut self, value: RtValue) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<RtValue, Raise> {
        self.stack
            .pop()
            .ok_or_else(|| Raise::new(VERIFY_ERROR, "operand stack underflow"))
    }

    fn pop_int(&mut self) -> Result<i64, Raise> {
        match self.pop()? {
            RtValue::Int(i) => Ok(i),
            other => Err(Raise::expected("int", &other)),
        }
    }

    fn pop_bool(&mut self) -> Result<bool, Raise> {
        match self.pop()? {
            RtValue::Bool(b) => Ok(b),
            other => Err(Raise::expected("bool", &other)),
        }
    }
}

struct Raise {
    kind: String,
    message: String,
}

impl Raise {
    fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
        }
    }

    fn expected(what: &str, found: &RtValue) -> Self {
        match found {
            RtValue::Null => Raise::new(NULL_POINTER, format!("expected {what}, got null")),
            other => Raise::new(TYPE_ERROR, format!("expected {what}, got {}", other.type_name())),
        }
    }

    fn into_fault(self, frames: &[Frame]) -> TargetFault {
        TargetFault {
            kind: self.kind,
            message: self.message,
            trace: frames.iter().rev().map(Frame::location).collect(),
        }
    }
}

enum Flow {
    Next,
    Return(RtValue),
    Invoke {
        unit: Rc<LoadedUnit>,
        method: usize,
        args: Vec<RtValue>,
    },
    Exit(i32),
}

/// Interpreter for unit code. Frames live on an explicit stack, so target
/// recursion depth is bounded by `ExecutionLimits` rather than by the
/// native stack.
pub struct Machine<'l> {
    loader: &'l mut UnitLoader,
    limits: ExecutionLimits,
}

impl<'l> Machine<'l> {
    pub fn new(loader: &'l mut UnitLoader) -> Self {
        let limits = loader.limits();
        Self { loader, limits }
    }

    pub fn run(&mut self, unit: &Rc<LoadedUnit>, method: usize, args: Vec<RtValue>) -> Completion {
        let mut frames = vec![Frame::enter(Rc::clone(unit), method, args)];
        while let Some(frame) = frames.last_mut() {
            let flow = match self.step(frame) {
                Ok(flow) => flow,
                Err(raise) => return Completion::Faulted(raise.into_fault(&frames)),
            };
            match flow {
                Flow::Next => {}
                Flow::Return(value) => {
                    frames.pop();
                    match frames.last_mut() {
                        Some(caller) => {
                            if !matches!(value, RtValue::Void) {
                                caller.push(value);
                            }
                        }
                        None => return Completion::Returned(value),
                    }
                }
                Flow::Invoke { unit, method, args } => {
                    if frames.len() >= self.limits.max_call_depth {
                        let raise = Raise::new(
                            STACK_OVERFLOW,
                            format!("call depth exceeded {}", self.limits.max_call_depth),
                        );
                        return Completion::Faulted(raise.into_fault(&frames));
                    }
                    frames.push(Frame::enter(unit, method, args));
                }
                Flow::Exit(code) => return Completion::Exited(code),
            }
        }
        Completion::Returned(RtValue::Void)
    }

    fn step(&mut self, frame: &mut Frame) -> Result<Flow, Raise> {
        let unit = Rc::clone(&frame.unit);
        let method = &unit.class().methods[frame.method];
        let Some(insn) = method.code.get(frame.pc) else {
            return Err(Raise::new(
                VERIFY_ERROR,
                format!("control fell off the end of {}", method.signature()),
            ));
        };
        frame.pc += 1;

        match insn {
            Insn::Nop => {}
            Insn::PushInt(v) => frame.push(RtValue::Int(*v)),
            Insn::PushBool(b) => frame.push(RtValue::Bool(*b)),
            Insn::PushStr(s) => frame.push(RtValue::Str(Rc::from(s.as_str()))),
            Insn::PushNull => frame.push(RtValue::Null),
            Insn::Pop => {
                frame.pop()?;
            }
            Insn::Dup => {
                let top = frame.pop()?;
                frame.push(top.clone());
                frame.push(top);
            }
            Insn::Load(slot) => {
                let value = frame
                    .locals
                    .get(*slot as usize)
                    .cloned()
                    .ok_or_else(|| Raise::new(VERIFY_ERROR, format!("no local {slot}")))?;
                frame.push(value);
            }
            Insn::Store(slot) => {
                let value = frame.pop()?;
                match frame.locals.get_mut(*slot as usize) {
                    Some(local) => *local = value,
                    None => return Err(Raise::new(VERIFY_ERROR, format!("no local {slot}"))),
                }
            }
            Insn::GetStatic(field) => {
                let value = unit.get_own(field).ok_or_else(|| {
                    Raise::new(NO_SUCH_FIELD, format!("{}.{}", unit.name(), field))
                })?;
                frame.push(value);
            }
            Insn::PutStatic(field) => {
                let value = frame.pop()?;
                unit.put_own(field, value)
                    .map_err(|e| Raise::new(TYPE_ERROR, e.to_string()))?;
            }
            Insn::Add => int_op(frame, i64::wrapping_add)?,
            Insn::Sub => int_op(frame, i64::wrapping_sub)?,
            Insn::Mul => int_op(frame, i64::wrapping_mul)?,
            Insn::Div | Insn::Rem => {
                let b = frame.pop_int()?;
                let a = frame.pop_int()?;
                if b == 0 {
                    return Err(Raise::new(ARITHMETIC_ERROR, "/ by zero"));
                }
                let result = if matches!(insn, Insn::Div) {
                    a.wrapping_div(b)
                } else {
                    a.wrapping_rem(b)
                };
                frame.push(RtValue::Int(result));
            }
            Insn::Neg => {
                let a = frame.pop_int()?;
                frame.push(RtValue::Int(a.wrapping_neg()));
            }
            Insn::Eq => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                frame.push(RtValue::Bool(values_equal(&a, &b)?));
            }
            Insn::Lt | Insn::Gt => {
                let b = frame.pop_int()?;
                let a = frame.pop_int()?;
                let result = if matches!(insn, Insn::Lt) { a < b } else { a > b };
                frame.push(RtValue::Bool(result));
            }
            Insn::Not => {
                let b = frame.pop_bool()?;
                frame.push(RtValue::Bool(!b));
            }
            Insn::Concat => {
                let tail = match frame.pop()? {
                    RtValue::Str(s) => s.to_string(),
                    RtValue::Int(i) => i.to_string(),
                    RtValue::Bool(b) => b.to_string(),
                    RtValue::Null => "null".to_string(),
                    other => return Err(Raise::expected("str", &other)),
                };
                let head = match frame.pop()? {
                    RtValue::Str(s) => s,
                    other => return Err(Raise::expected("str", &other)),
                };
                frame.push(RtValue::Str(Rc::from(format!("{head}{tail}"))));
            }
            Insn::Jump(target) => frame.pc = *target as usize,
            Insn::JumpIf(target) => {
                if frame.pop_bool()? {
                    frame.pc = *target as usize;
                }
            }
            Insn::JumpIfNot(target) => {
                if !frame.pop_bool()? {
                    frame.pc = *target as usize;
                }
            }
            Insn::NewBoolArray => {
                let requested = frame.pop_int()?;
                let len = if allocates_probes(&unit, method, frame.pc) {
                    checked_len(requested)?
                } else {
                    self.array_len(requested)?
                };
                frame.push(RtValue::BoolArray(Rc::new(RefCell::new(vec![false; len]))));
            }
            Insn::NewIntArray => {
                let len = self.array_len(frame.pop_int()?)?;
                frame.push(RtValue::IntArray(Rc::new(RefCell::new(vec![0; len]))));
            }
            Insn::ArrayLoad => {
                let index = frame.pop_int()?;
                let value = match frame.pop()? {
                    RtValue::BoolArray(cells) => {
                        let cells = cells.borrow();
                        RtValue::Bool(cells[checked_index(index, cells.len())?])
                    }
                    RtValue::IntArray(cells) => {
                        let cells = cells.borrow();
                        RtValue::Int(cells[checked_index(index, cells.len())?])
                    }
                    other => return Err(Raise::expected("array", &other)),
                };
                frame.push(value);
            }
            Insn::ArrayStore => {
                let value = frame.pop()?;
                let index = frame.pop_int()?;
                match (frame.pop()?, value) {
                    (RtValue::BoolArray(cells), RtValue::Bool(b)) => {
                        let mut cells = cells.borrow_mut();
                        let i = checked_index(index, cells.len())?;
                        cells[i] = b;
                    }
                    (RtValue::IntArray(cells), RtValue::Int(v)) => {
                        let mut cells = cells.borrow_mut();
                        let i = checked_index(index, cells.len())?;
                        cells[i] = v;
                    }
                    (RtValue::Null, _) => {
                        return Err(Raise::new(NULL_POINTER, "store into null array"));
                    }
                    (array, value) => {
                        return Err(Raise::new(
                            TYPE_ERROR,
                            format!("cannot store {} into {}", value.type_name(), array.type_name()),
                        ));
                    }
                }
            }
            Insn::ArrayLen => {
                let len = match frame.pop()? {
                    RtValue::BoolArray(cells) => cells.borrow().len(),
                    RtValue::IntArray(cells) => cells.borrow().len(),
                    other => return Err(Raise::expected("array", &other)),
                };
                frame.push(RtValue::Int(len as i64));
            }
            Insn::Call { unit: target, member } => {
                return self.prepare_call(frame, &unit, target.as_deref(), member);
            }
            Insn::Throw(kind) => {
                let message = match frame.pop()? {
                    RtValue::Str(s) => s.to_string(),
                    RtValue::Null => String::new(),
                    other => return Err(Raise::expected("str", &other)),
                };
                return Err(Raise {
                    kind: kind.clone(),
                    message,
                });
            }
            Insn::Return => {
                if method.returns == ValueType::Void {
                    return Ok(Flow::Return(RtValue::Void));
                }
                let value = frame.pop()?;
                if !value.conforms_to(method.returns) {
                    return Err(Raise::new(
                        TYPE_ERROR,
                        format!(
                            "{} returns {}, got {}",
                            method.signature(),
                            method.returns,
                            value.type_name()
                        ),
                    ));
                }
                return Ok(Flow::Return(value));
            }
            Insn::Halt => {
                let code = frame.pop_int()?;
                return Ok(Flow::Exit(code as i32));
            }
        }
        Ok(Flow::Next)
    }

    fn prepare_call(
        &mut self,
        frame: &mut Frame,
        current: &Rc<LoadedUnit>,
        target: Option<&str>,
        member: &str,
    ) -> Result<Flow, Raise> {
        let callee = match target {
            None => Rc::clone(current),
            Some(name) if name == current.name() => Rc::clone(current),
            Some(name) => match self.loader.load(name) {
                Ok(unit) => unit,
                Err(LoadError::Exited { code, .. }) => return Ok(Flow::Exit(code)),
                Err(LoadError::NotFound(name)) => return Err(Raise::new(NO_CLASS_DEF_FOUND, name)),
                Err(LoadError::Initializer { unit, fault }) => {
                    return Err(Raise::new(INITIALIZER_ERROR, format!("{unit}: {fault}")));
                }
                Err(other) => return Err(Raise::new(LINKAGE_ERROR, other.to_string())),
            },
        };

        let Some((index, method)) = callee
            .class()
            .find_method(member)
            .filter(|(_, m)| !m.is_initializer())
        else {
            return Err(Raise::new(
                NO_SUCH_METHOD,
                format!("{}.{}", callee.name(), member),
            ));
        };
        let arity = method.params.len();
        if frame.stack.len() < arity {
            return Err(Raise::new(VERIFY_ERROR, "operand stack underflow"));
        }
        let args = frame.stack.split_off(frame.stack.len() - arity);
        for (arg, ty) in args.iter().zip(&method.params) {
            if !arg.conforms_to(*ty) {
                return Err(Raise::new(
                    TYPE_ERROR,
                    format!("{member} expects {ty}, got {}", arg.type_name()),
                ));
            }
        }
        Ok(Flow::Invoke {
            unit: callee,
            method: index,
            args,
        })
    }

    fn array_len(&self, requested: i64) -> Result<usize, Raise> {
        let len = checked_len(requested)?;
        if len > self.limits.max_array_len {
            return Err(Raise::new(
                OUT_OF_MEMORY,
                format!("array of {len} exceeds {}", self.limits.max_array_len),
            ));
        }
        Ok(len)
    }
}

fn checked_len(requested: i64) -> Result<usize, Raise> {
    usize::try_from(requested).map_err(|_| Raise::new(NEGATIVE_ARRAY_SIZE, requested.to_string()))
}

/// The allocation prologue of an instrumented initializer sizes the probe
/// vector to the unit's probe count, which `max_array_len` does not bound.
/// `pc` is the index after the `NewBoolArray` being executed.
fn allocates_probes(unit: &LoadedUnit, method: &MethodDef, pc: usize) -> bool {
    unit.layout().is_some()
        && method.is_initializer()
        && pc == 2
        && matches!(method.code.get(pc), Some(Insn::PutStatic(field)) if field == PROBE_FIELD)
}

impl MemberInvoker for Machine<'_> {
    fn invoke_member(&mut self, unit: &Rc<LoadedUnit>, method: usize, args: Vec<RtValue>) -> Completion {
        self.run(unit, method, args)
    }
}

fn int_op(frame: &mut Frame, op: fn(i64, i64) -> i64) -> Result<(), Raise> {
    let b = frame.pop_int()?;
    let a = frame.pop_int()?;
    frame.push(RtValue::Int(op(a, b)));
    Ok(())
}

fn checked_index(index: i64, len: usize) -> Result<usize, Raise> {
    if index < 0 || index as usize >= len {
        return Err(Raise::new(
            INDEX_OUT_OF_BOUNDS,
            format!("index {index} out of bounds for length {len}"),
        ));
    }
    Ok(index as usize)
}

fn values_equal(a: &RtValue, b: &RtValue) -> Result<bool, Raise> {
    use RtValue::*;
    Ok(match (a, b) {
        (Int(x), Int(y)) => x == y,
        (Bool(x), Bool(y)) => x == y,
        (Str(x), Str(y)) => x == y,
        (Null, Null) => true,
        (Null, Str(_) | BoolArray(_) | IntArray(_)) | (Str(_) | BoolArray(_) | IntArray(_), Null) => {
            false
        }
        (BoolArray(x), BoolArray(y)) => Rc::ptr_eq(x, y),
        (IntArray(x), IntArray(y)) => Rc::ptr_eq(x, y),
        _ => {
            return Err(Raise::new(
                TYPE_ERROR,
                format!("cannot compare {} with {}", a.type_name(), b.type_name()),
            ));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::tests::{calc_unit, method};
    use crate::unit::ClassFile;
    use crate::value::Value;

    fn run(class: ClassFile, signature: &str, args: Vec<Value>) -> Completion {
        let mut loader = UnitLoader::new(ExecutionLimits::default());
        let (index, _) = class.find_method(signature).expect("method exists");
        let unit = Rc::new(LoadedUnit::new(class, None));
        let args = args.iter().map(RtValue::from_value).collect();
        Machine::new(&mut loader).run(&unit, index, args)
    }

    fn returned(completion: Completion) -> Value {
        match completion {
            Completion::Returned(v) => v.to_value(),
            other => panic!("expected a return, got {other:?}"),
        }
    }

    fn faulted(completion: Completion) -> TargetFault {
        match completion {
            Completion::Faulted(f) => f,
            other => panic!("expected a fault, got {other:?}"),
        }
    }

    fn single(name: &str, params: Vec<ValueType>, returns: ValueType, code: Vec<Insn>) -> ClassFile {
        ClassFile {
            name: "demo.T".into(),
            fields: vec![],
            methods: vec![method(name, params, returns, code)],
        }
    }

    #[test]
    fn arithmetic_and_branches() {
        assert_eq!(
            returned(run(calc_unit(), "add(II)I", vec![Value::Int(2), Value::Int(3)])),
            Value::Int(5)
        );
        assert_eq!(returned(run(calc_unit(), "abs(I)I", vec![Value::Int(-4)])), Value::Int(4));
        assert_eq!(returned(run(calc_unit(), "abs(I)I", vec![Value::Int(9)])), Value::Int(9));
    }

    #[test]
    fn division_by_zero_is_a_target_fault() {
        let class = single(
            "div",
            vec![ValueType::Int, ValueType::Int],
            ValueType::Int,
            vec![Insn::Load(0), Insn::Load(1), Insn::Div, Insn::Return],
        );
        let fault = faulted(run(class, "div(II)I", vec![Value::Int(1), Value::Int(0)]));
        assert_eq!(fault.kind, ARITHMETIC_ERROR);
        assert_eq!(fault.trace, vec!["demo.T.div(II)I@2".to_string()]);
    }

    #[test]
    fn array_bounds_and_null_checks() {
        let class = single(
            "at",
            vec![ValueType::IntArray, ValueType::Int],
            ValueType::Int,
            vec![Insn::Load(0), Insn::Load(1), Insn::ArrayLoad, Insn::Return],
        );
        let ok = run(class.clone(), "at([II)I", vec![Value::IntArray(vec![7, 8]), Value::Int(1)]);
        assert_eq!(returned(ok), Value::Int(8));

        let oob = run(class.clone(), "at([II)I", vec![Value::IntArray(vec![7]), Value::Int(3)]);
        assert_eq!(faulted(oob).kind, INDEX_OUT_OF_BOUNDS);

        let null = run(class, "at([II)I", vec![Value::Null, Value::Int(0)]);
        assert_eq!(faulted(null).kind, NULL_POINTER);
    }

    #[test]
    fn explicit_throw_carries_kind_and_message() {
        let class = single(
            "fail",
            vec![],
            ValueType::Void,
            vec![Insn::PushStr("boom".into()), Insn::Throw("IllegalStateError".into())],
        );
        let fault = faulted(run(class, "fail()V", vec![]));
        assert_eq!(fault.kind, "IllegalStateError");
        assert_eq!(fault.message, "boom");
    }

    #[test]
    fn unbounded_recursion_hits_the_call_depth_limit() {
        let class = single(
            "spin",
            vec![],
            ValueType::Void,
            vec![
                Insn::Call {
                    unit: None,
                    member: "spin()V".into(),
                },
                Insn::Return,
            ],
        );
        let fault = faulted(run(class, "spin()V", vec![]));
        assert_eq!(fault.kind, STACK_OVERFLOW);
        assert_eq!(fault.trace.len(), ExecutionLimits::default().max_call_depth);
    }

    #[test]
    fn calls_pass_arguments_and_return_values() {
        let mut class = calc_unit();
        class.methods.push(method(
            "twice",
            vec![ValueType::Int],
            ValueType::Int,
            vec![
                Insn::Load(0),
                Insn::Load(0),
                Insn::Call {
                    unit: Some("demo.Calc".into()),
                    member: "add(II)I".into(),
                },
                Insn::Return,
            ],
        ));
        assert_eq!(returned(run(class, "twice(I)I", vec![Value::Int(21)])), Value::Int(42));
    }

    #[test]
    fn missing_callee_unit_is_a_target_fault() {
        let class = single(
            "ext",
            vec![],
            ValueType::Void,
            vec![
                Insn::Call {
                    unit: Some("nowhere.Gone".into()),
                    member: "f()V".into(),
                },
                Insn::Return,
            ],
        );
        assert_eq!(faulted(run(class, "ext()V", vec![])).kind, NO_CLASS_DEF_FOUND);
    }

    #[test]
    fn halt_requests_process_exit() {
        let class = single("quit", vec![], ValueType::Void, vec![Insn::PushInt(3), Insn::Halt]);
        assert!(matches!(run(class, "quit()V", vec![]), Completion::Exited(3)));
    }

    #[test]
    fn concat_renders_primitives() {
        let class = single(
            "greet",
            vec![ValueType::Int],
            ValueType::Str,
            vec![Insn::PushStr("n=".into()), Insn::Load(0), Insn::Concat, Insn::Return],
        );
        assert_eq!(
            returned(run(class, "greet(I)S", vec![Value::Int(5)])),
            Value::Str("n=5".into())
        );
    }

    #[test]
    fn wrong_return_type_is_a_type_error() {
        let class = single("bad", vec![], ValueType::Int, vec![Insn::PushBool(true), Insn::Return]);
        assert_eq!(faulted(run(class, "bad()I", vec![])).kind, TYPE_ERROR);
    }
}
