//! Runtime binding of loaded units: values as the interpreter sees them,
//! unit-scoped static storage, and the two capabilities the worker uses to
//! reach into target code from outside it.

use crate::error::DispatchError;
use crate::instrument::ProbeLayout;
use crate::unit::{ClassFile, Visibility};
use crate::value::{Value, ValueType};
use crate::vm::Completion;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Interpreter value. Arrays are shared by reference, as in the target
/// language; strings are immutable.
#[derive(Debug, Clone)]
pub enum RtValue {
    Void,
    Null,
    Bool(bool),
    Int(i64),
    Str(Rc<str>),
    BoolArray(Rc<RefCell<Vec<bool>>>),
    IntArray(Rc<RefCell<Vec<i64>>>),
}

impl RtValue {
    pub fn from_value(value: &Value) -> RtValue {
        match value {
            Value::Void => RtValue::Void,
            Value::Null => RtValue::Null,
            Value::Bool(b) => RtValue::Bool(*b),
            Value::Int(i) => RtValue::Int(*i),
            Value::Str(s) => RtValue::Str(Rc::from(s.as_str())),
            Value::BoolArray(items) => RtValue::BoolArray(Rc::new(RefCell::new(items.clone()))),
            Value::IntArray(items) => RtValue::IntArray(Rc::new(RefCell::new(items.clone()))),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RtValue::Void => Value::Void,
            RtValue::Null => Value::Null,
            RtValue::Bool(b) => Value::Bool(*b),
            RtValue::Int(i) => Value::Int(*i),
            RtValue::Str(s) => Value::Str(s.to_string()),
            RtValue::BoolArray(items) => Value::BoolArray(items.borrow().clone()),
            RtValue::IntArray(items) => Value::IntArray(items.borrow().clone()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            RtValue::Void => "void",
            RtValue::Null => "null",
            RtValue::Bool(_) => "bool",
            RtValue::Int(_) => "int",
            RtValue::Str(_) => "str",
            RtValue::BoolArray(_) => "bool[]",
            RtValue::IntArray(_) => "int[]",
        }
    }

    pub fn conforms_to(&self, ty: ValueType) -> bool {
        match (self, ty) {
            (RtValue::Void, ValueType::Void) => true,
            (RtValue::Null, ty) => ty.is_reference(),
            (RtValue::Bool(_), ValueType::Bool) => true,
            (RtValue::Int(_), ValueType::Int) => true,
            (RtValue::Str(_), ValueType::Str) => true,
            (RtValue::BoolArray(_), ValueType::BoolArray) => true,
            (RtValue::IntArray(_), ValueType::IntArray) => true,
            _ => false,
        }
    }
}

/// Where a unit was resolved from. Only user units are transformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOrigin {
    User,
    Dependency,
}

/// A unit after load: immutable code plus mutable static storage.
#[derive(Debug)]
pub struct LoadedUnit {
    class: ClassFile,
    layout: Option<ProbeLayout>,
    statics: RefCell<Vec<RtValue>>,
    // Active `AccessOverride` guards per field.
    overrides: Vec<Cell<u32>>,
}

impl LoadedUnit {
    pub fn new(class: ClassFile, layout: Option<ProbeLayout>) -> Self {
        let statics = class
            .fields
            .iter()
            .map(|f| RtValue::from_value(&f.initial_value()))
            .collect();
        let overrides = class.fields.iter().map(|_| Cell::new(0)).collect();
        Self {
            class,
            layout,
            statics: RefCell::new(statics),
            overrides,
        }
    }

    pub fn name(&self) -> &str {
        &self.class.name
    }

    pub fn class(&self) -> &ClassFile {
        &self.class
    }

    pub fn layout(&self) -> Option<&ProbeLayout> {
        self.layout.as_ref()
    }

    fn slot(&self, field: &str) -> Result<usize, DispatchError> {
        self.class
            .fields
            .iter()
            .position(|f| f.name == field)
            .ok_or_else(|| DispatchError::FieldNotFound {
                unit: self.class.name.clone(),
                field: field.to_string(),
            })
    }

    /// Whether code outside the unit may currently touch `field`.
    pub fn is_accessible(&self, field: &str) -> Result<bool, DispatchError> {
        let index = self.slot(field)?;
        Ok(self.class.fields[index].visibility == Visibility::Public
            || self.overrides[index].get() > 0)
    }

    /// Makes `field` accessible from outside until the guard is dropped.
    pub fn override_access(&self, field: &str) -> Result<AccessOverride<'_>, DispatchError> {
        let index = self.slot(field)?;
        let count = &self.overrides[index];
        count.set(count.get() + 1);
        Ok(AccessOverride { unit: self, index })
    }

    /// Override requested on behalf of a caller outside the worker. The
    /// probe vector of an instrumented unit is never handed out this way.
    pub fn grant_access(&self, field: &str) -> Result<AccessOverride<'_>, DispatchError> {
        if self.is_probe_field(field) {
            return Err(DispatchError::FieldInaccessible {
                unit: self.class.name.clone(),
                field: field.to_string(),
            });
        }
        self.override_access(field)
    }

    fn is_probe_field(&self, field: &str) -> bool {
        self.layout
            .as_ref()
            .is_some_and(|layout| layout.descriptor.field_name == field)
    }

    /// Declared type of `field`.
    pub fn field_type(&self, field: &str) -> Result<ValueType, DispatchError> {
        Ok(self.class.fields[self.slot(field)?].ty)
    }

    /// Checks that `value` could be stored into `field`, without storing it.
    pub fn check_static(&self, field: &str, value: &RtValue) -> Result<(), DispatchError> {
        let ty = self.field_type(field)?;
        if value.conforms_to(ty) {
            Ok(())
        } else {
            Err(DispatchError::FieldType {
                unit: self.class.name.clone(),
                field: field.to_string(),
                expected: ty,
                found: value.type_name().to_string(),
            })
        }
    }

    // Own-unit access used by GetStatic/PutStatic; visibility does not apply.
    pub(crate) fn get_own(&self, field: &str) -> Option<RtValue> {
        let index = self.slot(field).ok()?;
        Some(self.statics.borrow()[index].clone())
    }

    pub(crate) fn put_own(&self, field: &str, value: RtValue) -> Result<(), DispatchError> {
        self.check_static(field, &value)?;
        let index = self.slot(field)?;
        self.statics.borrow_mut()[index] = value;
        Ok(())
    }

    fn ensure_accessible(&self, field: &str) -> Result<(), DispatchError> {
        if self.is_accessible(field)? {
            Ok(())
        } else {
            Err(DispatchError::FieldInaccessible {
                unit: self.class.name.clone(),
                field: field.to_string(),
            })
        }
    }
}

/// Scoped accessibility override. Dropping it restores the field's
/// declared visibility, whatever path the holder leaves by.
#[derive(Debug)]
pub struct AccessOverride<'a> {
    unit: &'a LoadedUnit,
    index: usize,
}

impl Drop for AccessOverride<'_> {
    fn drop(&mut self) {
        let count = &self.unit.overrides[self.index];
        count.set(count.get().saturating_sub(1));
    }
}

/// Read and write static fields from outside the owning unit.
pub trait FieldAccessor {
    fn read_static(&self, field: &str) -> Result<RtValue, DispatchError>;
    fn write_static(&self, field: &str, value: RtValue) -> Result<(), DispatchError>;
}

impl FieldAccessor for LoadedUnit {
    fn read_static(&self, field: &str) -> Result<RtValue, DispatchError> {
        self.ensure_accessible(field)?;
        let index = self.slot(field)?;
        Ok(self.statics.borrow()[index].clone())
    }

    fn write_static(&self, field: &str, value: RtValue) -> Result<(), DispatchError> {
        self.ensure_accessible(field)?;
        self.put_own(field, value)
    }
}

/// Run a resolved member with already type-checked arguments.
pub trait MemberInvoker {
    fn invoke_member(&mut self, unit: &Rc<LoadedUnit>, method: usize, args: Vec<RtValue>) -> Completion;
}
