//! Code-unit model and its binary format.
//!
//! A unit on disk is `WUNT`, a little-endian `u16` format version, then the
//! bincode encoding of a [`ClassFile`]. The rewriter and the loader both go
//! through [`decode_unit`] and [`encode_unit`], so a transformed unit is
//! indistinguishable in shape from a compiled one.

use crate::value::{Value, ValueType};
use bincode::{
    self, Decode, Encode,
    config::{Configuration, Fixint, Limit, LittleEndian},
    error::{DecodeError, EncodeError},
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

pub const UNIT_MAGIC: [u8; 4] = *b"WUNT";
pub const UNIT_FORMAT_VERSION: u16 = 1;
pub const UNIT_EXTENSION: &str = "wunit";
pub const INITIALIZER_NAME: &str = "<clinit>";

const HEADER_LEN: usize = 6;
/// Decode budget for one unit body, counted as bincode claims it.
pub const MAX_UNIT_BYTES: usize = 64 << 20;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnitFormatError {
    #[error("unit binary is truncated ({0} bytes)")]
    Truncated(usize),

    #[error("unit binary does not start with the WUNT magic")]
    BadMagic,

    #[error("unsupported unit format version {0}")]
    UnsupportedVersion(u16),

    #[error("{0} trailing bytes after the unit body")]
    TrailingBytes(usize),

    #[error("unit encoding error: {0}")]
    Encode(String),

    #[error("unit decoding error: {0}")]
    Decode(String),

    #[error("unit exceeds the {MAX_UNIT_BYTES}-byte decode limit")]
    TooLarge,

    #[error("invalid unit: {0}")]
    Invalid(String),
}

impl From<EncodeError> for UnitFormatError {
    fn from(err: EncodeError) -> Self {
        UnitFormatError::Encode(err.to_string())
    }
}

impl From<DecodeError> for UnitFormatError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::LimitExceeded => UnitFormatError::TooLarge,
            other => UnitFormatError::Decode(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "kebab-case")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ValueType,
    #[serde(default)]
    pub visibility: Visibility,
    /// `None` means the zero value of `ty`.
    #[serde(default)]
    pub initial: Option<Value>,
}

impl FieldDef {
    pub fn initial_value(&self) -> Value {
        self.initial
            .clone()
            .unwrap_or_else(|| Value::default_for(self.ty))
    }
}

/// Stack-machine instruction. Jump targets are absolute indices into the
/// owning method's code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum Insn {
    Nop,
    PushInt(i64),
    PushBool(bool),
    PushStr(String),
    PushNull,
    Pop,
    Dup,
    Load(u16),
    Store(u16),
    GetStatic(String),
    PutStatic(String),
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Neg,
    Eq,
    Lt,
    Gt,
    Not,
    Concat,
    Jump(u32),
    JumpIf(u32),
    JumpIfNot(u32),
    NewBoolArray,
    NewIntArray,
    ArrayLoad,
    ArrayStore,
    ArrayLen,
    Call {
        #[serde(default)]
        unit: Option<String>,
        member: String,
    },
    Throw(String),
    Return,
    Halt,
}

impl Insn {
    pub fn jump_target(&self) -> Option<u32> {
        match self {
            Insn::Jump(t) | Insn::JumpIf(t) | Insn::JumpIfNot(t) => Some(*t),
            _ => None,
        }
    }

    pub fn with_jump_target(&self, target: u32) -> Insn {
        match self {
            Insn::Jump(_) => Insn::Jump(target),
            Insn::JumpIf(_) => Insn::JumpIf(target),
            Insn::JumpIfNot(_) => Insn::JumpIfNot(target),
            other => other.clone(),
        }
    }

    /// Instructions after which the next instruction starts a new block.
    pub fn ends_block(&self) -> bool {
        matches!(
            self,
            Insn::Jump(_) | Insn::JumpIf(_) | Insn::JumpIfNot(_) | Insn::Return | Insn::Throw(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MethodDef {
    pub name: String,
    #[serde(default)]
    pub params: Vec<ValueType>,
    #[serde(default = "default_returns")]
    pub returns: ValueType,
    #[serde(default)]
    pub max_locals: u16,
    pub code: Vec<Insn>,
}

fn default_returns() -> ValueType {
    ValueType::Void
}

impl MethodDef {
    pub fn signature(&self) -> String {
        let params: String = self.params.iter().map(|p| p.descriptor()).collect();
        format!("{}({}){}", self.name, params, self.returns.descriptor())
    }

    pub fn is_initializer(&self) -> bool {
        self.name == INITIALIZER_NAME
    }

    /// Local slots available to the body: parameters first, then scratch.
    pub fn local_slots(&self) -> usize {
        self.params.len().max(self.max_locals as usize)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ClassFile {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    #[serde(default)]
    pub methods: Vec<MethodDef>,
}

impl ClassFile {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn find_method(&self, signature: &str) -> Option<(usize, &MethodDef)> {
        self.methods
            .iter()
            .enumerate()
            .find(|(_, m)| m.signature() == signature)
    }

    pub fn initializer_index(&self) -> Option<usize> {
        self.methods.iter().position(|m| m.is_initializer())
    }

    /// Structural checks run on every load, after any transformation.
    pub fn validate(&self) -> Result<(), UnitFormatError> {
        let invalid = |msg: String| Err(UnitFormatError::Invalid(msg));

        if self.name.is_empty() || self.name.split('.').any(|segment| segment.is_empty()) {
            return invalid(format!("bad unit name {:?}", self.name));
        }

        let mut field_names = HashSet::new();
        for field in &self.fields {
            if !field_names.insert(field.name.as_str()) {
                return invalid(format!("duplicate field {}", field.name));
            }
            if field.ty == ValueType::Void {
                return invalid(format!("field {} has void type", field.name));
            }
            let initial = field.initial_value();
            if !initial.conforms_to(field.ty) {
                return invalid(format!(
                    "initial value {} of field {} does not conform to {}",
                    initial, field.name, field.ty
                ));
            }
        }

        let mut signatures = HashSet::new();
        for method in &self.methods {
            let signature = method.signature();
            if method.params.contains(&ValueType::Void) {
                return invalid(format!("{signature} declares a void parameter"));
            }
            if method.is_initializer()
                && (!method.params.is_empty() || method.returns != ValueType::Void)
            {
                return invalid(format!("{signature} must take no parameters and return void"));
            }
            if method.code.is_empty() {
                return invalid(format!("{signature} has no code"));
            }
            let code_len = method.code.len() as u64;
            let locals = method.local_slots();
            for (pc, insn) in method.code.iter().enumerate() {
                match insn {
                    Insn::Jump(t) | Insn::JumpIf(t) | Insn::JumpIfNot(t) if *t as u64 >= code_len => {
                        return invalid(format!("{signature}@{pc}: jump target {t} out of range"));
                    }
                    Insn::Load(slot) | Insn::Store(slot) if *slot as usize >= locals => {
                        return invalid(format!("{signature}@{pc}: local {slot} out of range"));
                    }
                    Insn::GetStatic(f) | Insn::PutStatic(f) if !field_names.contains(f.as_str()) => {
                        return invalid(format!("{signature}@{pc}: unknown field {f}"));
                    }
                    _ => {}
                }
            }
            if !signatures.insert(signature.clone()) {
                return invalid(format!("duplicate method {signature}"));
            }
        }
        Ok(())
    }
}

/// Splits `name(<params>)<ret>` into its parts.
pub fn parse_signature(signature: &str) -> Option<(&str, Vec<ValueType>, ValueType)> {
    let open = signature.find('(')?;
    let close = signature.rfind(')')?;
    if close < open {
        return None;
    }
    let name = &signature[..open];
    if name.is_empty() {
        return None;
    }
    let params = parse_descriptors(&signature[open + 1..close])?;
    let returns = parse_descriptors(&signature[close + 1..])?;
    match returns.as_slice() {
        [ret] if !params.contains(&ValueType::Void) => Some((name, params, *ret)),
        _ => None,
    }
}

fn parse_descriptors(descriptors: &str) -> Option<Vec<ValueType>> {
    let mut types = Vec::new();
    let mut chars = descriptors.chars();
    while let Some(c) = chars.next() {
        let ty = match c {
            'V' => ValueType::Void,
            'Z' => ValueType::Bool,
            'I' => ValueType::Int,
            'S' => ValueType::Str,
            '[' => match chars.next()? {
                'Z' => ValueType::BoolArray,
                'I' => ValueType::IntArray,
                _ => return None,
            },
            _ => return None,
        };
        types.push(ty);
    }
    Some(types)
}

fn unit_bincode_config() -> Configuration<LittleEndian, Fixint, Limit<MAX_UNIT_BYTES>> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
        .with_limit::<MAX_UNIT_BYTES>()
}

pub fn encode_unit(class: &ClassFile) -> Result<Vec<u8>, UnitFormatError> {
    let body = bincode::encode_to_vec(class, unit_bincode_config())?;
    let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
    bytes.extend_from_slice(&UNIT_MAGIC);
    bytes.extend_from_slice(&UNIT_FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

pub fn decode_unit(bytes: &[u8]) -> Result<ClassFile, UnitFormatError> {
    if bytes.len() < HEADER_LEN {
        return Err(UnitFormatError::Truncated(bytes.len()));
    }
    if bytes[..4] != UNIT_MAGIC {
        return Err(UnitFormatError::BadMagic);
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != UNIT_FORMAT_VERSION {
        return Err(UnitFormatError::UnsupportedVersion(version));
    }
    let body = &bytes[HEADER_LEN..];
    let (class, consumed): (ClassFile, usize) =
        bincode::decode_from_slice(body, unit_bincode_config())?;
    if consumed != body.len() {
        return Err(UnitFormatError::TrailingBytes(body.len() - consumed));
    }
    Ok(class)
}
