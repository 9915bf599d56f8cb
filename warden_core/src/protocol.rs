//! Wire protocol between the supervisor and a worker.
//!
//! Each message is one frame: a little-endian `u32` body length followed by
//! the bincode encoding of a [`Request`] or [`Response`]. Every request is
//! answered by exactly one response carrying the same id.

use crate::coverage::CoverageInfo;
use crate::error::WorkerError;
use crate::executor::{ExecutionResult, StaticEnvironment};
use crate::instrument::InstrumentationKind;
use crate::value::Value;
use bincode::{
    self, Decode, Encode,
    config::{Configuration, Fixint, Limit, LittleEndian},
    error::{DecodeError, EncodeError},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};
use thiserror::Error;

pub const MAX_FRAME_LEN: usize = 64 << 20;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("wire I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(usize),

    #[error("frame encoding error: {0}")]
    Encode(String),

    #[error("frame decoding error: {0}")]
    Decode(String),
}

impl From<EncodeError> for WireError {
    fn from(err: EncodeError) -> Self {
        WireError::Encode(err.to_string())
    }
}

impl From<DecodeError> for WireError {
    fn from(err: DecodeError) -> Self {
        WireError::Decode(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub enum CommandKind {
    AddPaths,
    SetInstrumentation,
    Warmup,
    InvokeMethod,
    CollectCoverage,
    ComputeStaticField,
    StopProcess,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct InvokeRequest {
    pub unit: String,
    pub member: String,
    pub args: Vec<Value>,
    pub env: StaticEnvironment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct FieldDescriptor {
    pub unit: String,
    pub field: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum RequestBody {
    AddPaths {
        user_paths: Vec<String>,
        dependency_paths: Vec<String>,
    },
    SetInstrumentation {
        kind: InstrumentationKind,
    },
    Warmup,
    InvokeMethod(InvokeRequest),
    CollectCoverage {
        unit: String,
    },
    ComputeStaticField(FieldDescriptor),
    StopProcess,
}

impl RequestBody {
    pub fn kind(&self) -> CommandKind {
        match self {
            RequestBody::AddPaths { .. } => CommandKind::AddPaths,
            RequestBody::SetInstrumentation { .. } => CommandKind::SetInstrumentation,
            RequestBody::Warmup => CommandKind::Warmup,
            RequestBody::InvokeMethod(_) => CommandKind::InvokeMethod,
            RequestBody::CollectCoverage { .. } => CommandKind::CollectCoverage,
            RequestBody::ComputeStaticField(_) => CommandKind::ComputeStaticField,
            RequestBody::StopProcess => CommandKind::StopProcess,
        }
    }

    /// Short human-readable target of the command, used in error context.
    pub fn context(&self) -> String {
        match self {
            RequestBody::AddPaths {
                user_paths,
                dependency_paths,
            } => format!(
                "{} user path(s), {} dependency path(s)",
                user_paths.len(),
                dependency_paths.len()
            ),
            RequestBody::SetInstrumentation { kind } => kind.to_string(),
            RequestBody::Warmup | RequestBody::StopProcess => String::new(),
            RequestBody::InvokeMethod(invoke) => format!("{}.{}", invoke.unit, invoke.member),
            RequestBody::CollectCoverage { unit } => unit.clone(),
            RequestBody::ComputeStaticField(field) => format!("{}.{}", field.unit, field.field),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum ResponseBody {
    Ack,
    Invocation(ExecutionResult),
    Coverage(CoverageInfo),
    StaticValue(Value),
    Error(WorkerError),
}

impl ResponseBody {
    /// Whether this is the success response shape for `kind`.
    pub fn answers(&self, kind: CommandKind) -> bool {
        matches!(
            (kind, self),
            (
                CommandKind::AddPaths
                    | CommandKind::SetInstrumentation
                    | CommandKind::Warmup
                    | CommandKind::StopProcess,
                ResponseBody::Ack
            ) | (CommandKind::InvokeMethod, ResponseBody::Invocation(_))
                | (CommandKind::CollectCoverage, ResponseBody::Coverage(_))
                | (CommandKind::ComputeStaticField, ResponseBody::StaticValue(_))
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            ResponseBody::Ack => "Ack",
            ResponseBody::Invocation(_) => "Invocation",
            ResponseBody::Coverage(_) => "Coverage",
            ResponseBody::StaticValue(_) => "StaticValue",
            ResponseBody::Error(_) => "Error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Request {
    pub id: u64,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Response {
    pub id: u64,
    pub body: ResponseBody,
}

fn wire_bincode_config() -> Configuration<LittleEndian, Fixint, Limit<MAX_FRAME_LEN>> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
        .with_limit::<MAX_FRAME_LEN>()
}

/// Writes one frame and flushes.
pub fn write_frame<W: Write, T: Encode>(writer: &mut W, message: &T) -> Result<(), WireError> {
    let body = bincode::encode_to_vec(message, wire_bincode_config())?;
    if body.len() > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame. `Ok(None)` means the stream ended cleanly on a frame
/// boundary; a stream cut inside a frame is an error.
pub fn read_frame<R: Read, T: Decode<()>>(reader: &mut R) -> Result<Option<T>, WireError> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    let (message, consumed): (T, usize) = bincode::decode_from_slice(&body, wire_bincode_config())?;
    if consumed != len {
        return Err(WireError::Decode(format!(
            "{} trailing bytes in frame",
            len - consumed
        )));
    }
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use std::io::Cursor;

    #[test]
    fn frames_are_length_prefixed() {
        let request = Request {
            id: 7,
            body: RequestBody::CollectCoverage {
                unit: "demo.Calc".into(),
            },
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &request).unwrap();
        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);

        let mut cursor = Cursor::new(buf);
        let decoded: Option<Request> = read_frame(&mut cursor).unwrap();
        assert_eq!(decoded, Some(request));
        let end: Option<Request> = read_frame(&mut cursor).unwrap();
        assert!(end.is_none(), "clean EOF after the last frame");
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut buf = Vec::new();
        write_frame(
            &mut buf,
            &Response {
                id: 1,
                body: ResponseBody::Ack,
            },
        )
        .unwrap();
        buf.truncate(buf.len() - 1);
        let result: Result<Option<Response>, _> = read_frame(&mut Cursor::new(buf));
        assert!(matches!(result, Err(WireError::Io(_))));

        let partial_header: Result<Option<Response>, _> = read_frame(&mut Cursor::new(vec![1u8, 0]));
        assert!(matches!(partial_header, Err(WireError::Io(_))));
    }

    #[test]
    fn oversized_length_is_rejected_before_allocation() {
        let header = (u32::MAX).to_le_bytes().to_vec();
        let result: Result<Option<Response>, _> = read_frame(&mut Cursor::new(header));
        assert!(matches!(result, Err(WireError::FrameTooLarge(_))));
    }

    #[test]
    fn error_responses_carry_typed_errors() {
        let response = Response {
            id: 3,
            body: ResponseBody::Error(
                DispatchError::UnitNotFound {
                    unit: "demo.Gone".into(),
                }
                .into(),
            ),
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &response).unwrap();
        let decoded: Option<Response> = read_frame(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, Some(response));
    }

    #[test]
    fn response_shapes_match_command_kinds() {
        assert!(ResponseBody::Ack.answers(CommandKind::AddPaths));
        assert!(ResponseBody::Ack.answers(CommandKind::StopProcess));
        assert!(!ResponseBody::Ack.answers(CommandKind::InvokeMethod));
        assert!(ResponseBody::Coverage(CoverageInfo::default()).answers(CommandKind::CollectCoverage));
        assert!(!ResponseBody::StaticValue(Value::Null).answers(CommandKind::CollectCoverage));
    }
}
