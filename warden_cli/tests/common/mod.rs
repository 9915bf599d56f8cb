#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use warden_core::instrument::InstrumentationKind;
use warden_core::loader::unit_relative_path;
use warden_core::supervisor::{Classpath, SessionKey, Supervisor, SupervisorConfig};
use warden_core::unit::{ClassFile, FieldDef, Insn, MethodDef, Visibility, encode_unit};
use warden_core::value::{Value, ValueType};

pub const TARGET: &str = "demo.Target";

fn method(name: &str, params: Vec<ValueType>, returns: ValueType, code: Vec<Insn>) -> MethodDef {
    MethodDef {
        name: name.to_string(),
        max_locals: params.len() as u16,
        params,
        returns,
        code,
    }
}

/// A unit exercising the worker's outcomes: plain returns, branches,
/// faults, a private counter, an endless loop and a halt.
pub fn target_unit() -> ClassFile {
    use Insn::*;
    use ValueType::{Int, Void};
    ClassFile {
        name: TARGET.to_string(),
        fields: vec![FieldDef {
            name: "counter".to_string(),
            ty: Int,
            visibility: Visibility::Private,
            initial: Some(Value::Int(0)),
        }],
        methods: vec![
            method("add", vec![Int, Int], Int, vec![Load(0), Load(1), Add, Return]),
            method(
                "abs",
                vec![Int],
                Int,
                vec![Load(0), PushInt(0), Lt, JumpIfNot(7), Load(0), Neg, Return, Load(0), Return],
            ),
            method("div", vec![Int, Int], Int, vec![Load(0), Load(1), Div, Return]),
            method(
                "bump",
                vec![],
                Int,
                vec![
                    GetStatic("counter".into()),
                    PushInt(1),
                    Add,
                    Dup,
                    PutStatic("counter".into()),
                    Return,
                ],
            ),
            method("spin", vec![], Void, vec![Jump(0)]),
            method("quit", vec![], Void, vec![PushInt(3), Halt]),
        ],
    }
}

pub fn write_unit(root: &Path, class: &ClassFile) {
    let path = root.join(unit_relative_path(&class.name).unwrap());
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, encode_unit(class).unwrap()).unwrap();
}

pub fn units_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_unit(dir.path(), &target_unit());
    dir
}

pub fn worker_command() -> Vec<String> {
    vec![env!("CARGO_BIN_EXE_warden-worker").to_string()]
}

pub fn config(request_timeout: Duration) -> SupervisorConfig {
    SupervisorConfig {
        worker_command: worker_command(),
        request_timeout,
        setup_timeout: Duration::from_secs(10),
        stop_grace: Duration::from_millis(500),
        worker_idle_timeout: Some(Duration::from_secs(60)),
        ..SupervisorConfig::default()
    }
}

pub fn supervisor() -> Supervisor {
    Supervisor::new(config(Duration::from_secs(5)))
}

pub fn key(dir: &TempDir, kind: InstrumentationKind) -> SessionKey {
    SessionKey::new(
        Classpath {
            user_paths: vec![dir.path().to_path_buf()],
            dependency_paths: vec![],
        },
        kind,
    )
}
