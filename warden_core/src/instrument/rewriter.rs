//! Probe insertion.
//!
//! The rewrite is two passes over the unit. Pass one selects probe sites in
//! every method under the active [`SitePolicy`]. Pass two hands each method
//! a contiguous slice of the global probe index space, in declaration
//! order, and emits
//!
//! ```text
//! GetStatic($__probes__) PushInt(i) PushBool(true) ArrayStore
//! ```
//!
//! in front of every selected instruction. Jumps are remapped so that a jump
//! to an original instruction lands on its probe sequence. The probe field
//! is allocated by a prologue at the head of `<clinit>`, which is
//! synthesized when the unit has none, so the array exists before any probe
//! can run.

use crate::error::TransformError;
use crate::unit::{
    ClassFile, FieldDef, INITIALIZER_NAME, Insn, MAX_UNIT_BYTES, MethodDef, UnitFormatError,
    Visibility, decode_unit, encode_unit,
};
use crate::value::{Value, ValueType};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the injected probe field.
pub const PROBE_FIELD: &str = "$__probes__";

const PROBE_SEQUENCE_LEN: u32 = 4;

/// Half-open range of probe indices `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct IndexRange {
    pub start: u32,
    pub end: u32,
}

impl IndexRange {
    pub fn contains(&self, index: u32) -> bool {
        self.start <= index && index < self.end
    }
}

/// Describes the probe vector of one instrumented unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct ProbeDescriptor {
    pub owner_unit_name: String,
    pub field_name: String,
    pub probe_count: u32,
}

/// Everything the rewriter learned about a unit, kept with the loaded unit
/// for coverage collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct ProbeLayout {
    pub descriptor: ProbeDescriptor,
    /// Member signature to its slice of the probe vector. The ranges
    /// partition `[0, probe_count)`.
    pub ranges_by_member: BTreeMap<String, IndexRange>,
}

/// Which instructions receive a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SitePolicy {
    /// Every original instruction.
    EveryInstruction,
    /// Basic-block leaders: the entry, every jump target, and every
    /// instruction following a jump, `Return` or `Throw`.
    BranchTargets,
}

impl SitePolicy {
    pub fn select_sites(&self, code: &[Insn]) -> Vec<bool> {
        match self {
            SitePolicy::EveryInstruction => vec![true; code.len()],
            SitePolicy::BranchTargets => {
                let mut leaders = vec![false; code.len()];
                if let Some(entry) = leaders.first_mut() {
                    *entry = true;
                }
                for (pc, insn) in code.iter().enumerate() {
                    if let Some(target) = insn.jump_target() {
                        if let Some(leader) = leaders.get_mut(target as usize) {
                            *leader = true;
                        }
                    }
                    if insn.ends_block() {
                        if let Some(leader) = leaders.get_mut(pc + 1) {
                            *leader = true;
                        }
                    }
                }
                leaders
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rewriter {
    policy: SitePolicy,
}

impl Rewriter {
    pub fn new(policy: SitePolicy) -> Self {
        Self { policy }
    }

    pub fn rewrite(
        &self,
        binary: &[u8],
        unit_name: &str,
    ) -> Result<(Vec<u8>, ProbeLayout), TransformError> {
        let mut class =
            decode_unit(binary).map_err(|e| TransformError::Malformed(e.to_string()))?;
        if class.name != unit_name {
            return Err(TransformError::NameMismatch {
                expected: unit_name.to_string(),
                found: class.name,
            });
        }
        if class.field(PROBE_FIELD).is_some() {
            return Err(TransformError::FieldCollision {
                unit: class.name,
                field: PROBE_FIELD.to_string(),
            });
        }
        class
            .validate()
            .map_err(|e| TransformError::Malformed(e.to_string()))?;

        let sites: Vec<Vec<bool>> = class
            .methods
            .iter()
            .map(|m| self.policy.select_sites(&m.code))
            .collect();

        let mut ranges_by_member = BTreeMap::new();
        let mut next_probe = 0u32;
        for (method, sites) in class.methods.iter_mut().zip(&sites) {
            let count = sites.iter().filter(|selected| **selected).count() as u32;
            let range = IndexRange {
                start: next_probe,
                end: next_probe + count,
            };
            method.code = instrument_body(&method.code, sites, range.start);
            ranges_by_member.insert(method.signature(), range);
            next_probe = range.end;
        }
        let probe_count = next_probe;

        class.fields.push(FieldDef {
            name: PROBE_FIELD.to_string(),
            ty: ValueType::BoolArray,
            visibility: Visibility::Private,
            initial: Some(Value::Null),
        });
        install_probe_allocation(&mut class, probe_count);

        let binary = encode_unit(&class).map_err(|e| TransformError::Encode(e.to_string()))?;
        // The loader decodes under a fixed budget, so the grown unit must fit it too.
        match decode_unit(&binary) {
            Ok(_) => {}
            Err(UnitFormatError::TooLarge) => {
                return Err(TransformError::TooLarge {
                    unit: class.name,
                    probe_count,
                    limit: MAX_UNIT_BYTES,
                });
            }
            Err(e) => return Err(TransformError::Encode(e.to_string())),
        }
        let layout = ProbeLayout {
            descriptor: ProbeDescriptor {
                owner_unit_name: class.name,
                field_name: PROBE_FIELD.to_string(),
                probe_count,
            },
            ranges_by_member,
        };
        Ok((binary, layout))
    }
}

fn probe_sequence(index: u32) -> [Insn; PROBE_SEQUENCE_LEN as usize] {
    [
        Insn::GetStatic(PROBE_FIELD.to_string()),
        Insn::PushInt(index as i64),
        Insn::PushBool(true),
        Insn::ArrayStore,
    ]
}

fn instrument_body(code: &[Insn], sites: &[bool], first_probe: u32) -> Vec<Insn> {
    let mut relocated = Vec::with_capacity(code.len());
    let mut cursor = 0u32;
    for selected in sites {
        relocated.push(cursor);
        cursor += if *selected { PROBE_SEQUENCE_LEN + 1 } else { 1 };
    }

    let mut out = Vec::with_capacity(cursor as usize);
    let mut probe = first_probe;
    for (insn, selected) in code.iter().zip(sites) {
        if *selected {
            out.extend(probe_sequence(probe));
            probe += 1;
        }
        out.push(match insn.jump_target() {
            Some(target) => insn.with_jump_target(relocated[target as usize]),
            None => insn.clone(),
        });
    }
    out
}

/// Maps an index into rewritten code back to the index the instruction had
/// before the rewrite. An index inside an inserted run maps to the original
/// instruction that follows the run.
pub fn original_pc(code: &[Insn], pc: usize) -> usize {
    let mut index = 0;
    let mut original = 0;
    loop {
        let mut run = inserted_run(&code[index..], index == 0);
        while run > 0 {
            if pc < index + run {
                return original;
            }
            index += run;
            run = inserted_run(&code[index..], false);
        }
        if index >= pc || index >= code.len() {
            return original;
        }
        index += 1;
        original += 1;
    }
}

fn inserted_run(code: &[Insn], at_entry: bool) -> usize {
    match code {
        [Insn::PushInt(_), Insn::NewBoolArray, Insn::PutStatic(field), ..]
            if at_entry && field == PROBE_FIELD =>
        {
            3
        }
        [Insn::GetStatic(field), Insn::PushInt(_), Insn::PushBool(true), Insn::ArrayStore, ..]
            if field == PROBE_FIELD =>
        {
            PROBE_SEQUENCE_LEN as usize
        }
        _ => 0,
    }
}

fn install_probe_allocation(class: &mut ClassFile, probe_count: u32) {
    let prologue = [
        Insn::PushInt(probe_count as i64),
        Insn::NewBoolArray,
        Insn::PutStatic(PROBE_FIELD.to_string()),
    ];
    match class.initializer_index() {
        Some(index) => {
            let initializer = &mut class.methods[index];
            let shift = prologue.len() as u32;
            let mut code = prologue.to_vec();
            code.extend(initializer.code.iter().map(|insn| match insn.jump_target() {
                Some(target) => insn.with_jump_target(target + shift),
                None => insn.clone(),
            }));
            initializer.code = code;
        }
        None => {
            let mut code = prologue.to_vec();
            code.push(Insn::Return);
            class.methods.push(MethodDef {
                name: INITIALIZER_NAME.to_string(),
                params: Vec::new(),
                returns: ValueType::Void,
                max_locals: 0,
                code,
            });
        }
    }
}
