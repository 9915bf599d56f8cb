use crate::error::ProbeAccessError;
use crate::instrument::IndexRange;
use crate::runtime::{FieldAccessor, LoadedUnit, RtValue};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The coverage of one unit since its probe vector was last reset.
///
/// Each successful collection produces a fresh `CoverageInfo`; nothing is
/// accumulated across collections. `ranges_by_member` tells the caller which
/// probe indices belong to which member, so `visited_indices` can be mapped
/// back to source members without consulting the worker again.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, Encode, Decode)]
pub struct CoverageInfo {
    /// Member signature to its half-open probe index range.
    pub ranges_by_member: BTreeMap<String, IndexRange>,
    /// Probe indices set since the last reset, ascending.
    pub visited_indices: Vec<u32>,
}

impl CoverageInfo {
    /// Returns the visited probes that fall inside `member`'s range.
    ///
    /// # Arguments
    /// * `member`: A member signature such as `abs(I)I`.
    ///
    /// # Returns
    /// The matching probe indices in ascending order. An unknown member
    /// yields an empty vector.
    pub fn visited_in(&self, member: &str) -> Vec<u32> {
        match self.ranges_by_member.get(member) {
            Some(range) => self
                .visited_indices
                .iter()
                .copied()
                .filter(|index| range.contains(*index))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.visited_indices.is_empty()
    }
}

/// Reads and resets the probe vector of an instrumented unit.
///
/// The collector only ever runs on the worker's executor thread, between
/// invocations, so no target code can be writing to the vector while it is
/// being read.
pub struct CoverageCollector;

impl CoverageCollector {
    /// Collects the visited probe indices of `unit` and clears its probe vector.
    ///
    /// The vector lives in a private static field; it is read through
    /// [`FieldAccessor`] under a scoped access override, so the field is
    /// private again as soon as this returns.
    ///
    /// # Arguments
    /// * `unit`: The loaded unit. It must have been transformed by a coverage
    ///   strategy, which is when it carries a probe layout.
    /// * `ranges_by_member`: The member ranges the strategy reports for the
    ///   unit, copied into the result.
    ///
    /// # Returns
    /// The coverage since the previous collection, or a `ProbeAccessError` if
    /// the unit carries no layout, the field is absent, or the field does not
    /// hold a bool array of exactly `probe_count` slots.
    pub fn collect(
        unit: &LoadedUnit,
        ranges_by_member: BTreeMap<String, IndexRange>,
    ) -> Result<CoverageInfo, ProbeAccessError> {
        let layout = unit
            .layout()
            .ok_or_else(|| ProbeAccessError::NotInstrumented {
                unit: unit.name().to_string(),
            })?;
        let field = layout.descriptor.field_name.as_str();
        let missing = || ProbeAccessError::Missing {
            unit: unit.name().to_string(),
            field: field.to_string(),
        };

        let _access = unit.override_access(field).map_err(|_| missing())?;
        let value = unit.read_static(field).map_err(|_| missing())?;
        let expected = layout.descriptor.probe_count;
        let wrong_shape = |found: String| ProbeAccessError::WrongShape {
            unit: unit.name().to_string(),
            field: field.to_string(),
            expected,
            found,
        };

        let cells = match value {
            RtValue::BoolArray(cells) => cells,
            other => return Err(wrong_shape(other.type_name().to_string())),
        };
        let mut slots = cells.borrow_mut();
        if slots.len() != expected as usize {
            return Err(wrong_shape(format!("bool[{}]", slots.len())));
        }

        let visited_indices = slots
            .iter()
            .enumerate()
            .filter(|(_, hit)| **hit)
            .map(|(index, _)| index as u32)
            .collect();
        slots.iter_mut().for_each(|hit| *hit = false);

        Ok(CoverageInfo {
            ranges_by_member,
            visited_indices,
        })
    }
}
