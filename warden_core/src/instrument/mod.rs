pub mod rewriter;

pub use rewriter::{
    IndexRange, PROBE_FIELD, ProbeDescriptor, ProbeLayout, Rewriter, SitePolicy, original_pc,
};

use crate::coverage::CoverageCollector;
use crate::error::{ProbeAccessError, TransformError, WorkerError};
use crate::loader::UnitLoader;
use crate::protocol::{RequestBody, ResponseBody};
use crate::runtime::LoadedUnit;
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Encode, Decode,
)]
#[serde(rename_all = "kebab-case")]
pub enum InstrumentationKind {
    /// Plain invocation, units load unmodified.
    Invoke,
    InstructionCoverage,
    #[default]
    BranchCoverage,
}

impl InstrumentationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentationKind::Invoke => "invoke",
            InstrumentationKind::InstructionCoverage => "instruction-coverage",
            InstrumentationKind::BranchCoverage => "branch-coverage",
        }
    }
}

impl fmt::Display for InstrumentationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstrumentationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invoke" => Ok(InstrumentationKind::Invoke),
            "instruction-coverage" => Ok(InstrumentationKind::InstructionCoverage),
            "branch-coverage" => Ok(InstrumentationKind::BranchCoverage),
            other => Err(format!(
                "unknown instrumentation '{other}', expected invoke, instruction-coverage or branch-coverage"
            )),
        }
    }
}

/// Output of a load-time transform.
#[derive(Debug, Clone)]
pub struct Transformed {
    pub binary: Vec<u8>,
    pub layout: Option<ProbeLayout>,
}

/// A pluggable instrumentation installed once per worker.
///
/// `transform` runs as the load hook for every unit resolved from a user
/// path. `handle` gets the first chance at strategy-specific commands and
/// returns `None` for commands it does not understand.
pub trait InstrumentationStrategy {
    fn kind(&self) -> InstrumentationKind;

    fn transform(&self, unit_binary: &[u8], unit_name: &str) -> Result<Transformed, TransformError>;

    fn handle(
        &self,
        request: &RequestBody,
        loader: &mut UnitLoader,
    ) -> Option<Result<ResponseBody, WorkerError>>;

    fn compute_ranges(&self, unit: &LoadedUnit) -> Option<BTreeMap<String, IndexRange>>;
}

pub fn create(kind: InstrumentationKind) -> Rc<dyn InstrumentationStrategy> {
    match kind {
        InstrumentationKind::Invoke => Rc::new(InvokeStrategy),
        InstrumentationKind::InstructionCoverage => {
            Rc::new(CoverageStrategy::new(kind, SitePolicy::EveryInstruction))
        }
        InstrumentationKind::BranchCoverage => {
            Rc::new(CoverageStrategy::new(kind, SitePolicy::BranchTargets))
        }
    }
}

/// Identity transform.
#[derive(Debug, Default)]
pub struct InvokeStrategy;

impl InstrumentationStrategy for InvokeStrategy {
    fn kind(&self) -> InstrumentationKind {
        InstrumentationKind::Invoke
    }

    fn transform(&self, unit_binary: &[u8], _unit_name: &str) -> Result<Transformed, TransformError> {
        Ok(Transformed {
            binary: unit_binary.to_vec(),
            layout: None,
        })
    }

    fn handle(
        &self,
        _request: &RequestBody,
        _loader: &mut UnitLoader,
    ) -> Option<Result<ResponseBody, WorkerError>> {
        None
    }

    fn compute_ranges(&self, _unit: &LoadedUnit) -> Option<BTreeMap<String, IndexRange>> {
        None
    }
}

/// Rewrites user units with probes and answers `CollectCoverage`. The two
/// coverage kinds differ only in their site policy and share nothing else.
#[derive(Debug)]
pub struct CoverageStrategy {
    kind: InstrumentationKind,
    rewriter: Rewriter,
}

impl CoverageStrategy {
    pub fn new(kind: InstrumentationKind, policy: SitePolicy) -> Self {
        Self {
            kind,
            rewriter: Rewriter::new(policy),
        }
    }
}

impl InstrumentationStrategy for CoverageStrategy {
    fn kind(&self) -> InstrumentationKind {
        self.kind
    }

    fn transform(&self, unit_binary: &[u8], unit_name: &str) -> Result<Transformed, TransformError> {
        let (binary, layout) = self.rewriter.rewrite(unit_binary, unit_name)?;
        log::debug!(
            "{} instrumented {} with {} probes",
            self.kind,
            unit_name,
            layout.descriptor.probe_count
        );
        Ok(Transformed {
            binary,
            layout: Some(layout),
        })
    }

    fn handle(
        &self,
        request: &RequestBody,
        loader: &mut UnitLoader,
    ) -> Option<Result<ResponseBody, WorkerError>> {
        let RequestBody::CollectCoverage { unit } = request else {
            return None;
        };
        let collected = loader
            .load(unit)
            .map_err(WorkerError::from)
            .and_then(|loaded| {
                let ranges = self.compute_ranges(&loaded).ok_or_else(|| {
                    ProbeAccessError::NotInstrumented {
                        unit: loaded.name().to_string(),
                    }
                })?;
                Ok(CoverageCollector::collect(&loaded, ranges)?)
            })
            .map(ResponseBody::Coverage);
        Some(collected)
    }

    fn compute_ranges(&self, unit: &LoadedUnit) -> Option<BTreeMap<String, IndexRange>> {
        unit.layout().map(|layout| layout.ranges_by_member.clone())
    }
}
