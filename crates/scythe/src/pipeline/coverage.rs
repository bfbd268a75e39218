//! Coverage instrumentation stage
//!
//! Two variants, chosen by [`InstrumentationApproach`]:
//!
//! - **Static**: every point calls `scythe/Recorder.lineFound` or
//!   `branchFound` with the module name and the point's slot. Cheap per
//!   module, one call per hit.
//! - **Array**: the module gets a static `int[]` counter field sized to its
//!   point count plus an accessor the recorder polls; every point increments
//!   its slot. One allocation per module, one array write per hit.
//!
//! Branch points take two slots per conditional jump. The fall-through slot
//! is counted right after the jump; the taken slot lives in a trampoline
//! appended to the method, which then continues at the original target.

use super::StageError;
use crate::bytecode::{
    Field, FieldKind, Instruction, Method, ModuleImage, ACC_STATIC, ACC_SYNTHETIC,
};
use crate::config::InstrumentationApproach;
use crate::naming::CanonicalName;
use serde::{Deserialize, Serialize};

/// Module receiving static-variant call-outs
pub const RECORDER_MODULE: &str = "scythe/Recorder";
/// Static-variant line callback
pub const LINE_HIT: &str = "lineFound";
/// Static-variant branch callback
pub const BRANCH_HIT: &str = "branchFound";
/// Counter field and accessor added by the array variant
pub const COUNTER_FIELD: &str = "__scythe_counters";

/// What a coverable point tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProbeKind {
    /// Execution of a source line
    Line {
        /// Line number
        line: u32,
    },
    /// One direction of a conditional jump
    Branch {
        /// Line of the jump
        line: u32,
        /// Jump taken (true) or fallen through (false)
        taken: bool,
    },
}

/// A single coverable point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    /// Counter slot / point identity within the module
    pub slot: u32,
    /// Method containing the point
    pub method: String,
    /// Tracked event
    #[serde(flatten)]
    pub kind: ProbeKind,
}

/// Every coverable point instrumented in one module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeTable {
    /// Instrumented module
    pub module: CanonicalName,
    /// Variant that produced the table
    pub approach: InstrumentationApproach,
    /// Points in slot order
    pub probes: Vec<Probe>,
}

impl ProbeTable {
    /// Number of points
    #[must_use]
    pub fn len(&self) -> usize {
        self.probes.len()
    }

    /// Whether the table has no points
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Number of line points
    #[must_use]
    pub fn line_count(&self) -> usize {
        self.probes
            .iter()
            .filter(|p| matches!(p.kind, ProbeKind::Line { .. }))
            .count()
    }

    /// Number of branch points
    #[must_use]
    pub fn branch_count(&self) -> usize {
        self.len() - self.line_count()
    }
}

/// Coverage stage variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverageVariant {
    /// Direct recorder call-outs
    Static,
    /// Per-module counter array
    Array,
}

/// Configured coverage stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverageStage {
    variant: CoverageVariant,
    lines: bool,
    branches: bool,
}

impl CoverageStage {
    /// Stage for `approach`, or `None` when instrumentation is disabled
    #[must_use]
    pub const fn new(approach: InstrumentationApproach, lines: bool, branches: bool) -> Option<Self> {
        let variant = match approach {
            InstrumentationApproach::Static => CoverageVariant::Static,
            InstrumentationApproach::Array => CoverageVariant::Array,
            InstrumentationApproach::None => return None,
        };
        Some(Self {
            variant,
            lines,
            branches,
        })
    }

    /// Selected variant
    #[must_use]
    pub const fn variant(&self) -> CoverageVariant {
        self.variant
    }

    const fn approach(&self) -> InstrumentationApproach {
        match self.variant {
            CoverageVariant::Static => InstrumentationApproach::Static,
            CoverageVariant::Array => InstrumentationApproach::Array,
        }
    }

    /// Instrument `image`; `None` when both point categories are off
    pub fn apply(
        &self,
        module: &CanonicalName,
        image: &mut ModuleImage,
    ) -> Result<Option<ProbeTable>, StageError> {
        if !self.lines && !self.branches {
            return Ok(None);
        }
        if self.variant == CoverageVariant::Array && image.field(COUNTER_FIELD).is_some() {
            return Err(StageError::AlreadyInstrumented {
                module: module.to_string(),
            });
        }

        let mut probes = Vec::new();
        let owner = image.name.clone();
        for method in image
            .methods
            .iter_mut()
            .filter(|m| m.flags & ACC_SYNTHETIC == 0)
        {
            self.instrument_method(module, &owner, method, &mut probes)?;
        }

        if self.variant == CoverageVariant::Array {
            let len = u32::try_from(probes.len()).map_err(|_| StageError::TooManyPoints {
                module: module.to_string(),
                count: probes.len(),
            })?;
            image.fields.push(Field::new(
                COUNTER_FIELD,
                FieldKind::IntArray(len),
                ACC_STATIC | ACC_SYNTHETIC,
            ));
            let mut accessor = Method::new(
                COUNTER_FIELD,
                vec![
                    Instruction::GetStatic {
                        owner: owner.clone(),
                        field: COUNTER_FIELD.to_string(),
                    },
                    Instruction::ReturnValue,
                ],
            );
            accessor.flags |= ACC_SYNTHETIC;
            image.methods.push(accessor);
        }

        Ok(Some(ProbeTable {
            module: module.clone(),
            approach: self.approach(),
            probes,
        }))
    }

    fn instrument_method(
        &self,
        module: &CanonicalName,
        owner: &str,
        method: &mut Method,
        probes: &mut Vec<Probe>,
    ) -> Result<(), StageError> {
        let mut labels = method.label_allocator();
        let mut out = Vec::with_capacity(method.code.len() * 2);
        let mut trampolines = Vec::new();
        let mut current_line = 0;

        for insn in std::mem::take(&mut method.code) {
            match insn {
                Instruction::Line(line) => {
                    current_line = line;
                    out.push(insn);
                    if self.lines {
                        let slot = next_slot(module, probes, &method.name, ProbeKind::Line { line })?;
                        out.extend(self.hit(module, owner, slot, false));
                    }
                }
                ref cond if self.branches && cond.is_conditional() => {
                    let Some(target) = cond.jump_target() else {
                        out.push(insn);
                        continue;
                    };
                    let trampoline = labels.fresh()?;
                    let taken = ProbeKind::Branch {
                        line: current_line,
                        taken: true,
                    };
                    let fallthrough = ProbeKind::Branch {
                        line: current_line,
                        taken: false,
                    };
                    let taken_slot = next_slot(module, probes, &method.name, taken)?;
                    let fall_slot = next_slot(module, probes, &method.name, fallthrough)?;

                    out.push(cond.retarget(trampoline));
                    out.extend(self.hit(module, owner, fall_slot, true));

                    trampolines.push(Instruction::Label(trampoline));
                    trampolines.extend(self.hit(module, owner, taken_slot, true));
                    trampolines.push(Instruction::Goto(target));
                }
                other => out.push(other),
            }
        }

        out.extend(trampolines);
        method.code = out;
        Ok(())
    }

    fn hit(&self, module: &CanonicalName, owner: &str, slot: i32, branch: bool) -> [Instruction; 3] {
        match self.variant {
            CoverageVariant::Static => [
                Instruction::Ldc(module.to_string()),
                Instruction::Push(slot),
                Instruction::Invoke {
                    owner: RECORDER_MODULE.to_string(),
                    method: if branch { BRANCH_HIT } else { LINE_HIT }.to_string(),
                },
            ],
            CoverageVariant::Array => [
                Instruction::GetStatic {
                    owner: owner.to_string(),
                    field: COUNTER_FIELD.to_string(),
                },
                Instruction::Push(slot),
                Instruction::ArrayInc,
            ],
        }
    }
}

fn next_slot(
    module: &CanonicalName,
    probes: &mut Vec<Probe>,
    method: &str,
    kind: ProbeKind,
) -> Result<i32, StageError> {
    let too_many = || StageError::TooManyPoints {
        module: module.to_string(),
        count: probes.len() + 1,
    };
    let slot = u32::try_from(probes.len()).map_err(|_| too_many())?;
    let as_operand = i32::try_from(slot).map_err(|_| too_many())?;
    probes.push(Probe {
        slot,
        method: method.to_string(),
        kind,
    });
    Ok(as_operand)
}
