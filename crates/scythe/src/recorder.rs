//! Coverage recording
//!
//! The coverage stage tells the recorder which points a module carries; the
//! instrumented code then reports hits (static variant) or exposes counter
//! arrays the recorder polls (array variant). The on-disk format is JSON.

use crate::config::InstrumentationApproach;
use crate::naming::CanonicalName;
use crate::pipeline::{Probe, ProbeTable};
use crate::result::ScytheResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;
use tracing::{debug, warn};

/// Receives probe tables and hits, and persists coverage
pub trait CoverageRecorder: Send + Sync {
    /// A module was instrumented with `probes`
    fn module_instrumented(&self, probes: &ProbeTable);

    /// Point `slot` of `module` executed once
    fn record_hit(&self, module: &CanonicalName, slot: u32);

    /// Replace the counters of an array-instrumented module
    fn merge_counters(&self, module: &CanonicalName, counters: &[u64]);

    /// Persist everything recorded so far
    fn write_to(&self, path: &Path) -> ScytheResult<()>;
}

/// Hit count of one point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointCoverage {
    /// The point
    #[serde(flatten)]
    pub probe: Probe,
    /// Times executed
    pub hits: u64,
}

/// Coverage of one module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleCoverage {
    /// Module name
    pub module: CanonicalName,
    /// Variant it was instrumented with
    pub approach: InstrumentationApproach,
    /// Points with their hit counts
    pub points: Vec<PointCoverage>,
}

impl ModuleCoverage {
    /// Points hit at least once
    #[must_use]
    pub fn covered(&self) -> usize {
        self.points.iter().filter(|p| p.hits > 0).count()
    }
}

/// Serialized coverage report
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageSnapshot {
    /// Instrumented modules, by name
    pub modules: Vec<ModuleCoverage>,
}

impl CoverageSnapshot {
    /// Total points
    #[must_use]
    pub fn total_points(&self) -> usize {
        self.modules.iter().map(|m| m.points.len()).sum()
    }

    /// Points hit at least once
    #[must_use]
    pub fn covered_points(&self) -> usize {
        self.modules.iter().map(ModuleCoverage::covered).sum()
    }

    /// Read a report written by [`CoverageRecorder::write_to`]
    pub fn read_from(path: &Path) -> ScytheResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

#[derive(Debug)]
struct Entry {
    table: ProbeTable,
    hits: Vec<u64>,
}

/// In-memory [`CoverageRecorder`]
#[derive(Debug, Default)]
pub struct ProbeRegistry {
    modules: RwLock<BTreeMap<CanonicalName, Entry>>,
}

impl ProbeRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of instrumented modules
    #[must_use]
    pub fn module_count(&self) -> usize {
        self.modules
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Probe table of `module`
    #[must_use]
    pub fn probes(&self, module: &CanonicalName) -> Option<ProbeTable> {
        self.modules
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(module)
            .map(|entry| entry.table.clone())
    }

    /// Current report
    #[must_use]
    pub fn snapshot(&self) -> CoverageSnapshot {
        let modules = self
            .modules
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        CoverageSnapshot {
            modules: modules
                .values()
                .map(|entry| ModuleCoverage {
                    module: entry.table.module.clone(),
                    approach: entry.table.approach,
                    points: entry
                        .table
                        .probes
                        .iter()
                        .zip(entry.hits.iter())
                        .map(|(probe, hits)| PointCoverage {
                            probe: probe.clone(),
                            hits: *hits,
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

impl CoverageRecorder for ProbeRegistry {
    fn module_instrumented(&self, probes: &ProbeTable) {
        debug!(module = %probes.module, points = probes.len(), "registered probes");
        self.modules
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(
                probes.module.clone(),
                Entry {
                    table: probes.clone(),
                    hits: vec![0; probes.len()],
                },
            );
    }

    fn record_hit(&self, module: &CanonicalName, slot: u32) {
        let mut modules = self
            .modules
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let hit = modules
            .get_mut(module)
            .and_then(|entry| entry.hits.get_mut(slot as usize));
        match hit {
            Some(count) => *count = count.saturating_add(1),
            None => warn!(module = %module, slot, "hit for unknown coverage point"),
        }
    }

    fn merge_counters(&self, module: &CanonicalName, counters: &[u64]) {
        let mut modules = self
            .modules
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(entry) = modules.get_mut(module) else {
            warn!(module = %module, "counters for a module that was never instrumented");
            return;
        };
        if counters.len() != entry.hits.len() {
            warn!(
                module = %module,
                expected = entry.hits.len(),
                actual = counters.len(),
                "counter array size mismatch"
            );
        }
        for (hits, counter) in entry.hits.iter_mut().zip(counters) {
            *hits = *counter;
        }
    }

    fn write_to(&self, path: &Path) -> ScytheResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        std::fs::write(path, json)?;
        debug!(path = %path.display(), "wrote coverage");
        Ok(())
    }
}
