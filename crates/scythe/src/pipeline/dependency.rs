//! Dependency graph stage
//!
//! Records, for every module passing through the pipeline, the other modules
//! it references (supertypes, interfaces, invoked, instantiated and accessed
//! modules). The image itself is left untouched.

use crate::bytecode::ModuleImage;
use crate::naming::CanonicalName;
use crate::result::ScytheResult;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::RwLock;

/// Modules referenced by `image`, excluding itself
#[must_use]
pub fn collect_dependencies(image: &ModuleImage) -> BTreeSet<CanonicalName> {
    let own = CanonicalName::new(&image.name);
    image
        .super_name
        .iter()
        .chain(image.interfaces.iter())
        .map(String::as_str)
        .chain(
            image
                .methods
                .iter()
                .flat_map(|m| m.code.iter())
                .filter_map(|insn| insn.referenced_module()),
        )
        .map(CanonicalName::new)
        .filter(|dep| !dep.is_empty() && *dep != own)
        .collect()
}

/// Serializable view of a [`DependencyGraph`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySnapshot {
    /// Module to the modules it references
    pub modules: BTreeMap<CanonicalName, BTreeSet<CanonicalName>>,
}

/// Accumulated module dependency graph
#[derive(Debug, Default)]
pub struct DependencyGraph {
    edges: RwLock<BTreeMap<CanonicalName, BTreeSet<CanonicalName>>>,
}

impl DependencyGraph {
    /// Create an empty graph
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outgoing edges of `module`, replacing earlier ones
    pub fn record(&self, module: CanonicalName, dependencies: BTreeSet<CanonicalName>) {
        self.edges
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(module, dependencies);
    }

    /// Modules `module` references
    #[must_use]
    pub fn dependencies_of(&self, module: &CanonicalName) -> BTreeSet<CanonicalName> {
        self.edges
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(module)
            .cloned()
            .unwrap_or_default()
    }

    /// Recorded modules that reference `module`
    #[must_use]
    pub fn dependents_of(&self, module: &CanonicalName) -> BTreeSet<CanonicalName> {
        self.edges
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .filter(|(_, deps)| deps.contains(module))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Number of recorded modules
    #[must_use]
    pub fn len(&self) -> usize {
        self.edges
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether nothing has been recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current graph
    #[must_use]
    pub fn snapshot(&self) -> DependencySnapshot {
        DependencySnapshot {
            modules: self
                .edges
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone(),
        }
    }

    /// Write the graph as pretty JSON
    pub fn write_json(&self, path: &Path) -> ScytheResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
