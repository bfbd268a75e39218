//! Mutant visitation stage
//!
//! Enumerates every mutable site of a module into a catalog and applies the
//! mutants a session has switched on. Sites are numbered per module in method
//! then instruction order, before any other stage rewrites the code, so a
//! mutant id stays stable across runs.

use crate::bytecode::{Instruction, ModuleImage, ACC_SYNTHETIC};
use crate::naming::CanonicalName;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::RwLock;

/// Kind of change a mutant makes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOperator {
    /// `add`/`sub` and `mul`/`div` swapped
    ArithmeticReplacement,
    /// Condition of a conditional jump inverted
    NegateConditional,
}

/// Stable identity of a mutant: module plus site index
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MutantId {
    /// Owning module
    pub module: CanonicalName,
    /// Site index within the module
    pub index: u32,
}

impl MutantId {
    /// Create an id
    #[must_use]
    pub fn new(module: impl Into<CanonicalName>, index: u32) -> Self {
        Self {
            module: module.into(),
            index,
        }
    }
}

impl fmt::Display for MutantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.module, self.index)
    }
}

/// A mutable instruction found in a module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutantSite {
    /// Mutant identity
    pub id: MutantId,
    /// Method containing the site
    pub method: String,
    /// Instruction index within the method
    pub instruction: usize,
    /// Applied operator
    pub operator: MutationOperator,
    /// Original instruction, as listed
    pub original: String,
    /// Replacement instruction, as listed
    pub replacement: String,
}

/// Replacement for `insn`, if it is a mutable site
#[must_use]
pub fn mutant_of(insn: &Instruction) -> Option<(Instruction, MutationOperator)> {
    use MutationOperator::{ArithmeticReplacement, NegateConditional};
    let mutant = match insn {
        Instruction::Add => (Instruction::Sub, ArithmeticReplacement),
        Instruction::Sub => (Instruction::Add, ArithmeticReplacement),
        Instruction::Mul => (Instruction::Div, ArithmeticReplacement),
        Instruction::Div => (Instruction::Mul, ArithmeticReplacement),
        Instruction::IfZero(l) => (Instruction::IfNonZero(*l), NegateConditional),
        Instruction::IfNonZero(l) => (Instruction::IfZero(*l), NegateConditional),
        Instruction::IfLt(l) => (Instruction::IfGe(*l), NegateConditional),
        Instruction::IfGe(l) => (Instruction::IfLt(*l), NegateConditional),
        _ => return None,
    };
    Some(mutant)
}

/// Mutation stage over a fixed set of active mutants
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationStage {
    active: BTreeSet<MutantId>,
}

impl MutationStage {
    /// Stage applying `active`
    #[must_use]
    pub fn new(active: BTreeSet<MutantId>) -> Self {
        Self { active }
    }

    /// Enumerate the sites of `image` and apply the active ones
    pub fn apply(&self, module: &CanonicalName, image: &mut ModuleImage) -> Vec<MutantSite> {
        let mut sites = Vec::new();
        let mut index = 0u32;
        for method in image
            .methods
            .iter_mut()
            .filter(|m| m.flags & ACC_SYNTHETIC == 0)
        {
            for (at, insn) in method.code.iter_mut().enumerate() {
                let Some((replacement, operator)) = mutant_of(insn) else {
                    continue;
                };
                let id = MutantId::new(module.clone(), index);
                index = index.saturating_add(1);
                sites.push(MutantSite {
                    id: id.clone(),
                    method: method.name.clone(),
                    instruction: at,
                    operator,
                    original: insn.to_string(),
                    replacement: replacement.to_string(),
                });
                if self.active.contains(&id) {
                    *insn = replacement;
                }
            }
        }
        sites
    }
}

/// Mutant sites seen so far, plus the active selection
#[derive(Debug, Default)]
pub struct MutationCatalog {
    sites: RwLock<BTreeMap<CanonicalName, Vec<MutantSite>>>,
    active: RwLock<BTreeSet<MutantId>>,
}

impl MutationCatalog {
    /// Create an empty catalog
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the sites of `module`, replacing earlier ones
    pub fn record(&self, module: CanonicalName, sites: Vec<MutantSite>) {
        self.sites
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(module, sites);
    }

    /// Sites recorded for `module`
    #[must_use]
    pub fn sites(&self, module: &CanonicalName) -> Vec<MutantSite> {
        self.sites
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(module)
            .cloned()
            .unwrap_or_default()
    }

    /// Every recorded site, ordered by module
    #[must_use]
    pub fn all_sites(&self) -> Vec<MutantSite> {
        self.sites
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    /// Switch a mutant on for modules transformed from now on
    pub fn activate(&self, id: MutantId) -> bool {
        self.active
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id)
    }

    /// Switch a mutant off
    pub fn deactivate(&self, id: &MutantId) -> bool {
        self.active
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(id)
    }

    /// Stage over the current active selection
    #[must_use]
    pub fn stage(&self) -> MutationStage {
        MutationStage::new(
            self.active
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone(),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::bytecode::{Label, Method};

    fn image() -> ModuleImage {
        ModuleImage::new("app/Calc").with_method(Method::new(
            "run",
            vec![
                Instruction::Load(0),
                Instruction::Push(1),
                Instruction::Add,
                Instruction::IfLt(Label(0)),
                Instruction::Push(2),
                Instruction::Mul,
                Instruction::Label(Label(0)),
                Instruction::Return,
            ],
        ))
    }

    fn name() -> CanonicalName {
        CanonicalName::new("app/Calc")
    }

    #[test]
    fn test_enumerates_sites_without_changing_code() {
        let mut image = image();
        let sites = MutationStage::default().apply(&name(), &mut image);
        assert_eq!(sites.len(), 3);
        assert_eq!(sites[0].instruction, 2);
        assert_eq!(sites[0].operator, MutationOperator::ArithmeticReplacement);
        assert_eq!(sites[1].operator, MutationOperator::NegateConditional);
        assert_eq!(sites[2].id, MutantId::new("app/Calc", 2));
        assert_eq!(image, self::image());
    }

    #[test]
    fn test_applies_active_mutant() {
        let mut image = image();
        let stage = MutationStage::new(BTreeSet::from([MutantId::new("app/Calc", 1)]));
        stage.apply(&name(), &mut image);
        let code = &image.method("run").unwrap().code;
        assert_eq!(code[2], Instruction::Add);
        assert_eq!(code[3], Instruction::IfGe(Label(0)));
    }

    #[test]
    fn test_other_module_mutant_ignored() {
        let mut image = image();
        let stage = MutationStage::new(BTreeSet::from([MutantId::new("app/Other", 0)]));
        stage.apply(&name(), &mut image);
        assert_eq!(image, self::image());
    }

    #[test]
    fn test_mutant_of_is_an_involution() {
        for insn in [
            Instruction::Add,
            Instruction::Mul,
            Instruction::IfZero(Label(1)),
            Instruction::IfLt(Label(2)),
        ] {
            let (mutant, _) = mutant_of(&insn).unwrap();
            let (back, _) = mutant_of(&mutant).unwrap();
            assert_eq!(back, insn);
        }
        assert!(mutant_of(&Instruction::Return).is_none());
    }

    #[test]
    fn test_catalog() {
        let catalog = MutationCatalog::new();
        let mut image = image();
        let sites = catalog.stage().apply(&name(), &mut image);
        catalog.record(name(), sites);
        assert_eq!(catalog.sites(&name()).len(), 3);
        assert_eq!(catalog.all_sites().len(), 3);

        let id = MutantId::new("app/Calc", 0);
        assert!(catalog.activate(id.clone()));
        assert!(!catalog.activate(id.clone()));
        assert!(catalog.deactivate(&id));
        assert_eq!(id.to_string(), "app/Calc#0");
    }
}
