//! Supertype substitution stage
//!
//! Rewrites the declared super module and interfaces of an image through a
//! replacement table, so a test session can swap a framework base type for a
//! tracking subclass without touching the module body.

use crate::bytecode::ModuleImage;
use crate::naming::CanonicalName;
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Mutable replacement table owned by a session
#[derive(Debug, Default)]
pub struct SuperclassReplacements {
    table: RwLock<BTreeMap<CanonicalName, CanonicalName>>,
}

impl SuperclassReplacements {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace `original` by `replacement`; returns the previous replacement
    pub fn insert(
        &self,
        original: impl Into<CanonicalName>,
        replacement: impl Into<CanonicalName>,
    ) -> Option<CanonicalName> {
        self.table
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(original.into(), replacement.into())
    }

    /// Drop the replacement for `original`
    pub fn remove(&self, original: &CanonicalName) -> Option<CanonicalName> {
        self.table
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(original)
    }

    /// Current replacement for `original`
    #[must_use]
    pub fn replacement_for(&self, original: &CanonicalName) -> Option<CanonicalName> {
        self.table
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(original)
            .cloned()
    }

    /// Whether no replacement is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .is_empty()
    }

    /// Stage over a copy of the current table, or `None` if it is empty
    #[must_use]
    pub fn stage(&self) -> Option<SubstitutionStage> {
        let table = self
            .table
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        (!table.is_empty()).then_some(SubstitutionStage { table })
    }
}

/// Substitution stage with a fixed table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubstitutionStage {
    table: BTreeMap<CanonicalName, CanonicalName>,
}

impl SubstitutionStage {
    /// Rewrite supertypes of `image`; returns how many were replaced
    pub fn apply(&self, image: &mut ModuleImage) -> usize {
        let own = CanonicalName::new(&image.name);
        let mut replaced = 0;
        let mut substitute = |declared: &mut String| {
            if let Some(replacement) = self.table.get(&CanonicalName::new(declared)) {
                // a replacement never becomes its own supertype
                if *replacement != own {
                    *declared = replacement.to_string();
                    replaced += 1;
                }
            }
        };
        if let Some(super_name) = image.super_name.as_mut() {
            substitute(super_name);
        }
        for interface in &mut image.interfaces {
            substitute(interface);
        }
        replaced
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_table_has_no_stage() {
        assert!(SuperclassReplacements::new().stage().is_none());
    }

    #[test]
    fn test_replaces_super_and_interfaces() {
        let replacements = SuperclassReplacements::new();
        replacements.insert("fw.Base", "tracking/Base");
        replacements.insert("fw/Listener", "tracking/Listener");
        let stage = replacements.stage().unwrap();

        let mut image = ModuleImage::new("app/Foo")
            .with_super("fw/Base")
            .with_interface("fw/Listener")
            .with_interface("app/Other");
        assert_eq!(stage.apply(&mut image), 2);
        assert_eq!(image.super_name.as_deref(), Some("tracking/Base"));
        assert_eq!(image.interfaces, vec!["tracking/Listener", "app/Other"]);
    }

    #[test]
    fn test_replacement_module_keeps_its_own_super() {
        let replacements = SuperclassReplacements::new();
        replacements.insert("fw/Base", "tracking/Base");
        let stage = replacements.stage().unwrap();

        let mut image = ModuleImage::new("tracking/Base").with_super("fw/Base");
        assert_eq!(stage.apply(&mut image), 0);
        assert_eq!(image.super_name.as_deref(), Some("fw/Base"));
    }

    #[test]
    fn test_stage_is_a_snapshot() {
        let replacements = SuperclassReplacements::new();
        replacements.insert("fw/Base", "tracking/Base");
        let stage = replacements.stage().unwrap();
        replacements.remove(&CanonicalName::new("fw/Base"));
        assert!(replacements.is_empty());

        let mut image = ModuleImage::new("app/Foo").with_super("fw/Base");
        assert_eq!(stage.apply(&mut image), 1);
    }

    #[test]
    fn test_insert_returns_previous() {
        let replacements = SuperclassReplacements::new();
        assert!(replacements.insert("a/B", "c/D").is_none());
        assert_eq!(
            replacements.insert("a/B", "e/F"),
            Some(CanonicalName::new("c/D"))
        );
        assert_eq!(
            replacements.replacement_for(&CanonicalName::new("a.B")),
            Some(CanonicalName::new("e/F"))
        );
    }
}
