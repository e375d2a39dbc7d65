use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pattern::rules::{DoubleNegation, IdentityRemoval, SumSimplify};
use crate::pattern::{names, FrozenPatternSet, PatternSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PatternsLevel {
    NoPatterns,
    Minimal,
    #[default]
    Default,
    All,
}

/// Which patterns run during `prepare`.
///
/// The level picks the defaults; per-name overrides win over the level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Patterns {
    pub level: PatternsLevel,
    overrides: BTreeMap<String, bool>,
    /// Raise the priority of inplace variants that write into matmul-like outputs.
    pub update_inplace_priorities_for_ipu: bool,
}

impl Default for Patterns {
    fn default() -> Self {
        Self::new(PatternsLevel::Default)
    }
}

impl Patterns {
    pub fn new(level: PatternsLevel) -> Self {
        Self {
            level,
            overrides: BTreeMap::new(),
            update_inplace_priorities_for_ipu: false,
        }
    }

    fn level_default(&self, name: &str) -> bool {
        match self.level {
            PatternsLevel::NoPatterns => false,
            PatternsLevel::Minimal => name == names::IDENTITY_REMOVAL || name == names::INPLACE,
            PatternsLevel::Default | PatternsLevel::All => true,
        }
    }

    /// Turns a pattern on or off by name. Unknown names are a configuration error.
    pub fn enable(&mut self, name: &str, enabled: bool) -> Result<&mut Self> {
        if !names::ALL.contains(&name) {
            return Err(Error::config(format!(
                "unknown pattern '{name}'; known patterns are {}",
                names::ALL.join(", ")
            )));
        }
        self.overrides.insert(name.to_string(), enabled);
        Ok(self)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.overrides
            .get(name)
            .copied()
            .unwrap_or_else(|| self.level_default(name))
    }

    pub fn inplace_enabled(&self) -> bool {
        self.is_enabled(names::INPLACE)
    }

    pub fn set_inplace(&mut self, enabled: bool) -> &mut Self {
        self.overrides.insert(names::INPLACE.to_string(), enabled);
        self
    }

    /// Enabled patterns that run before aliasing is introduced.
    pub fn pre_alias_patterns(&self) -> FrozenPatternSet {
        let mut set = PatternSet::new();
        if self.is_enabled(names::IDENTITY_REMOVAL) {
            set.add(IdentityRemoval);
        }
        if self.is_enabled(names::DOUBLE_NEGATION) {
            set.add(DoubleNegation);
        }
        if self.is_enabled(names::SUM_SIMPLIFY) {
            set.add(SumSimplify);
        }
        set.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn overrides_win_over_level() {
        let mut patterns = Patterns::new(PatternsLevel::NoPatterns);
        assert!(!patterns.inplace_enabled());
        patterns.enable(names::INPLACE, true).unwrap();
        assert!(patterns.inplace_enabled());
        assert!(patterns.pre_alias_patterns().is_empty());

        let mut patterns = Patterns::default();
        patterns.enable(names::SUM_SIMPLIFY, false).unwrap();
        assert_eq!(
            patterns.pre_alias_patterns().names(),
            vec![names::IDENTITY_REMOVAL, names::DOUBLE_NEGATION]
        );
    }

    #[test]
    fn unknown_pattern_is_rejected() {
        let err = Patterns::default().enable("Conv1dToConv", true).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn deserializes_with_defaults() {
        let patterns: Patterns = serde_json::from_str(r#"{"level": "Minimal"}"#).unwrap();
        assert!(patterns.is_enabled(names::IDENTITY_REMOVAL));
        assert!(!patterns.is_enabled(names::SUM_SIMPLIFY));
    }
}
