use crate::TallyError;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// One entry of an alias file.
#[derive(Debug, Clone, Deserialize)]
pub struct AliasRule {
    pub pattern: String,
    pub canonical: String,
}

/// Ordered owner-name canonicalization. First matching pattern wins; names
/// that match nothing canonicalize to themselves.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    rules: Vec<(Regex, String)>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Compile rules case-insensitively, keeping their order.
    pub fn from_rules(rules: &[AliasRule]) -> Result<Self, TallyError> {
        let mut table = Self::new();
        for rule in rules {
            table = table.with_rule(&rule.pattern, &rule.canonical)?;
        }
        Ok(table)
    }

    pub fn with_rule(mut self, pattern: &str, canonical: &str) -> Result<Self, TallyError> {
        // Unanchored: a pattern matches anywhere in the name.
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()?;
        self.rules.push((regex, canonical.to_string()));
        Ok(self)
    }

    /// Load a JSON array of `{ "pattern": ..., "canonical": ... }`.
    pub fn load(path: &Path) -> Result<Self, TallyError> {
        let text = fs::read_to_string(path)?;
        let rules: Vec<AliasRule> = serde_json::from_str(&text)?;
        tracing::info!(path = %path.display(), rules = rules.len(), "loaded alias rules");
        Self::from_rules(&rules)
    }

    /// Default rules for the tracker's known device names.
    pub fn builtin() -> Result<Self, TallyError> {
        Self::new()
            .with_rule("(Big.*P.*|Isaac.*|.*moto.*|iha)", "ia")?
            .with_rule("(Big.*Ma.*)", "jr")?
            .with_rule("(Rye.*|Kitty.*)", "jl")?
            .with_rule("Kayleigh.*", "kd")?
            .with_rule("(KK.*|kek)", "kk")?
            .with_rule("Bob.*", "rj")?
            .with_rule("(Pam.*|Rathbone.*)", "pr")?
            .with_rule("Ric", "ric")?
            .with_rule("Twenty7.*", "mat")
    }

    pub fn canonicalize(&self, name: &str) -> String {
        self.rules
            .iter()
            .find(|(regex, _)| regex.is_match(name))
            .map(|(_, canonical)| canonical.clone())
            .unwrap_or_else(|| name.to_string())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
