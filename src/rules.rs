use std::{collections::HashSet, path::Path, sync::Arc};

use anyhow::{bail, Context, Result};
use include_dir::{include_dir, Dir};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::verifier::VerifierKind;

/// Builtin rule files, embedded at compile time.
static BUILTIN_RULES: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/data/rules");

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// A single compiled detection rule. Immutable after registry load.
#[derive(Debug)]
pub struct Rule {
    pub name: Arc<str>,
    pub pattern: regex::bytes::Regex,
    pub confidence: Confidence,
    pub verifier: Option<VerifierKind>,
}

/// On-disk rule syntax, one YAML document per rule family.
#[derive(Debug, Deserialize)]
struct RuleFile {
    rules: Vec<RuleSyntax>,
}

#[derive(Debug, Deserialize)]
struct RuleSyntax {
    name: String,
    pattern: String,
    confidence: Confidence,
    #[serde(default)]
    verifier: Option<VerifierKind>,
}

/// The loaded, filtered, compiled rule registry.
///
/// Safe for concurrent read; nothing mutates it after `load` returns.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Arc<Rule>>,
}

impl RuleSet {
    /// Load builtin rules, merge an optional user-supplied YAML file (user
    /// rules override builtins of the same name), then keep the rules whose
    /// confidence is in `filter`. An empty filter enables everything. Any
    /// regex that fails to compile is a fatal load error.
    pub fn load(filter: &[Confidence], user_rules: Option<&Path>) -> Result<Self> {
        let mut parsed = Self::parse_builtin()?;

        if let Some(path) = user_rules {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read rule file {}", path.display()))?;
            let file: RuleFile = serde_yaml::from_str(&text)
                .with_context(|| format!("failed to parse rule file {}", path.display()))?;
            for rule in file.rules {
                parsed.retain(|r: &RuleSyntax| r.name != rule.name);
                parsed.push(rule);
            }
        }

        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(parsed.len());
        for syntax in parsed {
            if !filter.is_empty() && !filter.contains(&syntax.confidence) {
                continue;
            }
            if !seen.insert(syntax.name.clone()) {
                bail!("duplicate rule name {:?}", syntax.name);
            }
            let pattern = regex::bytes::Regex::new(&syntax.pattern)
                .with_context(|| format!("rule {:?} has an invalid pattern", syntax.name))?;
            rules.push(Arc::new(Rule {
                name: syntax.name.into(),
                pattern,
                confidence: syntax.confidence,
                verifier: syntax.verifier,
            }));
        }
        rules.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn parse_builtin() -> Result<Vec<RuleSyntax>> {
        let mut files: Vec<_> = BUILTIN_RULES
            .find("*.yml")
            .expect("builtin rule glob is valid")
            .filter_map(|entry| entry.as_file())
            .collect();
        files.sort_by_key(|f| f.path().to_path_buf());

        let mut parsed = Vec::new();
        for file in files {
            let text = file
                .contents_utf8()
                .with_context(|| format!("builtin rule file {} is not UTF-8", file.path().display()))?;
            let rule_file: RuleFile = serde_yaml::from_str(text)
                .with_context(|| format!("builtin rule file {} is malformed", file.path().display()))?;
            parsed.extend(rule_file.rules);
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn builtins_compile_and_names_are_unique() {
        let rules = RuleSet::load(&[], None).expect("builtin rules load");
        assert!(rules.len() >= 30, "expected a real builtin set, got {}", rules.len());
    }

    #[test]
    fn empty_filter_enables_all_confidences() {
        let all = RuleSet::load(&[], None).unwrap();
        let high = RuleSet::load(&[Confidence::High], None).unwrap();
        assert!(high.len() < all.len());
        assert!(high.rules().iter().all(|r| r.confidence == Confidence::High));
    }

    #[test]
    fn filter_is_a_union() {
        let medium_high = RuleSet::load(&[Confidence::Medium, Confidence::High], None).unwrap();
        assert!(medium_high
            .rules()
            .iter()
            .all(|r| matches!(r.confidence, Confidence::Medium | Confidence::High)));
    }

    #[test]
    fn aws_access_key_rule_matches_canonical_key() {
        let rules = RuleSet::load(&[], None).unwrap();
        let rule = rules
            .rules()
            .iter()
            .find(|r| r.name.as_ref() == "aws-access-key")
            .expect("aws-access-key is a builtin rule");
        let hay = b"export AWS_ACCESS_KEY_ID=AKIA0123456789ABCDEF";
        let m = rule.pattern.find(hay).expect("key should match");
        assert_eq!(m.as_bytes(), b"AKIA0123456789ABCDEF");
    }

    #[test]
    fn generic_assignment_rule_matches_dotenv_style() {
        let rules = RuleSet::load(&[], None).unwrap();
        let rule = rules
            .rules()
            .iter()
            .find(|r| r.name.as_ref() == "generic-secret-assignment")
            .expect("generic-secret-assignment is a builtin rule");
        assert!(rule.pattern.is_match(b"SECRET=aaaaaaaaaaaaaaaaaaaa"));
        assert!(!rule.pattern.is_match(b"SECRET=short"));
    }

    #[test]
    fn user_rules_override_builtins_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("extra.yml");
        std::fs::write(
            &path,
            "rules:\n  - name: aws-access-key\n    pattern: 'OVERRIDDEN'\n    confidence: low\n  - name: site-local-token\n    pattern: 'tok_[a-z]{10}'\n    confidence: high\n",
        )
        .unwrap();

        let base = RuleSet::load(&[], None).unwrap();
        let merged = RuleSet::load(&[], Some(&path)).unwrap();
        assert_eq!(merged.len(), base.len() + 1);

        let overridden = merged
            .rules()
            .iter()
            .find(|r| r.name.as_ref() == "aws-access-key")
            .unwrap();
        assert_eq!(overridden.confidence, Confidence::Low);
        assert!(overridden.pattern.is_match(b"OVERRIDDEN"));
    }

    #[test]
    fn invalid_user_pattern_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yml");
        std::fs::write(
            &path,
            "rules:\n  - name: broken\n    pattern: '['\n    confidence: low\n",
        )
        .unwrap();
        assert!(RuleSet::load(&[], Some(&path)).is_err());
    }
}
