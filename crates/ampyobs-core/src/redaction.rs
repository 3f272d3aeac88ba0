//! Redaction rules applied to outgoing key/value pairs
//!
//! Rules are evaluated in order and the first match wins. A match replaces the
//! whole value with the marker. Key rules look at the attribute name, value
//! rules look for secret-shaped content regardless of the name.

use crate::records::{KeyValue, Signal};
use parking_lot::RwLock;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::{Arc, LazyLock};
use thiserror::Error;

/// Replacement for redacted values
pub const DEFAULT_MARKER: &str = "[REDACTED]";

#[derive(Debug, Error)]
pub enum RedactionError {
    #[error("Invalid redaction pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Redaction marker must not be empty")]
    EmptyMarker,
}

/// Which signals a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    #[default]
    All,
    Logs,
    Spans,
    Metrics,
}

impl RuleScope {
    pub fn covers(&self, signal: Signal) -> bool {
        matches!(
            (self, signal),
            (RuleScope::All, _)
                | (RuleScope::Logs, Signal::Logs)
                | (RuleScope::Spans, Signal::Traces)
                | (RuleScope::Metrics, Signal::Metrics)
        )
    }
}

/// What a rule's pattern is matched against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleTarget {
    #[default]
    Key,
    Value,
}

/// A redaction rule as configured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactionRule {
    pub pattern: String,
    #[serde(default)]
    pub scope: RuleScope,
    #[serde(default)]
    pub target: RuleTarget,
}

impl RedactionRule {
    pub fn key(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            scope: RuleScope::All,
            target: RuleTarget::Key,
        }
    }

    pub fn value(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            scope: RuleScope::All,
            target: RuleTarget::Value,
        }
    }

    pub fn scoped(mut self, scope: RuleScope) -> Self {
        self.scope = scope;
        self
    }

    fn compile(&self) -> Result<CompiledRule, RedactionError> {
        // key names match case-insensitively; value patterns are taken as written
        let regex = RegexBuilder::new(&self.pattern)
            .case_insensitive(self.target == RuleTarget::Key)
            .build()
            .map_err(|source| RedactionError::InvalidPattern {
                pattern: self.pattern.clone(),
                source,
            })?;
        Ok(CompiledRule {
            rule: self.clone(),
            regex,
        })
    }
}

const DEFAULT_KEY_PATTERNS: &[&str] = &[
    r"secret",
    r"passw(or)?d",
    r"token",
    r"credential",
    r"api[_-]?key",
    r"private[_-]?key",
    r"authorization",
    r"cookie",
    r"^key$",
];

const DEFAULT_VALUE_PATTERNS: &[&str] = &[
    // provider API keys
    r"sk-[a-zA-Z0-9_-]{20,}",
    // Bearer tokens
    r"(?i)bearer\s+[a-zA-Z0-9_.=-]{20,}",
    // JWT
    r"eyJ[a-zA-Z0-9_-]*\.eyJ[a-zA-Z0-9_-]*\.[a-zA-Z0-9_-]*",
    // AWS access keys
    r"AKIA[0-9A-Z]{16}",
    // GitHub tokens
    r"gh[pousr]_[a-zA-Z0-9]{36,}",
    // Slack tokens
    r"xox[baprs]-[0-9a-zA-Z-]+",
];

/// Built-in rules, key rules first
pub fn default_rules() -> Vec<RedactionRule> {
    DEFAULT_KEY_PATTERNS
        .iter()
        .map(|p| RedactionRule::key(*p))
        .chain(DEFAULT_VALUE_PATTERNS.iter().map(|p| RedactionRule::value(*p)))
        .collect()
}

static DEFAULT_COMPILED: LazyLock<Vec<CompiledRule>> = LazyLock::new(|| {
    default_rules()
        .iter()
        .map(|rule| rule.compile().expect("built-in redaction pattern"))
        .collect()
});

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: RedactionRule,
    regex: Regex,
}

/// Ordered rule list plus marker
#[derive(Debug, Clone)]
pub struct Redactor {
    rules: Vec<CompiledRule>,
    marker: String,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl Redactor {
    /// Compile `rules` in order. Fails on the first invalid pattern.
    pub fn new(rules: &[RedactionRule], marker: impl Into<String>) -> Result<Self, RedactionError> {
        let marker = marker.into();
        if marker.is_empty() {
            return Err(RedactionError::EmptyMarker);
        }
        let rules = rules
            .iter()
            .map(RedactionRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules, marker })
    }

    /// The built-in rule set with the default marker
    pub fn with_defaults() -> Self {
        Self {
            rules: DEFAULT_COMPILED.clone(),
            marker: DEFAULT_MARKER.to_string(),
        }
    }

    /// Custom rules evaluated ahead of the built-in ones
    pub fn with_custom_rules(
        custom: &[RedactionRule],
        marker: impl Into<String>,
    ) -> Result<Self, RedactionError> {
        let mut redactor = Self::new(custom, marker)?;
        redactor.rules.extend(DEFAULT_COMPILED.iter().cloned());
        Ok(redactor)
    }

    /// A redactor that never matches
    pub fn disabled() -> Self {
        Self {
            rules: Vec::new(),
            marker: DEFAULT_MARKER.to_string(),
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn rules(&self) -> impl Iterator<Item = &RedactionRule> {
        self.rules.iter().map(|c| &c.rule)
    }

    /// Scrub one pair. Returns the value to export and whether it was redacted.
    pub fn scrub<'a>(&self, signal: Signal, key: &str, value: &'a str) -> (Cow<'a, str>, bool) {
        let hit = self.rules.iter().any(|compiled| {
            compiled.rule.scope.covers(signal)
                && match compiled.rule.target {
                    RuleTarget::Key => compiled.regex.is_match(key),
                    RuleTarget::Value => compiled.regex.is_match(value),
                }
        });
        if hit {
            (Cow::Owned(self.marker.clone()), true)
        } else {
            (Cow::Borrowed(value), false)
        }
    }

    /// Scrub pairs in place, returning how many were redacted
    pub fn scrub_pairs(&self, signal: Signal, pairs: &mut [KeyValue]) -> usize {
        let mut redacted = 0;
        for pair in pairs.iter_mut() {
            let (scrubbed, hit) = self.scrub(signal, &pair.key, &pair.value);
            if hit {
                let replacement = scrubbed.into_owned();
                pair.value = replacement;
                redacted += 1;
            }
        }
        redacted
    }
}

/// Runtime-replaceable redactor shared by all pipelines
#[derive(Debug, Clone, Default)]
pub struct SharedRedactor {
    inner: Arc<RwLock<Arc<Redactor>>>,
}

impl SharedRedactor {
    pub fn new(redactor: Redactor) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(redactor))),
        }
    }

    /// Snapshot of the active rules
    pub fn current(&self) -> Arc<Redactor> {
        self.inner.read().clone()
    }

    /// Swap in a new rule set. Records already being scrubbed keep the old one.
    pub fn replace(&self, redactor: Redactor) {
        *self.inner.write() = Arc::new(redactor);
    }
}
