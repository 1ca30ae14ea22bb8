//! Context sets: configuration overlays selected by tag expressions.
//!
//! A document maps set names to property tables. Each table may carry a
//! `withTags` expression; a set applies to a subject when the expression
//! matches the subject's tags. Sets without `withTags` never apply.
//!
//! ```json
//! {
//!   "premium": { "withTags": "gold | platinum", "quota.upload": 500 },
//!   "trial":   { "withTags": "trial & !gold", "quota.upload": 10 }
//! }
//! ```
//!
//! Expressions are parsed when the document is loaded; a broken expression
//! rejects the whole document.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::tag_expr::{self, ParseError, TagSet, Term};

/// Property key holding a set's guard expression.
pub const WITH_TAGS: &str = "withTags";

/// Errors raised while loading context-set configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid context-set document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("context set '{name}' is not an object")]
    NotAnObject { name: String },
    #[error("context set '{name}': withTags must be a string")]
    WithTagsNotString { name: String },
    #[error("context set '{name}': {source}")]
    Expression {
        name: String,
        #[source]
        source: ParseError,
    },
}

/// One named overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextSet {
    name: String,
    with_tags: Option<Term>,
    properties: Map<String, Value>,
}

impl ContextSet {
    /// Build a set; `properties` must not contain the `withTags` key.
    pub fn new(name: impl Into<String>, with_tags: Option<Term>, properties: Map<String, Value>) -> Self {
        Self { name: name.into(), with_tags, properties }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_tags(&self) -> Option<&Term> {
        self.with_tags.as_ref()
    }

    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    pub fn matches<T: TagSet + ?Sized>(&self, tags: &T) -> bool {
        self.with_tags.as_ref().is_some_and(|term| term.matches(tags))
    }
}

/// All configured sets, kept in name order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextSets {
    sets: Vec<ContextSet>,
}

impl ContextSets {
    pub fn new(mut sets: Vec<ContextSet>) -> Self {
        sets.sort_by(|a, b| a.name.cmp(&b.name));
        Self { sets }
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let document: Map<String, Value> = serde_json::from_str(raw)?;
        let mut sets = Vec::with_capacity(document.len());

        for (name, body) in document {
            let Value::Object(mut properties) = body else {
                return Err(ConfigError::NotAnObject { name });
            };
            let with_tags = match properties.remove(WITH_TAGS) {
                None | Some(Value::Null) => None,
                Some(Value::String(expr)) => tag_expr::parse(&expr)
                    .map_err(|source| ConfigError::Expression { name: name.clone(), source })?,
                Some(_) => return Err(ConfigError::WithTagsNotString { name }),
            };
            if with_tags.is_none() {
                debug!(target: "tallygate::context_sets", set = %name, "context set has no withTags; it never applies");
            }
            sets.push(ContextSet { name, with_tags, properties });
        }

        Ok(Self::new(sets))
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ContextSet> {
        self.sets.iter().find(|set| set.name == name)
    }

    /// Sets whose expression matches `tags`, in name order.
    pub fn matching<T: TagSet + ?Sized>(&self, tags: &T) -> Vec<&ContextSet> {
        self.sets.iter().filter(|set| set.matches(tags)).collect()
    }

    /// Merge the properties of every matching set.
    ///
    /// Sets are applied in name order; a key defined by several matching sets
    /// keeps the value of the last one.
    pub fn resolve<T: TagSet + ?Sized>(&self, tags: &T) -> Map<String, Value> {
        let mut merged = Map::new();
        let mut origin: Vec<(String, &str)> = Vec::new();

        for set in self.matching(tags) {
            for (key, value) in &set.properties {
                if merged.insert(key.clone(), value.clone()).is_some() {
                    let previous = origin
                        .iter()
                        .find(|(k, _)| k == key)
                        .map(|(_, from)| *from)
                        .unwrap_or_default();
                    warn!(
                        target: "tallygate::context_sets",
                        property = %key,
                        overridden = previous,
                        by = %set.name,
                        "property defined by several matching context sets"
                    );
                    origin.retain(|(k, _)| k != key);
                }
                origin.push((key.clone(), set.name.as_str()));
            }
        }
        merged
    }
}
