//! Aggregate output collector
//!
//! Independently executed services and sublayers often emit identical
//! notices. Messages are de-duplicated but keep first-insertion order so
//! output stays deterministic.

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

/// Insertion-ordered set of human-readable messages
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputSet {
    messages: IndexSet<String>,
}

impl OutputSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message, returning false if it was already present
    pub fn add(&mut self, message: impl Into<String>) -> bool {
        self.messages.insert(message.into())
    }

    /// Append every message of another set, keeping this set's order first
    pub fn merge(&mut self, other: OutputSet) {
        self.messages.extend(other.messages);
    }

    pub fn contains(&self, message: &str) -> bool {
        self.messages.contains(message)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.messages.iter().map(String::as_str)
    }

    pub fn into_vec(self) -> Vec<String> {
        self.messages.into_iter().collect()
    }
}

impl<S: Into<String>> FromIterator<S> for OutputSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            messages: iter.into_iter().map(Into::into).collect(),
        }
    }
}

impl<S: Into<String>> Extend<S> for OutputSet {
    fn extend<I: IntoIterator<Item = S>>(&mut self, iter: I) {
        self.messages.extend(iter.into_iter().map(Into::into));
    }
}
