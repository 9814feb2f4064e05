use serde::{Deserialize, Serialize};

use crate::trie::node::edit_distance_threshold;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TermType {
    /// The keyword must match in full (within the edit-distance budget).
    Complete,
    /// The query text is a prefix; every completion under it matches.
    Prefix,
}

/// One keyword of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Term {
    pub text: String,
    pub term_type: TermType,
    pub boost: f32,
    /// Similarity ratio in [0, 1]; 1.0 demands an exact match.
    pub similarity: f32,
}

impl Term {
    pub fn complete(text: impl Into<String>) -> Self {
        Term {
            text: text.into(),
            term_type: TermType::Complete,
            boost: 1.0,
            similarity: 1.0,
        }
    }

    pub fn prefix(text: impl Into<String>) -> Self {
        Term {
            text: text.into(),
            term_type: TermType::Prefix,
            boost: 1.0,
            similarity: 1.0,
        }
    }

    pub fn fuzzy(mut self, similarity: f32) -> Self {
        self.similarity = similarity;
        self
    }

    pub fn boosted(mut self, boost: f32) -> Self {
        self.boost = boost;
        self
    }

    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Edit-distance budget derived from the similarity ratio.
    pub fn threshold(&self) -> u32 {
        edit_distance_threshold(self.len(), self.similarity)
    }

    /// The same term with its fuzzy budget stripped, for the exact pass of
    /// the two-phase policy.
    pub fn exact_variant(&self) -> Term {
        Term {
            similarity: 1.0,
            ..self.clone()
        }
    }
}
