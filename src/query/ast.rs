use serde::{Deserialize, Serialize};

use crate::core::types::RoleId;
use crate::geo::shapes::Shape;
use crate::query::term::Term;

/// Logical query tree. The optimiser maps each node to one of several
/// physical alternatives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogicalNode {
    Term(Term),
    Phrase { terms: Vec<Term>, slop: u32 },
    And(Vec<LogicalNode>),
    Or(Vec<LogicalNode>),
    Not(Box<LogicalNode>),
    Geo(Shape),
}

impl LogicalNode {
    pub fn terms(&self) -> Vec<&Term> {
        let mut out = Vec::new();
        self.collect_terms(&mut out);
        out
    }

    fn collect_terms<'a>(&'a self, out: &mut Vec<&'a Term>) {
        match self {
            LogicalNode::Term(term) => out.push(term),
            LogicalNode::Phrase { terms, .. } => out.extend(terms.iter()),
            LogicalNode::And(children) | LogicalNode::Or(children) => {
                for child in children {
                    child.collect_terms(out);
                }
            }
            LogicalNode::Not(child) => child.collect_terms(out),
            LogicalNode::Geo(_) => {}
        }
    }

    /// True when any term carries a fuzzy budget, making a second search
    /// pass worthwhile.
    pub fn has_fuzzy_terms(&self) -> bool {
        self.terms().iter().any(|t| t.threshold() > 0)
    }

    /// The same tree with every term forced exact (the first pass of the
    /// two-phase policy).
    pub fn exact_variant(&self) -> LogicalNode {
        match self {
            LogicalNode::Term(term) => LogicalNode::Term(term.exact_variant()),
            LogicalNode::Phrase { terms, slop } => LogicalNode::Phrase {
                terms: terms.iter().map(Term::exact_variant).collect(),
                slop: *slop,
            },
            LogicalNode::And(children) => {
                LogicalNode::And(children.iter().map(|c| c.exact_variant()).collect())
            }
            LogicalNode::Or(children) => {
                LogicalNode::Or(children.iter().map(|c| c.exact_variant()).collect())
            }
            LogicalNode::Not(child) => LogicalNode::Not(Box::new(child.exact_variant())),
            LogicalNode::Geo(shape) => LogicalNode::Geo(*shape),
        }
    }

    /// Canonical string for cache fingerprinting and feedback lookup.
    pub fn normalized(&self) -> String {
        match self {
            LogicalNode::Term(t) => format!(
                "t:{}:{:?}:{:.2}:{:.2}",
                t.text, t.term_type, t.similarity, t.boost
            ),
            LogicalNode::Phrase { terms, slop } => {
                let parts: Vec<String> = terms.iter().map(|t| t.text.clone()).collect();
                format!("p:{}~{}", parts.join("_"), slop)
            }
            LogicalNode::And(children) => {
                let parts: Vec<String> = children.iter().map(|c| c.normalized()).collect();
                format!("and({})", parts.join(","))
            }
            LogicalNode::Or(children) => {
                let parts: Vec<String> = children.iter().map(|c| c.normalized()).collect();
                format!("or({})", parts.join(","))
            }
            LogicalNode::Not(child) => format!("not({})", child.normalized()),
            LogicalNode::Geo(shape) => format!("geo({:?})", shape),
        }
    }

    /// The keywords of the query as typed, for feedback lookup.
    pub fn keyword_string(&self) -> String {
        let parts: Vec<&str> = self.terms().iter().map(|t| t.text.as_str()).collect();
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchType {
    /// At-most-k semantics with ranked results.
    TopK,
    /// Exhaustive result set; internally degraded to top-k beyond a cap.
    GetAllResults,
}

/// External sort criterion. When set, feedback boosting is disabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortCriterion {
    Score,
    RefiningAttribute { name: String, descending: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub plan: LogicalNode,
    pub k: usize,
    pub search_type: SearchType,
    pub role: Option<RoleId>,
    pub sort: Option<SortCriterion>,
    /// Penalty multiplier for prefix (as opposed to complete) matches.
    pub prefix_penalty: f32,
    /// Per-edit decay of the term similarity contribution.
    pub similarity_boost: f32,
}

impl SearchQuery {
    pub fn top_k(plan: LogicalNode, k: usize) -> Self {
        SearchQuery {
            plan,
            k,
            search_type: SearchType::TopK,
            role: None,
            sort: None,
            prefix_penalty: 0.95,
            similarity_boost: 0.5,
        }
    }

    pub fn with_role(mut self, role: RoleId) -> Self {
        self.role = Some(role);
        self
    }

    pub fn feedback_enabled(&self) -> bool {
        self.sort.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_variant_recurses() {
        let plan = LogicalNode::And(vec![
            LogicalNode::Term(Term::complete("coffee").fuzzy(0.5)),
            LogicalNode::Not(Box::new(LogicalNode::Term(Term::prefix("dec").fuzzy(0.6)))),
        ]);
        assert!(plan.has_fuzzy_terms());
        let exact = plan.exact_variant();
        assert!(!exact.has_fuzzy_terms());
        assert_eq!(exact.terms().len(), 2);
    }

    #[test]
    fn normalization_distinguishes_structure() {
        let a = LogicalNode::And(vec![
            LogicalNode::Term(Term::complete("a")),
            LogicalNode::Term(Term::complete("b")),
        ]);
        let b = LogicalNode::Or(vec![
            LogicalNode::Term(Term::complete("a")),
            LogicalNode::Term(Term::complete("b")),
        ]);
        assert_ne!(a.normalized(), b.normalized());
        assert_eq!(a.keyword_string(), "a b");
    }
}
