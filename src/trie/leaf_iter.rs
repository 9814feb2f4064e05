use std::collections::HashSet;

use crate::trie::active::{ActiveNode, ActiveNodeSet};
use crate::trie::node::Trie;

/// One fuzzy-expanded keyword: the pivotal prefix node it was reached
/// through, the terminal node, and the edit distance charged to the match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafMatch {
    pub prefix_node: u32,
    pub leaf: u32,
    pub distance: u32,
}

/// Finite, restartable iterator over the terminals reachable from an active
/// node set. Matches are materialised up front in ascending distance order,
/// deduplicated so each leaf appears once at its minimal distance.
#[derive(Debug, Clone)]
pub struct LeafIterator {
    matches: Vec<LeafMatch>,
    cursor: usize,
}

impl LeafIterator {
    /// Prefix-term expansion: every terminal beneath a pivotal active node,
    /// charged the pan-distance of that node, bounded by `distance_bound`.
    pub fn for_prefix(trie: &Trie, set: &ActiveNodeSet, distance_bound: u32) -> Self {
        let mut matches = Vec::new();
        let mut seen: HashSet<u32> = HashSet::new();

        for ActiveNode { node, distance } in set.pivotal_nodes(trie) {
            if distance > distance_bound {
                continue;
            }
            for leaf in trie.terminals_below(node) {
                if seen.insert(leaf) {
                    matches.push(LeafMatch {
                        prefix_node: node,
                        leaf,
                        distance,
                    });
                }
            }
        }

        LeafIterator { matches, cursor: 0 }
    }

    /// Complete-term expansion: only terminals that are themselves active,
    /// charged their own edit distance.
    pub fn for_complete(trie: &Trie, set: &ActiveNodeSet, distance_bound: u32) -> Self {
        let mut matches = Vec::new();
        for active in set.nodes() {
            if active.distance > distance_bound {
                continue;
            }
            if trie.node(active.node).terminal {
                matches.push(LeafMatch {
                    prefix_node: active.node,
                    leaf: active.node,
                    distance: active.distance,
                });
            }
        }
        matches.sort_by_key(|m| (m.distance, m.leaf));

        LeafIterator { matches, cursor: 0 }
    }

    pub fn restart(&mut self) {
        self.cursor = 0;
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn matches(&self) -> &[LeafMatch] {
        &self.matches
    }
}

impl Iterator for LeafIterator {
    type Item = LeafMatch;

    fn next(&mut self) -> Option<LeafMatch> {
        let item = self.matches.get(self.cursor).copied();
        self.cursor += 1;
        item
    }
}
