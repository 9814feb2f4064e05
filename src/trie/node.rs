use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::types::KeywordId;

pub const ROOT: u32 = 0;

/// Small float added to the threshold computation so that a similarity of
/// e.g. 0.66 on a 3-char term still allows one edit.
pub const SIMILARITY_EPSILON: f32 = 0.01;

/// Edit-distance threshold for a term of length `len` and a similarity ratio
/// in [0, 1].
pub fn edit_distance_threshold(len: usize, similarity: f32) -> u32 {
    (len as f32 * (1.0 - similarity + SIMILARITY_EPSILON)).floor() as u32
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrieNode {
    pub edge: char,
    pub parent: u32,
    /// Child node ids, kept sorted by edge character.
    pub children: Vec<u32>,
    pub terminal: bool,
    pub depth: u16,
    /// Monotonic upper bound on the static score of every terminal beneath
    /// (and including) this node.
    pub max_score_in_subtree: f32,
    /// Static score of the keyword ending here; meaningful only on terminals.
    pub terminal_score: f32,
}

impl TrieNode {
    fn new(edge: char, parent: u32, depth: u16) -> Self {
        TrieNode {
            edge,
            parent,
            children: Vec::new(),
            terminal: false,
            depth,
            max_score_in_subtree: 0.0,
            terminal_score: 0.0,
        }
    }
}

/// Ordered prefix tree over keywords. Node ids index an arena and are never
/// reused; the keyword id of a terminal is its node id.
///
/// Arena slots hold `Arc`s so a cloned trie (a readview snapshot) shares
/// every node with the live one; writes copy only the nodes on the touched
/// path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trie {
    nodes: Vec<Arc<TrieNode>>,
    keyword_count: usize,
}

impl Default for Trie {
    fn default() -> Self {
        Self::new()
    }
}

impl Trie {
    pub fn new() -> Self {
        Trie {
            nodes: vec![Arc::new(TrieNode::new('\0', ROOT, 0))],
            keyword_count: 0,
        }
    }

    pub fn node(&self, id: u32) -> &TrieNode {
        &self.nodes[id as usize]
    }

    pub fn len(&self) -> usize {
        self.keyword_count
    }

    pub fn is_empty(&self) -> bool {
        self.keyword_count == 0
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Idempotent insert; returns the existing id when the keyword is already
    /// present.
    pub fn insert_keyword(&mut self, keyword: &str, score: f32) -> KeywordId {
        let mut current = ROOT;
        for ch in keyword.chars() {
            current = match self.child_with_edge(current, ch) {
                Some(child) => child,
                None => {
                    let id = self.nodes.len() as u32;
                    let depth = self.nodes[current as usize].depth + 1;
                    self.nodes.push(Arc::new(TrieNode::new(ch, current, depth)));
                    let at = self.nodes[current as usize]
                        .children
                        .binary_search_by(|c| self.nodes[*c as usize].edge.cmp(&ch))
                        .unwrap_or_else(|e| e);
                    Arc::make_mut(&mut self.nodes[current as usize])
                        .children
                        .insert(at, id);
                    id
                }
            };
        }

        let became_terminal = {
            let node = Arc::make_mut(&mut self.nodes[current as usize]);
            if node.terminal {
                false
            } else {
                node.terminal = true;
                true
            }
        };
        if became_terminal {
            self.keyword_count += 1;
        }
        self.set_terminal_score(current, score);
        KeywordId(current)
    }

    /// Exact prefix navigation.
    pub fn lookup_prefix(&self, prefix: &str) -> Option<u32> {
        let mut current = ROOT;
        for ch in prefix.chars() {
            current = self.child_with_edge(current, ch)?;
        }
        Some(current)
    }

    pub fn keyword_of(&self, id: u32) -> String {
        let mut chars = Vec::new();
        let mut current = id;
        while current != ROOT {
            let node = &self.nodes[current as usize];
            chars.push(node.edge);
            current = node.parent;
        }
        chars.into_iter().rev().collect()
    }

    pub fn max_score_in_subtree(&self, id: u32) -> f32 {
        self.nodes[id as usize].max_score_in_subtree
    }

    /// Set the terminal's score and recompute the subtree maxima along its
    /// path, both for raises and for lowerings. Only the changed path nodes
    /// are copied; the walk stops at the first ancestor whose maximum is
    /// unaffected.
    pub fn set_terminal_score(&mut self, id: u32, score: f32) {
        Arc::make_mut(&mut self.nodes[id as usize]).terminal_score = score;
        self.refresh_path(id);
    }

    /// Unmark a terminal whose inverted list became empty at merge. The node
    /// stays in the arena so ids are never reused.
    pub fn remove_terminal(&mut self, id: u32) {
        {
            let node = Arc::make_mut(&mut self.nodes[id as usize]);
            if !node.terminal {
                return;
            }
            node.terminal = false;
            node.terminal_score = 0.0;
        }
        self.keyword_count -= 1;
        self.refresh_path(id);
    }

    /// Recompute `max_score_in_subtree` from `id` towards the root.
    fn refresh_path(&mut self, id: u32) {
        let mut current = id;
        loop {
            let node = &self.nodes[current as usize];
            let mut max = if node.terminal { node.terminal_score } else { 0.0 };
            for &child in &node.children {
                max = max.max(self.nodes[child as usize].max_score_in_subtree);
            }
            if max == node.max_score_in_subtree {
                break;
            }
            let parent = node.parent;
            Arc::make_mut(&mut self.nodes[current as usize]).max_score_in_subtree = max;
            if current == ROOT {
                break;
            }
            current = parent;
        }
    }

    /// Terminal nodes beneath (and including) `id`, in trie order.
    pub fn terminals_below(&self, id: u32) -> Vec<u32> {
        let mut result = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let node = &self.nodes[current as usize];
            if node.terminal {
                result.push(current);
            }
            for &child in node.children.iter().rev() {
                stack.push(child);
            }
        }
        result
    }

    pub fn is_descendant_of(&self, node: u32, ancestor: u32) -> bool {
        let mut current = node;
        while current != ROOT {
            current = self.nodes[current as usize].parent;
            if current == ancestor {
                return true;
            }
        }
        ancestor == ROOT
    }

    pub(crate) fn child_with_edge(&self, id: u32, edge: char) -> Option<u32> {
        let children = &self.nodes[id as usize].children;
        children
            .binary_search_by(|c| self.nodes[*c as usize].edge.cmp(&edge))
            .ok()
            .map(|i| children[i])
    }

    pub(crate) fn children_of(&self, id: u32) -> &[u32] {
        &self.nodes[id as usize].children
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_idempotent() {
        let mut trie = Trie::new();
        let a = trie.insert_keyword("cancer", 1.0);
        let b = trie.insert_keyword("cancer", 1.0);
        assert_eq!(a, b);
        assert_eq!(trie.len(), 1);
    }

    #[test]
    fn keyword_id_is_terminal_node_id() {
        let mut trie = Trie::new();
        let id = trie.insert_keyword("cat", 1.0);
        assert_eq!(trie.lookup_prefix("cat"), Some(id.0));
        assert_eq!(trie.keyword_of(id.0), "cat");
    }

    #[test]
    fn prefix_lookup() {
        let mut trie = Trie::new();
        trie.insert_keyword("canada", 1.0);
        trie.insert_keyword("canteen", 1.0);
        assert!(trie.lookup_prefix("can").is_some());
        assert!(trie.lookup_prefix("cab").is_none());
    }

    #[test]
    fn max_score_is_monotone_upper_bound() {
        let mut trie = Trie::new();
        trie.insert_keyword("cancer", 3.0);
        trie.insert_keyword("canada", 7.0);
        trie.insert_keyword("cat", 5.0);

        let can = trie.lookup_prefix("can").unwrap();
        let c = trie.lookup_prefix("c").unwrap();
        assert_eq!(trie.max_score_in_subtree(can), 7.0);
        assert_eq!(trie.max_score_in_subtree(c), 7.0);

        // Lowering a score deflates the maxima along the path as well.
        let canada = trie.lookup_prefix("canada").unwrap();
        trie.set_terminal_score(canada, 1.0);
        assert_eq!(trie.max_score_in_subtree(can), 3.0);
        assert_eq!(trie.max_score_in_subtree(c), 5.0);
    }

    #[test]
    fn clones_share_unchanged_nodes() {
        let mut trie = Trie::new();
        trie.insert_keyword("cancer", 3.0);
        trie.insert_keyword("dog", 1.0);
        let snapshot = trie.clone();

        trie.insert_keyword("cat", 5.0);

        // The snapshot keeps answering from its own version.
        assert!(snapshot.lookup_prefix("cat").is_none());
        assert!(trie.lookup_prefix("cat").is_some());
        assert_eq!(snapshot.len(), 2);

        // Nodes off the written path are the same allocation in both.
        let dog = trie.lookup_prefix("dog").unwrap();
        assert!(Arc::ptr_eq(
            &trie.nodes[dog as usize],
            &snapshot.nodes[dog as usize]
        ));
        // The branching ancestor was copied on write.
        let ca = trie.lookup_prefix("ca").unwrap();
        assert!(!Arc::ptr_eq(
            &trie.nodes[ca as usize],
            &snapshot.nodes[ca as usize]
        ));
    }

    #[test]
    fn terminals_below_prefix() {
        let mut trie = Trie::new();
        trie.insert_keyword("can", 1.0);
        trie.insert_keyword("cancer", 1.0);
        trie.insert_keyword("canada", 1.0);
        trie.insert_keyword("cat", 1.0);

        let can = trie.lookup_prefix("can").unwrap();
        let keywords: Vec<_> = trie
            .terminals_below(can)
            .into_iter()
            .map(|id| trie.keyword_of(id))
            .collect();
        assert_eq!(keywords, vec!["can", "canada", "cancer"]);
    }

    #[test]
    fn removed_terminal_keeps_node_id() {
        let mut trie = Trie::new();
        let id = trie.insert_keyword("dog", 1.0);
        trie.remove_terminal(id.0);
        assert_eq!(trie.len(), 0);
        // Re-inserting yields the same id; the node was never recycled.
        assert_eq!(trie.insert_keyword("dog", 1.0), id);
    }

    #[test]
    fn threshold_from_similarity() {
        assert_eq!(edit_distance_threshold(6, 1.0), 0);
        assert_eq!(edit_distance_threshold(6, 0.66), 2);
        assert_eq!(edit_distance_threshold(3, 0.66), 1);
        assert_eq!(edit_distance_threshold(10, 0.8), 2);
    }
}
