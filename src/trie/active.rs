use std::collections::HashMap;

use crate::trie::node::{Trie, ROOT};

/// One active node: a trie node whose prefix string is within the threshold
/// edit distance of the query prefix, together with that distance (the
/// pan-distance of the pivotal node).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveNode {
    pub node: u32,
    pub distance: u32,
}

/// The set of active nodes for one query prefix. Immutable once computed;
/// each additional query character derives a new set from the previous one.
#[derive(Debug, Clone)]
pub struct ActiveNodeSet {
    pub prefix: Vec<char>,
    pub threshold: u32,
    /// Sorted by node id; one entry per node with the minimal distance.
    nodes: Vec<ActiveNode>,
}

impl ActiveNodeSet {
    /// Active nodes of the empty prefix: the root and every node at depth
    /// d ≤ threshold, with distance d (all-insertions path).
    pub fn initial(trie: &Trie, threshold: u32) -> Self {
        let mut nodes = Vec::new();
        collect_descendants(trie, ROOT, 0, threshold, &mut nodes);
        nodes.sort_by_key(|a| a.node);

        ActiveNodeSet {
            prefix: Vec::new(),
            threshold,
            nodes,
        }
    }

    /// Incremental extension by one query character. O(|previous set|)
    /// candidate generation: for each active node, a deletion keeps the node
    /// with distance + 1; each child either matches the character (same
    /// distance, plus its within-budget descendants) or costs a substitution.
    pub fn extend(&self, trie: &Trie, ch: char) -> ActiveNodeSet {
        let mut best: HashMap<u32, u32> = HashMap::new();
        let mut offer = |node: u32, distance: u32| {
            best.entry(node)
                .and_modify(|d| {
                    if distance < *d {
                        *d = distance;
                    }
                })
                .or_insert(distance);
        };

        for active in &self.nodes {
            if active.distance + 1 <= self.threshold {
                offer(active.node, active.distance + 1);
            }
            for &child in trie.children_of(active.node) {
                if trie.node(child).edge == ch {
                    offer(child, active.distance);
                    let mut matched = Vec::new();
                    collect_descendants(
                        trie,
                        child,
                        active.distance,
                        self.threshold,
                        &mut matched,
                    );
                    for m in matched {
                        offer(m.node, m.distance);
                    }
                } else if active.distance + 1 <= self.threshold {
                    offer(child, active.distance + 1);
                }
            }
        }

        let mut nodes: Vec<ActiveNode> = best
            .into_iter()
            .map(|(node, distance)| ActiveNode { node, distance })
            .collect();
        nodes.sort_by_key(|a| a.node);

        let mut prefix = self.prefix.clone();
        prefix.push(ch);

        ActiveNodeSet {
            prefix,
            threshold: self.threshold,
            nodes,
        }
    }

    /// Full computation for a prefix, character by character.
    pub fn compute(trie: &Trie, prefix: &str, threshold: u32) -> ActiveNodeSet {
        let mut set = ActiveNodeSet::initial(trie, threshold);
        for ch in prefix.chars() {
            set = set.extend(trie, ch);
        }
        set
    }

    pub fn nodes(&self) -> &[ActiveNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn distance_of(&self, node: u32) -> Option<u32> {
        self.nodes
            .binary_search_by_key(&node, |a| a.node)
            .ok()
            .map(|i| self.nodes[i].distance)
    }

    /// Active nodes that are not descendants of a better-or-equal active
    /// node; iteration over leaves starts from these.
    pub fn pivotal_nodes(&self, trie: &Trie) -> Vec<ActiveNode> {
        let mut sorted: Vec<ActiveNode> = self.nodes.clone();
        sorted.sort_by_key(|a| (a.distance, trie.node(a.node).depth));

        let mut pivotal: Vec<ActiveNode> = Vec::new();
        for candidate in sorted {
            let covered = pivotal.iter().any(|p| {
                p.distance <= candidate.distance && trie.is_descendant_of(candidate.node, p.node)
            });
            if !covered {
                pivotal.push(candidate);
            }
        }
        pivotal
    }
}

fn collect_descendants(
    trie: &Trie,
    node: u32,
    base_distance: u32,
    threshold: u32,
    out: &mut Vec<ActiveNode>,
) {
    out.push(ActiveNode {
        node,
        distance: base_distance,
    });
    let remaining = threshold - base_distance;
    if remaining == 0 {
        return;
    }
    let base_depth = trie.node(node).depth;
    let mut stack: Vec<u32> = trie.children_of(node).to_vec();
    while let Some(current) = stack.pop() {
        let depth_delta = (trie.node(current).depth - base_depth) as u32;
        if depth_delta > remaining {
            continue;
        }
        out.push(ActiveNode {
            node: current,
            distance: base_distance + depth_delta,
        });
        if depth_delta < remaining {
            stack.extend_from_slice(trie.children_of(current));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn levenshtein(a: &str, b: &str) -> u32 {
        let a: Vec<char> = a.chars().collect();
        let b: Vec<char> = b.chars().collect();
        let mut prev: Vec<u32> = (0..=b.len() as u32).collect();
        let mut curr = vec![0u32; b.len() + 1];
        for i in 1..=a.len() {
            curr[0] = i as u32;
            for j in 1..=b.len() {
                let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
                curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
            }
            std::mem::swap(&mut prev, &mut curr);
        }
        prev[b.len()]
    }

    fn sample_trie() -> Trie {
        let mut trie = Trie::new();
        for keyword in ["cancer", "canada", "canteen", "can", "cat", "dog"] {
            trie.insert_keyword(keyword, 1.0);
        }
        trie
    }

    #[test]
    fn exact_and_ancestor_distances() {
        let trie = sample_trie();
        let set = ActiveNodeSet::compute(&trie, "can", 2);

        let can = trie.lookup_prefix("can").unwrap();
        let ca = trie.lookup_prefix("ca").unwrap();
        let c = trie.lookup_prefix("c").unwrap();
        let cat = trie.lookup_prefix("cat").unwrap();

        assert_eq!(set.distance_of(can), Some(0));
        assert_eq!(set.distance_of(ca), Some(1));
        assert_eq!(set.distance_of(c), Some(2));
        assert_eq!(set.distance_of(cat), Some(1));
    }

    #[test]
    fn matches_brute_force_edit_distance() {
        let trie = sample_trie();
        for (prefix, threshold) in [("can", 2), ("ca", 1), ("dg", 1), ("cantine", 2)] {
            let set = ActiveNodeSet::compute(&trie, prefix, threshold);
            for node in 0..trie.node_count() as u32 {
                let node_prefix = trie.keyword_of(node);
                let expected = levenshtein(&node_prefix, prefix);
                match set.distance_of(node) {
                    Some(d) => assert_eq!(
                        d, expected,
                        "node '{}' vs query '{}'",
                        node_prefix, prefix
                    ),
                    None => assert!(
                        expected > threshold,
                        "node '{}' missing from active set of '{}' (ed {})",
                        node_prefix,
                        prefix,
                        expected
                    ),
                }
            }
        }
    }

    #[test]
    fn extension_equals_full_computation() {
        let trie = sample_trie();
        let full = ActiveNodeSet::compute(&trie, "cant", 2);
        let incremental = ActiveNodeSet::compute(&trie, "can", 2).extend(&trie, 't');
        assert_eq!(full.nodes(), incremental.nodes());
        assert_eq!(full.prefix, incremental.prefix);
    }

    #[test]
    fn threshold_zero_is_exact_prefix() {
        let trie = sample_trie();
        let set = ActiveNodeSet::compute(&trie, "can", 0);
        let ids: Vec<_> = set.nodes().iter().map(|a| trie.keyword_of(a.node)).collect();
        assert_eq!(ids, vec!["can"]);
    }

    #[test]
    fn pivotal_nodes_drop_covered_descendants() {
        let trie = sample_trie();
        let set = ActiveNodeSet::compute(&trie, "can", 2);
        let pivotal = set.pivotal_nodes(&trie);

        // "can" (0) is covered by neither "ca" (1) nor "c" (2); "cancer" is
        // not active on its own at threshold 2 of "can" extension chain but
        // every active descendant of "can" would be covered.
        let can = trie.lookup_prefix("can").unwrap();
        assert!(pivotal.iter().any(|p| p.node == can && p.distance == 0));
        for p in &pivotal {
            for q in &pivotal {
                if p.node != q.node {
                    assert!(
                        !(trie.is_descendant_of(p.node, q.node) && q.distance <= p.distance),
                        "{} covered by {}",
                        trie.keyword_of(p.node),
                        trie.keyword_of(q.node)
                    );
                }
            }
        }
    }
}
