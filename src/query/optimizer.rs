use crate::core::error::{Error, ErrorKind, Result};
use crate::geo::shapes::{Shape, WORLD_MAX, WORLD_MIN};
use crate::index::readview::IndexReadView;
use crate::query::ast::LogicalNode;
use crate::query::physical::term_list::expand_term;
use crate::query::plan::{PhysicalKind, PlanArena, PlanCost, SortProperty};
use crate::query::term::Term;

/// Hard cap on the number of physical alternatives considered for one query.
pub const MAX_PLAN_ALTERNATIVES: usize = 500;

/// Cost-based physical planner: enumerates the per-node alternatives, prunes
/// invalid combinations, injects the sort operators required by property
/// mismatches, and picks the cheapest tree. A query for which no executable
/// plan exists surfaces `UnsupportedQuery` instead of an empty plan.
pub struct QueryOptimizer<'a> {
    view: &'a IndexReadView,
    feedback_active: bool,
}

impl<'a> QueryOptimizer<'a> {
    pub fn new(view: &'a IndexReadView, feedback_active: bool) -> Self {
        QueryOptimizer {
            view,
            feedback_active,
        }
    }

    pub fn build_plan(&self, logical: &LogicalNode, k: usize) -> Result<PlanArena> {
        let mut alternatives = self.alternatives(logical);
        // A plan that can only verify cannot drive iteration.
        alternatives.retain(|arena| !arena.root_node().kind.is_random_access_only());
        if alternatives.is_empty() {
            return Err(Error::new(
                ErrorKind::UnsupportedQuery,
                "no executable physical plan for this query",
            ));
        }

        let mut best: Option<(f64, PlanArena)> = None;
        for mut arena in alternatives {
            self.inject_required_sorts(&mut arena);
            self.wrap_root(&mut arena);
            self.apply_costs(&mut arena);
            let cost = arena.total_cost(k);
            if best.as_ref().map(|(c, _)| cost < *c).unwrap_or(true) {
                best = Some((cost, arena));
            }
        }
        Ok(best.expect("non-empty alternatives").1)
    }

    /// All physical alternatives of a logical subtree, as self-contained
    /// arenas. The cartesian growth is trimmed at `MAX_PLAN_ALTERNATIVES`.
    fn alternatives(&self, logical: &LogicalNode) -> Vec<PlanArena> {
        match logical {
            LogicalNode::Term(term) => {
                let estimate = self.estimate_term(term);
                [
                    PhysicalKind::TermVirtualList(term.clone()),
                    PhysicalKind::SimpleScan(term.clone()),
                    PhysicalKind::RandomAccessTerm(term.clone()),
                ]
                .into_iter()
                .map(|kind| leaf_arena(kind, estimate))
                .collect()
            }
            LogicalNode::Geo(shape) => {
                let estimate = self.estimate_geo(shape);
                [
                    PhysicalKind::GeoNearestNeighbor(*shape),
                    PhysicalKind::GeoSimpleScan(*shape),
                    PhysicalKind::RandomAccessGeo(*shape),
                ]
                .into_iter()
                .map(|kind| leaf_arena(kind, estimate))
                .collect()
            }
            LogicalNode::Not(child) => self
                .alternatives(child)
                .into_iter()
                .map(|child_arena| {
                    let estimate = self
                        .view
                        .histogram
                        .estimate_not(child_arena.root_node().estimate);
                    wrap_arena(child_arena, PhysicalKind::RandomAccessNot, estimate)
                })
                .collect(),
            LogicalNode::And(children) => self.combine(
                children,
                &[
                    PhysicalKind::MergeTopK,
                    PhysicalKind::MergeByShortestList,
                    PhysicalKind::MergeSortedById,
                    PhysicalKind::RandomAccessAnd,
                ],
            ),
            LogicalNode::Or(children) => self.combine(
                children,
                &[PhysicalKind::UnionSortedById, PhysicalKind::RandomAccessOr],
            ),
            LogicalNode::Phrase { terms, slop } => {
                let and_children: Vec<LogicalNode> =
                    terms.iter().cloned().map(LogicalNode::Term).collect();
                self.combine(
                    &and_children,
                    &[PhysicalKind::MergeTopK, PhysicalKind::MergeSortedById],
                )
                .into_iter()
                .map(|child_arena| {
                    let estimate = (child_arena.root_node().estimate + 1) / 2;
                    wrap_arena(
                        child_arena,
                        PhysicalKind::PhraseSearch {
                            terms: terms.clone(),
                            slop: *slop,
                        },
                        estimate,
                    )
                })
                .collect()
            }
        }
    }

    /// Cartesian product of the children's alternatives under each candidate
    /// parent operator, dropping structurally invalid combinations.
    fn combine(&self, children: &[LogicalNode], parents: &[PhysicalKind]) -> Vec<PlanArena> {
        if children.is_empty() {
            return Vec::new();
        }
        let per_child: Vec<Vec<PlanArena>> =
            children.iter().map(|c| self.alternatives(c)).collect();
        if per_child.iter().any(|alts| alts.is_empty()) {
            return Vec::new();
        }

        let mut combos: Vec<Vec<&PlanArena>> = vec![Vec::new()];
        for alts in &per_child {
            let mut grown = Vec::new();
            'outer: for combo in &combos {
                for alt in alts {
                    let mut next = combo.clone();
                    next.push(alt);
                    grown.push(next);
                    if grown.len() >= MAX_PLAN_ALTERNATIVES {
                        break 'outer;
                    }
                }
            }
            combos = grown;
        }

        let mut result = Vec::new();
        for parent in parents {
            for combo in &combos {
                if let Some(arena) = self.assemble(parent.clone(), combo) {
                    result.push(arena);
                    if result.len() >= MAX_PLAN_ALTERNATIVES {
                        return result;
                    }
                }
            }
        }
        result
    }

    fn assemble(&self, parent: PhysicalKind, children: &[&PlanArena]) -> Option<PlanArena> {
        let drivable = |arena: &PlanArena| !arena.root_node().kind.is_random_access_only();
        let estimates: Vec<usize> = children.iter().map(|a| a.root_node().estimate).collect();

        let mut ordered: Vec<&PlanArena> = children.to_vec();
        match parent {
            PhysicalKind::MergeTopK
            | PhysicalKind::MergeSortedById
            | PhysicalKind::UnionSortedById => {
                if !children.iter().all(|a| drivable(a)) {
                    return None;
                }
            }
            PhysicalKind::MergeByShortestList => {
                // The cheapest drivable child becomes the driver in slot 0.
                let driver = children
                    .iter()
                    .enumerate()
                    .filter(|(_, a)| drivable(a))
                    .min_by_key(|(_, a)| a.root_node().estimate)
                    .map(|(i, _)| i)?;
                ordered.swap(0, driver);
            }
            PhysicalKind::RandomAccessAnd | PhysicalKind::RandomAccessOr => {}
            _ => {}
        }

        let estimate = match parent {
            PhysicalKind::MergeTopK
            | PhysicalKind::MergeByShortestList
            | PhysicalKind::MergeSortedById
            | PhysicalKind::RandomAccessAnd => self.view.histogram.estimate_and(&estimates),
            PhysicalKind::UnionSortedById | PhysicalKind::RandomAccessOr => {
                self.view.histogram.estimate_or(&estimates)
            }
            _ => estimates.iter().copied().max().unwrap_or(0),
        };

        let mut arena = PlanArena::new();
        let child_roots: Vec<usize> = ordered
            .iter()
            .map(|child| append_arena(&mut arena, child))
            .collect();
        let root = arena.push(parent, child_roots);
        arena.nodes[root].estimate = estimate;
        arena.root = root;
        Some(arena)
    }

    /// Insert SortByScore / SortById between operators whose output property
    /// does not satisfy the parent's required input property.
    fn inject_required_sorts(&self, arena: &mut PlanArena) {
        let mut index = 0;
        while index < arena.nodes.len() {
            let Some(required) = arena.nodes[index].kind.required_input_property() else {
                index += 1;
                continue;
            };
            let children = arena.nodes[index].children.clone();
            for child in children {
                if arena.nodes[child].kind.is_random_access_only() {
                    continue;
                }
                if arena.nodes[child].output == Some(required) {
                    continue;
                }
                let sort_kind = match required {
                    SortProperty::SortedByScore => PhysicalKind::SortByScore,
                    SortProperty::SortedById => PhysicalKind::SortById,
                };
                let estimate = arena.nodes[child].estimate;
                let sort = arena.push(sort_kind, vec![]);
                arena.nodes[sort].estimate = estimate;
                // Splice the sort between parent and child.
                let position = arena.nodes[index]
                    .children
                    .iter()
                    .position(|&c| c == child)
                    .expect("child is linked");
                arena.nodes[index].children[position] = sort;
                arena.nodes[sort].children = vec![child];
                arena.nodes[sort].parent = Some(index);
                arena.nodes[child].parent = Some(sort);
            }
            index += 1;
        }
    }

    /// The top-level output must be score-sorted; with feedback active the
    /// root must also be an operator that applies the boost itself.
    fn wrap_root(&self, arena: &mut PlanArena) {
        let root = &arena.nodes[arena.root];
        let score_sorted = root.output == Some(SortProperty::SortedByScore);
        let feedback_ok = !self.feedback_active || root.kind.is_feedback_capable();
        if score_sorted && feedback_ok {
            return;
        }
        let estimate = root.estimate;
        let old_root = arena.root;
        let new_root = arena.push(PhysicalKind::SortByScore, vec![old_root]);
        arena.nodes[new_root].estimate = estimate;
        arena.root = new_root;
    }

    fn apply_costs(&self, arena: &mut PlanArena) {
        for index in 0..arena.nodes.len() {
            let estimate = arena.nodes[index].estimate as f64;
            let child_estimates: Vec<f64> = arena.nodes[index]
                .children
                .iter()
                .map(|&c| arena.nodes[c].estimate as f64)
                .collect();
            let fanin = child_estimates.len() as f64;
            let emitted = estimate.max(1.0);

            let cost = match &arena.nodes[index].kind {
                PhysicalKind::TermVirtualList(term) => PlanCost {
                    open: 10.0 + self.expansion_width(term),
                    get_next: (self.expansion_width(term) + 2.0).log2(),
                    close: 1.0,
                },
                PhysicalKind::SimpleScan(_) | PhysicalKind::GeoSimpleScan(_) => PlanCost {
                    open: 10.0 + estimate,
                    get_next: 0.5,
                    close: 1.0,
                },
                PhysicalKind::RandomAccessTerm(_)
                | PhysicalKind::RandomAccessAnd
                | PhysicalKind::RandomAccessOr
                | PhysicalKind::RandomAccessNot
                | PhysicalKind::RandomAccessGeo(_) => PlanCost {
                    open: 1.0,
                    get_next: 0.0,
                    close: 0.5,
                },
                PhysicalKind::MergeTopK => PlanCost {
                    open: 5.0,
                    // Candidates stream from every child until the threshold
                    // bound closes; verification is a forward-list lookup.
                    get_next: child_estimates.iter().sum::<f64>() / emitted * 0.5 + 3.0 * fanin,
                    close: fanin,
                },
                PhysicalKind::MergeByShortestList => PlanCost {
                    open: 5.0,
                    get_next: child_estimates.first().copied().unwrap_or(0.0) / emitted
                        * (1.0 + 1.5 * (fanin - 1.0)),
                    close: fanin,
                },
                PhysicalKind::MergeSortedById => PlanCost {
                    open: 5.0,
                    get_next: child_estimates.iter().sum::<f64>() / emitted,
                    close: fanin,
                },
                PhysicalKind::UnionSortedById => PlanCost {
                    open: 5.0,
                    get_next: fanin,
                    close: fanin,
                },
                PhysicalKind::PhraseSearch { terms, .. } => PlanCost {
                    open: 2.0,
                    get_next: 2.0 + terms.len() as f64,
                    close: 1.0,
                },
                PhysicalKind::GeoNearestNeighbor(_) => PlanCost {
                    open: 10.0,
                    get_next: (estimate + 2.0).log2() * 2.0,
                    close: 1.0,
                },
                PhysicalKind::SortByScore | PhysicalKind::SortById => {
                    let input = child_estimates.first().copied().unwrap_or(0.0).max(1.0);
                    PlanCost {
                        open: input * input.log2().max(1.0),
                        get_next: 0.1,
                        close: 1.0,
                    }
                }
            };
            arena.nodes[index].cost = cost;
        }
    }

    fn expansion_width(&self, term: &Term) -> f64 {
        expand_term(self.view, term).len() as f64
    }

    fn estimate_term(&self, term: &Term) -> usize {
        let leaves: Vec<_> = expand_term(self.view, term)
            .into_iter()
            .map(|l| l.keyword)
            .collect();
        self.view.histogram.estimate_term(&leaves)
    }

    fn estimate_geo(&self, shape: &Shape) -> usize {
        let world_area = (WORLD_MAX - WORLD_MIN) * (WORLD_MAX - WORLD_MIN);
        let bounding = shape.bounding_rectangle();
        let fraction = (bounding.area() / world_area).clamp(0.0, 1.0);
        let geo_total = self.view.quadtree_root.elements_in_subtree;
        ((geo_total as f64 * fraction).ceil() as usize).max(1)
    }
}

fn leaf_arena(kind: PhysicalKind, estimate: usize) -> PlanArena {
    let mut arena = PlanArena::new();
    let root = arena.push(kind, vec![]);
    arena.nodes[root].estimate = estimate;
    arena.root = root;
    arena
}

fn wrap_arena(child: PlanArena, kind: PhysicalKind, estimate: usize) -> PlanArena {
    let mut arena = child;
    let old_root = arena.root;
    let root = arena.push(kind, vec![old_root]);
    arena.nodes[root].estimate = estimate;
    arena.root = root;
    arena
}

/// Copy `src`'s nodes into `dst`, returning the re-based root index.
fn append_arena(dst: &mut PlanArena, src: &PlanArena) -> usize {
    let offset = dst.nodes.len();
    for node in &src.nodes {
        let mut copied = node.clone();
        copied.children = copied.children.iter().map(|c| c + offset).collect();
        copied.parent = copied.parent.map(|p| p + offset);
        dst.nodes.push(copied);
    }
    src.root + offset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::analyzer::Analyzer;
    use crate::core::config::EngineConfig;
    use crate::index::store::IndexStore;
    use crate::record::record::Record;
    use crate::record::schema::{IndexType, Schema, SearchableAttribute};

    fn schema() -> Schema {
        let mut schema = Schema::new("id", IndexType::Keyword);
        schema
            .add_searchable(SearchableAttribute {
                name: "title".to_string(),
                boost: 1.0,
                multi_valued: false,
                highlight: false,
                acl_controlled: false,
            })
            .unwrap();
        schema.commit().unwrap();
        schema
    }

    /// "rare" appears in 3 records, "common" in 300.
    fn skewed_store() -> IndexStore {
        let store = IndexStore::new(schema(), EngineConfig::default()).unwrap();
        let analyzer = Analyzer::standard();
        for i in 0..300 {
            let mut record = Record::new(format!("r-{}", i), store.schema());
            let text = if i % 100 == 0 { "rare common" } else { "common" };
            record.set_searchable(0, text);
            store.add_record(record, &analyzer).unwrap();
        }
        store.commit().unwrap();
        store
    }

    #[test]
    fn term_plan_is_a_tvl_under_score_root() {
        let store = skewed_store();
        let view = store.readview();
        let optimizer = QueryOptimizer::new(&view, false);
        let plan = optimizer
            .build_plan(&LogicalNode::Term(Term::complete("common")), 10)
            .unwrap();
        assert!(matches!(
            plan.root_node().kind,
            PhysicalKind::TermVirtualList(_)
        ));
        assert_eq!(
            plan.root_node().output,
            Some(SortProperty::SortedByScore)
        );
    }

    #[test]
    fn skewed_and_drives_by_shortest_list() {
        let store = skewed_store();
        let view = store.readview();
        let optimizer = QueryOptimizer::new(&view, false);
        let plan = optimizer
            .build_plan(
                &LogicalNode::And(vec![
                    LogicalNode::Term(Term::complete("common")),
                    LogicalNode::Term(Term::complete("rare")),
                ]),
                10,
            )
            .unwrap();

        // The root is the injected SortByScore above the shortest-list
        // merge; the driver child is the rare term.
        let root = plan.root_node();
        assert!(matches!(root.kind, PhysicalKind::SortByScore));
        let merge = plan.node(root.children[0]);
        assert!(matches!(merge.kind, PhysicalKind::MergeByShortestList));
        let driver = plan.node(merge.children[0]);
        match &driver.kind {
            PhysicalKind::TermVirtualList(t) | PhysicalKind::SimpleScan(t) => {
                assert_eq!(t.text, "rare")
            }
            other => panic!("unexpected driver {:?}", other),
        }
    }

    #[test]
    fn not_cannot_drive_a_query() {
        let store = skewed_store();
        let view = store.readview();
        let optimizer = QueryOptimizer::new(&view, false);
        let err = optimizer
            .build_plan(
                &LogicalNode::Not(Box::new(LogicalNode::Term(Term::complete("rare")))),
                10,
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnsupportedQuery);
    }

    #[test]
    fn and_with_not_uses_random_access_side() {
        let store = skewed_store();
        let view = store.readview();
        let optimizer = QueryOptimizer::new(&view, false);
        let plan = optimizer
            .build_plan(
                &LogicalNode::And(vec![
                    LogicalNode::Term(Term::complete("common")),
                    LogicalNode::Not(Box::new(LogicalNode::Term(Term::complete("rare")))),
                ]),
                10,
            )
            .unwrap();

        // Only MergeByShortestList tolerates a verify-only child.
        let mut found_shortest = false;
        for node in &plan.nodes {
            if matches!(node.kind, PhysicalKind::MergeByShortestList) {
                found_shortest = true;
                let driver = plan.node(node.children[0]);
                assert!(!driver.kind.is_random_access_only());
            }
        }
        assert!(found_shortest);
    }

    #[test]
    fn feedback_wraps_non_capable_root() {
        let store = skewed_store();
        let view = store.readview();

        let plain = QueryOptimizer::new(&view, false)
            .build_plan(&LogicalNode::Term(Term::complete("common")), 10)
            .unwrap();
        assert!(matches!(
            plain.root_node().kind,
            PhysicalKind::TermVirtualList(_)
        ));

        let boosted = QueryOptimizer::new(&view, true)
            .build_plan(&LogicalNode::Term(Term::complete("common")), 10)
            .unwrap();
        assert!(boosted.root_node().kind.is_feedback_capable());
    }

    #[test]
    fn id_sorted_inputs_get_sort_injection_under_topk() {
        let store = skewed_store();
        let view = store.readview();
        let optimizer = QueryOptimizer::new(&view, false);
        let plan = optimizer
            .build_plan(
                &LogicalNode::Or(vec![
                    LogicalNode::Term(Term::complete("rare")),
                    LogicalNode::Term(Term::complete("common")),
                ]),
                10,
            )
            .unwrap();

        // Union is id-sorted; the root must still deliver score order.
        let root = plan.root_node();
        assert!(matches!(root.kind, PhysicalKind::SortByScore));
        let child = plan.node(root.children[0]);
        assert!(matches!(child.kind, PhysicalKind::UnionSortedById));
        for &grandchild in &child.children {
            assert_eq!(
                plan.node(grandchild).output,
                Some(SortProperty::SortedById)
            );
        }
    }
}
