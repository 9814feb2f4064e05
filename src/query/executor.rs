use std::collections::HashSet;

use chrono::Utc;
use tracing::debug;

use crate::acl::AttributeAcl;
use crate::core::error::Result;
use crate::core::types::RecordId;
use crate::index::readview::IndexReadView;
use crate::query::ast::{SearchQuery, SearchType};
use crate::query::optimizer::QueryOptimizer;
use crate::query::physical::{build_operator, ExecContext, FeedbackContext};
use crate::query::term::Term;
use crate::ranking::feedback::FeedbackIndex;
use crate::trie::active::ActiveNodeSet;
use crate::trie::leaf_iter::LeafIterator;

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub record: RecordId,
    pub primary_key: String,
    pub score: f32,
    pub stored_blob: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchResults {
    pub results: Vec<SearchResult>,
    /// Whether the fuzzy pass ran after an under-filled exact pass.
    pub fuzzy_pass_used: bool,
}

/// One keyword completion for autosuggest.
#[derive(Debug, Clone, PartialEq)]
pub struct Suggestion {
    pub keyword: String,
    pub score: f32,
    pub distance: u32,
}

/// Stateless query evaluation over a pinned readview: physical-plan build,
/// two-phase exact/fuzzy policy, ACL filtering and result assembly.
pub struct QueryExecutor;

impl QueryExecutor {
    /// Run a query against one shard snapshot.
    ///
    /// The exact pass runs first; when it returns fewer than k results and
    /// the query carries fuzzy budgets, a fuzzy pass with the same plan shape
    /// appends its results behind the exact ones, deduplicated by primary
    /// key.
    pub fn execute(
        view: &IndexReadView,
        query: &SearchQuery,
        acl: &AttributeAcl,
        feedback: &FeedbackIndex,
    ) -> Result<SearchResults> {
        Self::execute_with_cap(view, query, acl, feedback, usize::MAX)
    }

    /// As `execute`, with the engine's get-all-results cap applied: an
    /// unbounded request whose result set would exceed the cap degrades to
    /// top-cap internally.
    pub fn execute_with_cap(
        view: &IndexReadView,
        query: &SearchQuery,
        acl: &AttributeAcl,
        feedback: &FeedbackIndex,
        get_all_cap: usize,
    ) -> Result<SearchResults> {
        let k = match query.search_type {
            SearchType::TopK => query.k,
            SearchType::GetAllResults => get_all_cap.max(1),
        };

        let feedback_active =
            query.feedback_enabled() && feedback.has_feedback(&query.plan.keyword_string());

        let mut out = SearchResults::default();
        let mut seen_keys: HashSet<String> = HashSet::new();

        let exact_plan = query.plan.exact_variant();
        Self::run_pass(
            view, query, &exact_plan, acl, feedback, feedback_active, k, &mut seen_keys, &mut out,
        )?;

        if out.results.len() < k && query.plan.has_fuzzy_terms() {
            out.fuzzy_pass_used = true;
            Self::run_pass(
                view,
                query,
                &query.plan,
                acl,
                feedback,
                feedback_active,
                k,
                &mut seen_keys,
                &mut out,
            )?;
        }

        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_pass(
        view: &IndexReadView,
        query: &SearchQuery,
        plan: &crate::query::ast::LogicalNode,
        acl: &AttributeAcl,
        feedback: &FeedbackIndex,
        feedback_active: bool,
        k: usize,
        seen_keys: &mut HashSet<String>,
        out: &mut SearchResults,
    ) -> Result<()> {
        let limit = k.min(view.total_records().max(1));

        let optimizer = QueryOptimizer::new(view, feedback_active);
        let arena = optimizer.build_plan(plan, limit)?;
        debug!(
            nodes = arena.nodes.len(),
            cost = arena.total_cost(limit),
            "physical plan selected"
        );

        let query_string = query.plan.keyword_string();
        let feedback_ctx = if feedback_active {
            Some(FeedbackContext {
                index: feedback,
                query: &query_string,
                now_secs: Utc::now().timestamp(),
                max_boost: 1.0 + (feedback.max_frequency(&query_string) as f32).sqrt(),
            })
        } else {
            None
        };

        let ctx = ExecContext {
            view,
            attribute_mask: acl.searchable_mask(&view.schema, query.role.as_ref()),
            prefix_penalty: query.prefix_penalty,
            similarity_boost: query.similarity_boost,
            feedback: feedback_ctx,
        };

        let mut root = build_operator(&arena, arena.root)?;
        root.open(&ctx)?;
        while out.results.len() < limit {
            let Some(candidate) = root.get_next(&ctx)? else {
                break;
            };
            let Some(forward) = view.forward.get(candidate.record) else {
                continue;
            };
            if !AttributeAcl::record_visible(&forward.record, query.role.as_ref()) {
                continue;
            }
            if !seen_keys.insert(forward.record.primary_key.clone()) {
                continue;
            }
            out.results.push(SearchResult {
                record: candidate.record,
                primary_key: forward.record.primary_key.clone(),
                score: candidate.score,
                stored_blob: forward.record.stored_blob.clone(),
            });
        }
        root.close();
        Ok(())
    }

    /// Prefix autosuggest: completions under the active nodes of the typed
    /// prefix, ranked by their static keyword score shaped by edit distance.
    pub fn suggest(view: &IndexReadView, term: &Term, limit: usize) -> Vec<Suggestion> {
        let threshold = term.threshold();
        let set = ActiveNodeSet::compute(&view.trie, &term.text, threshold);
        let mut suggestions: Vec<Suggestion> =
            LeafIterator::for_prefix(&view.trie, &set, threshold)
                .matches()
                .iter()
                .map(|m| Suggestion {
                    keyword: view.trie.keyword_of(m.leaf),
                    score: view.trie.node(m.leaf).terminal_score
                        / (1.0 + m.distance as f32),
                    distance: m.distance,
                })
                .collect();
        suggestions.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.keyword.cmp(&b.keyword))
        });
        suggestions.truncate(limit);
        suggestions
    }
}
