use crate::core::types::RecordId;
use crate::geo::shapes::{Point, Shape};

/// Squared lower bound applied to the search radius so that tiny query
/// circles do not blow up the distance ratio.
pub const GEO_MIN_SEARCH_RANGE_SQUARE: f64 = 0.24 * 0.24;
/// Floor of the geo distance score.
pub const GEO_MIN_DISTANCE_SCORE: f64 = 0.05;

/// Seconds after which the feedback recency factor reaches zero (90 days).
pub const FEEDBACK_RECENCY_HORIZON_SECS: f64 = 7_776_000.0;

/// The tf × sum-of-field-boosts product never changes for a fixed
/// (record, keyword) pair, so it is cached in the forward list and only the
/// idf factor is refreshed at merge.
pub fn compute_text_relevance(tf_boost_product: f32, idf: f32) -> f32 {
    tf_boost_product * idf
}

pub fn compute_record_tf_boost_product(tf: f32, sum_of_field_boosts: f32) -> f32 {
    tf * sum_of_field_boosts
}

/// Runtime score of a record with respect to one query term, as used inside
/// the term virtual list heap.
pub fn compute_term_record_runtime_score(
    static_score: f32,
    edit_distance: u32,
    term_length: u32,
    is_prefix_match: bool,
    prefix_match_penalty: f32,
    similarity_boost: f32,
) -> f32 {
    let term_length = term_length.max(1);
    let ed = edit_distance.min(term_length);
    let normalized_similarity =
        (1.0 - ed as f32 / term_length as f32) * similarity_boost.powi(ed as i32);
    let prefix_normalizer = if is_prefix_match { prefix_match_penalty } else { 1.0 };
    static_score * normalized_similarity * prefix_normalizer
}

pub fn aggregate_score_for_and(scores: &[f32]) -> f32 {
    scores.iter().sum()
}

pub fn aggregate_score_for_or(scores: &[f32]) -> f32 {
    scores.iter().cloned().fold(-1.0, f32::max)
}

pub fn aggregate_score_for_not(score: f32) -> f32 {
    1.0 - score
}

/// Distance score of a record inside a geo query shape.
pub fn compute_geo_score(record_position: &Point, query_shape: &Shape) -> f64 {
    let min_dist2_upper_bound = query_shape
        .search_radius_squared()
        .max(GEO_MIN_SEARCH_RANGE_SQUARE);
    let result_min_dist2 = query_shape.min_distance_squared(record_position);
    let distance_ratio =
        (min_dist2_upper_bound.sqrt() - result_min_dist2.sqrt()) / min_dist2_upper_bound.sqrt();
    (distance_ratio * distance_ratio).max(GEO_MIN_DISTANCE_SCORE)
}

/// Boost applied to a record with click feedback for the query. The recency
/// factor is an inverse-square curve that decays to zero at the horizon; the
/// frequency factor grows with the square root of the click count.
pub fn compute_feedback_boost(recency_secs: u64, frequency: u32) -> f32 {
    let clamped = (recency_secs as f64).min(FEEDBACK_RECENCY_HORIZON_SECS);
    let recency_factor = 1.0 - (clamped / FEEDBACK_RECENCY_HORIZON_SECS).powi(2);
    let frequency_factor = (frequency as f64).sqrt();
    (1.0 + recency_factor * frequency_factor) as f32
}

pub fn compute_feedback_boosted_score(score: f32, boost: f32) -> f32 {
    score * boost
}

/// Positional proximity factor for a phrase match, from the slop distance of
/// each occurrence.
pub fn compute_sloppy_frequency(slop_distances: &[u32]) -> f32 {
    let sum: f32 = slop_distances.iter().map(|&s| 1.0 / (1.0 + s as f32)).sum();
    sum.sqrt()
}

/// Phrase score: the AND score of the constituent terms shaped by proximity.
pub fn compute_positional_score(and_score: f32, sloppy_frequency: f32) -> f32 {
    and_score * sloppy_frequency
}

/// Descending score order with ascending record id as the tie break.
pub fn compare_records_greater_than(
    left_score: f32,
    left_id: RecordId,
    right_score: f32,
    right_id: RecordId,
) -> bool {
    if left_score == right_score {
        left_id < right_id
    } else {
        left_score > right_score
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::shapes::Circle;

    #[test]
    fn term_runtime_score_clamps_edit_distance() {
        // ed beyond the term length zeroes the similarity instead of going
        // negative.
        let score = compute_term_record_runtime_score(2.0, 5, 3, false, 0.95, 0.5);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn term_runtime_score_prefix_penalty() {
        let exact = compute_term_record_runtime_score(2.0, 0, 4, false, 0.95, 0.5);
        let prefix = compute_term_record_runtime_score(2.0, 0, 4, true, 0.95, 0.5);
        assert_eq!(exact, 2.0);
        assert!((prefix - 1.9).abs() < 1e-6);
    }

    #[test]
    fn aggregations() {
        assert_eq!(aggregate_score_for_and(&[1.0, 2.0, 3.0]), 6.0);
        assert_eq!(aggregate_score_for_or(&[1.0, 2.0, 3.0]), 3.0);
        assert_eq!(aggregate_score_for_not(0.25), 0.75);
    }

    #[test]
    fn feedback_boost_bounds() {
        // Always at least 1.
        assert!(compute_feedback_boost(10_000_000, 1) >= 1.0);
        // Strictly increasing in frequency.
        assert!(compute_feedback_boost(100, 9) > compute_feedback_boost(100, 4));
        // Strictly decreasing in recency until the horizon floor.
        assert!(compute_feedback_boost(100, 4) > compute_feedback_boost(1_000_000, 4));
        let at_horizon = compute_feedback_boost(7_776_000, 100);
        assert!((at_horizon - 1.0).abs() < 1e-6);
    }

    #[test]
    fn sloppy_frequency_decays_with_slop() {
        let tight = compute_sloppy_frequency(&[0]);
        let loose = compute_sloppy_frequency(&[3]);
        assert_eq!(tight, 1.0);
        assert!(loose < tight);

        let phrase = compute_positional_score(4.0, tight);
        assert_eq!(phrase, 4.0);
    }

    #[test]
    fn geo_score_is_floored_and_peaks_at_center() {
        let shape = Shape::Circle(Circle::new(Point::new(0.0, 0.0), 10.0));
        let near = compute_geo_score(&Point::new(0.0, 0.0), &shape);
        let far = compute_geo_score(&Point::new(10.0, 0.0), &shape);
        assert!((near - 1.0).abs() < 1e-9);
        assert_eq!(far, GEO_MIN_DISTANCE_SCORE);
    }

    #[test]
    fn tie_break_prefers_smaller_record_id() {
        assert!(compare_records_greater_than(
            1.5,
            RecordId(3),
            1.5,
            RecordId(9)
        ));
        assert!(!compare_records_greater_than(
            1.5,
            RecordId(9),
            1.5,
            RecordId(3)
        ));
        assert!(compare_records_greater_than(
            2.0,
            RecordId(9),
            1.5,
            RecordId(3)
        ));
    }
}
