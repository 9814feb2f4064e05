use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::core::error::Result;
use crate::core::types::RecordId;
use crate::geo::quadtree::{GeoElement, QuadTreeNode};
use crate::geo::shapes::Shape;
use crate::query::physical::{Candidate, ExecContext, PhysicalOperator};
use crate::ranking::compute_geo_score;

enum Frontier {
    Node(Arc<QuadTreeNode>),
    Element(GeoElement),
}

/// Min-heap entry ordered by distance to the query shape's centre.
struct Nearest {
    distance_squared: f64,
    item: Frontier,
}

impl PartialEq for Nearest {
    fn eq(&self, other: &Self) -> bool {
        self.distance_squared == other.distance_squared
    }
}
impl Eq for Nearest {}
impl Ord for Nearest {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: BinaryHeap is a max-heap, nearest first is wanted.
        other
            .distance_squared
            .total_cmp(&self.distance_squared)
    }
}
impl PartialOrd for Nearest {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Best-first traversal of the quadtree from the query shape's centre,
/// emitting in-range elements closest first. The geo score decays with
/// distance, so the output is score-sorted.
pub struct GeoNearestNeighbor {
    shape: Shape,
    frontier: BinaryHeap<Nearest>,
}

impl GeoNearestNeighbor {
    pub fn new(shape: Shape) -> Self {
        GeoNearestNeighbor {
            shape,
            frontier: BinaryHeap::new(),
        }
    }
}

impl PhysicalOperator for GeoNearestNeighbor {
    fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        let center = self.shape.center();
        let root = Arc::clone(&ctx.view.quadtree_root);
        self.frontier.push(Nearest {
            distance_squared: root.rectangle.min_distance_squared(&center),
            item: Frontier::Node(root),
        });
        Ok(())
    }

    fn get_next(&mut self, ctx: &ExecContext) -> Result<Option<Candidate>> {
        let center = self.shape.center();
        while let Some(nearest) = self.frontier.pop() {
            match nearest.item {
                Frontier::Node(node) => {
                    if !self.shape.bounding_rectangle().intersects(&node.rectangle) {
                        continue;
                    }
                    if node.is_leaf {
                        for element in &node.elements {
                            self.frontier.push(Nearest {
                                distance_squared: center.distance_squared(&element.point),
                                item: Frontier::Element(*element),
                            });
                        }
                    } else {
                        for child in node.children.iter().flatten() {
                            self.frontier.push(Nearest {
                                distance_squared: child
                                    .rectangle
                                    .min_distance_squared(&center),
                                item: Frontier::Node(Arc::clone(child)),
                            });
                        }
                    }
                }
                Frontier::Element(element) => {
                    if !self.shape.contains(&element.point) {
                        continue;
                    }
                    if !ctx.view.forward.is_valid(element.record) {
                        continue;
                    }
                    return Ok(Some(Candidate {
                        record: element.record,
                        score: compute_geo_score(&element.point, &self.shape) as f32,
                    }));
                }
            }
        }
        Ok(None)
    }

    fn close(&mut self) {
        self.frontier.clear();
    }

    fn verify(&mut self, ctx: &ExecContext, record: RecordId) -> Result<Option<f32>> {
        verify_geo(&self.shape, ctx, record)
    }
}

/// Range query materialised in ascending record-id order.
pub struct GeoSimpleScan {
    shape: Shape,
    results: Vec<Candidate>,
    cursor: usize,
}

impl GeoSimpleScan {
    pub fn new(shape: Shape) -> Self {
        GeoSimpleScan {
            shape,
            results: Vec::new(),
            cursor: 0,
        }
    }
}

impl PhysicalOperator for GeoSimpleScan {
    fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        let mut in_range = Vec::new();
        ctx.view.quadtree_root.range_query(&self.shape, &mut in_range);
        self.results = in_range
            .into_iter()
            .filter(|element| ctx.view.forward.is_valid(element.record))
            .map(|element| Candidate {
                record: element.record,
                score: compute_geo_score(&element.point, &self.shape) as f32,
            })
            .collect();
        self.results.sort_by_key(|c| c.record);
        Ok(())
    }

    fn get_next(&mut self, _ctx: &ExecContext) -> Result<Option<Candidate>> {
        let item = self.results.get(self.cursor).copied();
        self.cursor += 1;
        Ok(item)
    }

    fn close(&mut self) {
        self.results.clear();
        self.cursor = 0;
    }

    fn verify(&mut self, ctx: &ExecContext, record: RecordId) -> Result<Option<f32>> {
        verify_geo(&self.shape, ctx, record)
    }
}

/// Verification-only geo predicate.
pub struct RandomAccessGeo {
    shape: Shape,
}

impl RandomAccessGeo {
    pub fn new(shape: Shape) -> Self {
        RandomAccessGeo { shape }
    }
}

impl PhysicalOperator for RandomAccessGeo {
    fn open(&mut self, _ctx: &ExecContext) -> Result<()> {
        Ok(())
    }

    fn get_next(&mut self, _ctx: &ExecContext) -> Result<Option<Candidate>> {
        Ok(None)
    }

    fn close(&mut self) {}

    fn verify(&mut self, ctx: &ExecContext, record: RecordId) -> Result<Option<f32>> {
        verify_geo(&self.shape, ctx, record)
    }
}

fn verify_geo(shape: &Shape, ctx: &ExecContext, record: RecordId) -> Result<Option<f32>> {
    let Some(list) = ctx.view.forward.get(record) else {
        return Ok(None);
    };
    let Some(point) = list.record.location else {
        return Ok(None);
    };
    if shape.contains(&point) {
        Ok(Some(compute_geo_score(&point, shape) as f32))
    } else {
        Ok(None)
    }
}
