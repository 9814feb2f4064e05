use serde::{Deserialize, Serialize};

/// Bounds of the whole quadtree space.
pub const WORLD_MIN: f64 = -200.0;
pub const WORLD_MAX: f64 = 200.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Point { x, y }
    }

    pub fn distance_squared(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }

    pub fn in_world_bounds(&self) -> bool {
        self.x >= WORLD_MIN && self.x <= WORLD_MAX && self.y >= WORLD_MIN && self.y <= WORLD_MAX
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rectangle {
    pub min: Point,
    pub max: Point,
}

impl Rectangle {
    pub fn new(min: Point, max: Point) -> Self {
        Rectangle { min, max }
    }

    pub fn world() -> Self {
        Rectangle {
            min: Point::new(WORLD_MIN, WORLD_MIN),
            max: Point::new(WORLD_MAX, WORLD_MAX),
        }
    }

    pub fn area(&self) -> f64 {
        (self.max.x - self.min.x) * (self.max.y - self.min.y)
    }

    pub fn contains(&self, point: &Point) -> bool {
        point.x >= self.min.x && point.x <= self.max.x && point.y >= self.min.y && point.y <= self.max.y
    }

    pub fn contains_rectangle(&self, other: &Rectangle) -> bool {
        self.contains(&other.min) && self.contains(&other.max)
    }

    pub fn intersects(&self, other: &Rectangle) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
    }

    /// Squared distance from a point to the nearest point of the rectangle;
    /// zero when the point is inside.
    pub fn min_distance_squared(&self, point: &Point) -> f64 {
        let dx = (self.min.x - point.x).max(0.0).max(point.x - self.max.x);
        let dy = (self.min.y - point.y).max(0.0).max(point.y - self.max.y);
        dx * dx + dy * dy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Circle {
    pub center: Point,
    pub radius: f64,
}

impl Circle {
    pub fn new(center: Point, radius: f64) -> Self {
        Circle { center, radius }
    }

    pub fn contains(&self, point: &Point) -> bool {
        self.center.distance_squared(point) <= self.radius * self.radius
    }

    /// The circumscribing rectangle, used to walk the quadtree.
    pub fn bounding_rectangle(&self) -> Rectangle {
        Rectangle {
            min: Point::new(self.center.x - self.radius, self.center.y - self.radius),
            max: Point::new(self.center.x + self.radius, self.center.y + self.radius),
        }
    }
}

/// Query shape for geo range search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Shape {
    Rectangle(Rectangle),
    Circle(Circle),
}

impl Shape {
    pub fn contains(&self, point: &Point) -> bool {
        match self {
            Shape::Rectangle(r) => r.contains(point),
            Shape::Circle(c) => c.contains(point),
        }
    }

    pub fn bounding_rectangle(&self) -> Rectangle {
        match self {
            Shape::Rectangle(r) => *r,
            Shape::Circle(c) => c.bounding_rectangle(),
        }
    }

    /// Squared search radius: for rectangles, the squared half-diagonal.
    pub fn search_radius_squared(&self) -> f64 {
        match self {
            Shape::Circle(c) => c.radius * c.radius,
            Shape::Rectangle(r) => {
                let dx = (r.max.x - r.min.x) / 2.0;
                let dy = (r.max.y - r.min.y) / 2.0;
                dx * dx + dy * dy
            }
        }
    }

    pub fn center(&self) -> Point {
        match self {
            Shape::Circle(c) => c.center,
            Shape::Rectangle(r) => Point::new((r.min.x + r.max.x) / 2.0, (r.min.y + r.max.y) / 2.0),
        }
    }

    pub fn min_distance_squared(&self, point: &Point) -> f64 {
        self.center().distance_squared(point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rectangle_containment() {
        let rect = Rectangle::new(Point::new(10.0, 10.0), Point::new(20.0, 20.0));
        assert!(rect.contains(&Point::new(15.0, 15.0)));
        assert!(rect.contains(&Point::new(10.0, 20.0)));
        assert!(!rect.contains(&Point::new(9.9, 15.0)));
    }

    #[test]
    fn rectangle_min_distance() {
        let rect = Rectangle::new(Point::new(0.0, 0.0), Point::new(10.0, 10.0));
        assert_eq!(rect.min_distance_squared(&Point::new(5.0, 5.0)), 0.0);
        assert_eq!(rect.min_distance_squared(&Point::new(13.0, 14.0)), 25.0);
    }

    #[test]
    fn circle_containment() {
        let circle = Circle::new(Point::new(100.0, 100.0), 30.0);
        assert!(circle.contains(&Point::new(110.0, 110.0)));
        assert!(!circle.contains(&Point::new(-100.0, 100.0)));
    }
}
