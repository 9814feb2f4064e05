pub mod quadtree;
pub mod shapes;
