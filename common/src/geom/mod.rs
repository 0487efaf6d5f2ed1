pub mod coord;
pub mod point;
pub mod polygon;
pub mod rect;
pub mod rtree;
