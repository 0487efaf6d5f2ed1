pub mod astar;

pub use astar::{AStar, SearchOutcome, SearchStats};
