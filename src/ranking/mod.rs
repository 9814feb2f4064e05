pub mod feedback;
pub mod ranker;

pub use ranker::*;
