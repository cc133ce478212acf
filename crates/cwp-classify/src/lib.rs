pub mod classifier;
pub mod guidance;
pub mod heuristics;
pub mod result_log;
pub mod score;

pub use classifier::*;
pub use heuristics::*;
pub use result_log::*;
pub use score::*;
