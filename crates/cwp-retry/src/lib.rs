pub mod state;
pub mod tracker;

pub use state::*;
pub use tracker::*;
