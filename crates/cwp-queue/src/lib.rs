pub mod counter;
pub mod fs;
pub mod traits;

pub use counter::*;
pub use fs::*;
pub use traits::*;
