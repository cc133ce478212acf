pub mod discovery;
pub mod semaphore;

pub use discovery::*;
pub use semaphore::*;
