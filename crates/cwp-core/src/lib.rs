pub mod error;
pub mod escalation;
pub mod ids;
pub mod ledger;
pub mod model;
pub mod time;
pub mod types;

pub use error::*;
pub use escalation::*;
pub use ids::*;
pub use ledger::*;
pub use model::*;
pub use time::*;
pub use types::*;
