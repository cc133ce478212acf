pub mod config;
pub mod doctor;
pub mod engine;
pub mod invocation;
pub mod mail;
pub mod outbox;
pub mod outgoing;
pub mod subtest;
pub mod util;

pub use config::*;
pub use doctor::*;
pub use engine::*;
pub use invocation::*;
pub use mail::*;
pub use outbox::*;
pub use outgoing::*;
pub use subtest::*;
