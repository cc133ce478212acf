pub mod exit;
pub mod fs_ops;
pub mod perms;
pub mod process;
pub mod run;
pub mod spec;

pub use exit::*;
pub use run::*;
pub use spec::*;
