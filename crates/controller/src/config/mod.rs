pub mod cli;
pub mod daemon;
pub mod file;

pub use cli::*;
pub use daemon::*;
pub use file::*;
