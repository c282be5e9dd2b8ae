pub mod access_log;
pub mod file;
pub mod identity;

pub use access_log::*;
pub use file::*;
pub use identity::*;
