pub mod access_log;
pub mod crypto;
pub mod sweeper;
pub mod token;
pub mod vault;

pub use access_log::AccessLogService;
pub use crypto::{ScratchGuard, ScratchStream, StreamCipher};
pub use sweeper::Sweeper;
pub use token::TokenIssuer;
pub use vault::VaultService;
