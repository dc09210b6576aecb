// Companion Engine - Core module structure
pub mod cli;
pub mod config;
pub mod crypto;
pub mod logging;
pub mod session;
pub mod updater;
pub mod vault;

pub use config::Config;
pub use crypto::{EnvelopeCipher, MasterKey};
pub use session::SessionManager;
pub use vault::SessionVault;
