pub mod allowance;
pub mod bet;
pub mod bindings;
pub mod config;
pub mod session;
pub mod sync;
pub mod tracker;
pub mod wallet;

pub use config::AppConfig;
pub use session::{
    SessionManager,
    SessionReset,
    WalletSession,
};
