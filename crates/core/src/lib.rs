pub mod config;
pub mod errors;
pub mod lease;
pub mod models;
pub mod shell;
pub mod traits;

pub use config::AppConfig;
pub use errors::{FleetError, FleetResult};
pub use lease::{lock_token, LockLease};
