//! Shared test doubles and builders for the fleet crates.
//!
//! ```toml
//! [dev-dependencies]
//! fleet-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;
pub mod recorders;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
pub use recorders::*;
