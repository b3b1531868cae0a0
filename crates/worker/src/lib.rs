pub mod bounded_executor;
pub mod local_runner;
pub mod remote;

pub use bounded_executor::{JobHandle, LocalBoundedExecutor};
pub use local_runner::LocalAnalysisRunner;
pub use remote::RemotePaths;
