pub mod dispatch;
pub mod lock;
pub mod remote;
pub mod repository;

pub use dispatch::{Assignment, DependencyStager, TaskLauncher};
pub use lock::DistributedLock;
pub use remote::{RemoteChannel, RemoteSession};
pub use repository::{
    ConfigurationRepository, DependencyRepository, OrchestratorStateRepository, Repositories,
    UpdateRepository, WorkerRepository,
};
