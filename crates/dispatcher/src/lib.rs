//! 调度层：Worker编排、依赖协调、更新队列与健康轮询

pub mod dependency_coordinator;
pub mod health_poller;
pub mod launcher;
pub mod lifecycle;
pub mod orchestrator;
pub mod registry;
pub mod results;
pub mod session;
pub mod staging;
pub mod submission;
pub mod update_queue;
pub mod version_check;

pub use dependency_coordinator::DependencyCoordinator;
pub use health_poller::{HealthPoller, PollReport};
pub use launcher::{AssignmentRunner, ChannelLauncher, LaunchOutcome};
pub use lifecycle::WorkerLifecycle;
pub use orchestrator::{TaskPlacement, WorkerAssignment, WorkerOrchestrator};
pub use registry::{HostProbe, Registration, TcpProbe, WorkerRegistry};
pub use results::{CompletionHook, LogCollector};
pub use staging::ScriptStager;
pub use submission::{AnalysisSubmitter, Submission};
pub use update_queue::{QueueReceipt, RefreshPlan, UpdateQueue};
pub use version_check::{GithubVersionSource, VersionChecker, VersionSource};
