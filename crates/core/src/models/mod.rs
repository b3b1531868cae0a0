pub mod configuration;
pub mod dependency;
pub mod task;
pub mod worker;

pub use configuration::{Cidr, Configuration, ScanStatus};
pub use dependency::{
    parse_deb_list, Availability, AvailableDependencyVersion, CachedDependencyVersion,
    DebListDiff, DebPackage, DependencyKind, DependencyState, DependencyVersionRecord,
    WorkerUpdate, CACHED_VERSION, LATEST_VERSION,
};
pub use task::{AnalysisTask, OrchestratorState};
pub use worker::{AnalysisStatus, ConfigStatus, Worker};
