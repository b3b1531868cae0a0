//! Recording doubles for the launch and staging seams

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::models::DependencyKind;
use fleet_core::traits::{Assignment, DependencyStager, TaskLauncher};
use fleet_core::{FleetError, FleetResult};

/// Keeps every launched assignment in order
#[derive(Debug, Clone, Default)]
pub struct RecordingLauncher {
    launched: Arc<Mutex<Vec<Assignment>>>,
}

impl RecordingLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launched(&self) -> Vec<Assignment> {
        self.launched.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.launched.lock().unwrap().len()
    }
}

impl TaskLauncher for RecordingLauncher {
    fn launch(&self, assignment: Assignment) -> FleetResult<()> {
        self.launched.lock().unwrap().push(assignment);
        Ok(())
    }
}

/// Counts staging calls, optionally slowly or failing for chosen kinds
#[derive(Debug, Clone, Default)]
pub struct CountingStager {
    calls: Arc<Mutex<Vec<(DependencyKind, String)>>>,
    failing: Arc<Mutex<HashSet<DependencyKind>>>,
    delay: Duration,
}

impl CountingStager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn fail_for(&self, kind: DependencyKind) {
        self.failing.lock().unwrap().insert(kind);
    }

    pub fn succeed_for(&self, kind: DependencyKind) {
        self.failing.lock().unwrap().remove(&kind);
    }

    pub fn calls(&self) -> Vec<(DependencyKind, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl DependencyStager for CountingStager {
    async fn stage(&self, kind: DependencyKind, version: &str) -> FleetResult<()> {
        self.calls.lock().unwrap().push((kind, version.to_string()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.failing.lock().unwrap().contains(&kind) {
            return Err(FleetError::StagingFailed {
                kind,
                message: "scripted failure".to_string(),
            });
        }
        Ok(())
    }
}
