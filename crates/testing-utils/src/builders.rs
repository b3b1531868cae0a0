//! Builders for test entities with sensible defaults

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use fleet_core::models::{AnalysisTask, Cidr, ConfigStatus, Configuration, Worker};
use uuid::Uuid;

pub fn ip(address: &str) -> IpAddr {
    address.parse().unwrap()
}

pub struct WorkerBuilder {
    worker: Worker,
}

impl WorkerBuilder {
    pub fn new(address: &str) -> Self {
        Self {
            worker: Worker::discovered(ip(address), 1),
        }
    }

    pub fn with_configuration(mut self, id: i64) -> Self {
        self.worker.configuration_ids.insert(id);
        self
    }

    pub fn with_status(mut self, status: ConfigStatus) -> Self {
        self.worker.status = status;
        self
    }

    pub fn configured(self) -> Self {
        self.with_status(ConfigStatus::Configured)
    }

    pub fn unreachable(mut self) -> Self {
        self.worker.reachable = false;
        self
    }

    pub fn last_reached(mut self, at: DateTime<Utc>) -> Self {
        self.worker.last_reached = Some(at);
        self
    }

    pub fn with_analysis(mut self, analysis_id: Uuid, pid: Option<u32>) -> Self {
        self.worker.analysis_id = Some(analysis_id);
        self.worker.analysis_pid = pid;
        self
    }

    pub fn build(self) -> Worker {
        self.worker
    }
}

pub struct ConfigurationBuilder {
    configuration: Configuration,
}

impl ConfigurationBuilder {
    pub fn new(id: i64) -> Self {
        Self {
            configuration: Configuration::new(
                id,
                "admin",
                format!("configuration-{id}"),
                "root",
                "secret",
                "10.0.0.0/24".parse::<Cidr>().unwrap(),
            ),
        }
    }

    pub fn with_range(mut self, range: &str) -> Self {
        self.configuration.ip_range = range.parse().unwrap();
        self
    }

    pub fn with_user(mut self, user: &str) -> Self {
        self.configuration.ssh_user = user.to_string();
        self
    }

    pub fn build(self) -> Configuration {
        self.configuration
    }
}

pub struct TaskBuilder {
    task: AnalysisTask,
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self {
            task: AnalysisTask::new(
                Uuid::new_v4(),
                "emba -l /root/analysis_logs -f /root/firmware/firmware.bin",
                "/tmp/uploads/firmware.bin",
                "/root/firmware/firmware.bin",
            ),
        }
    }

    pub fn with_id(mut self, analysis_id: Uuid) -> Self {
        self.task.analysis_id = analysis_id;
        self
    }

    pub fn with_command(mut self, command: &str) -> Self {
        self.task.command = command.to_string();
        self
    }

    pub fn build(self) -> AnalysisTask {
        self.task
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}
