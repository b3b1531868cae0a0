use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{FleetError, FleetResult};

/// Worker配置状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConfigStatus {
    #[serde(rename = "UNCONFIGURED")]
    Unconfigured,
    #[serde(rename = "CONFIGURING")]
    Configuring,
    #[serde(rename = "CONFIGURED")]
    Configured,
    #[serde(rename = "ERROR")]
    Error,
}

impl ConfigStatus {
    /// 判断状态转换是否合法
    ///
    /// 相同状态之间的"转换"视为无操作，始终允许。
    pub fn can_transition_to(self, next: ConfigStatus) -> bool {
        use ConfigStatus::*;

        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Unconfigured, Configuring)
                | (Configuring, Configured)
                | (Configuring, Error)
                | (Error, Configuring)
                | (Configured, Configuring)
                // 硬重置
                | (Configured, Unconfigured)
                | (Configuring, Unconfigured)
                | (Error, Unconfigured)
        )
    }
}

impl fmt::Display for ConfigStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConfigStatus::Unconfigured => "UNCONFIGURED",
            ConfigStatus::Configuring => "CONFIGURING",
            ConfigStatus::Configured => "CONFIGURED",
            ConfigStatus::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// 分析状态，由健康探测推断得出，不做持久化
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AnalysisStatus {
    Unassigned,
    Running,
}

/// 远程Worker节点
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Worker {
    pub address: IpAddr,
    pub name: String,
    pub configuration_ids: BTreeSet<i64>,
    pub reachable: bool,
    pub status: ConfigStatus,
    pub analysis_id: Option<Uuid>,
    /// 远程分析进程ID，用于存活探测
    pub analysis_pid: Option<u32>,
    pub system_info: BTreeMap<String, String>,
    pub last_reached: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Worker {
    /// 通过网络扫描发现新Worker时创建
    pub fn discovered(address: IpAddr, configuration_id: i64) -> Self {
        let mut configuration_ids = BTreeSet::new();
        configuration_ids.insert(configuration_id);
        let now = Utc::now();

        Self {
            address,
            name: format!("worker-{address}"),
            configuration_ids,
            reachable: true,
            status: ConfigStatus::Unconfigured,
            analysis_id: None,
            analysis_pid: None,
            system_info: BTreeMap::new(),
            last_reached: Some(now),
            created_at: now,
        }
    }

    /// 按状态机规则修改配置状态
    pub fn transition_to(&mut self, next: ConfigStatus) -> FleetResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(FleetError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_reached(&mut self) {
        self.reachable = true;
        self.last_reached = Some(Utc::now());
    }

    pub fn clear_analysis(&mut self) {
        self.analysis_id = None;
        self.analysis_pid = None;
    }

    pub fn is_configured(&self) -> bool {
        self.status == ConfigStatus::Configured
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_transitions() {
        use ConfigStatus::*;

        assert!(Unconfigured.can_transition_to(Configuring));
        assert!(Configuring.can_transition_to(Configured));
        assert!(Configuring.can_transition_to(Error));
        assert!(Error.can_transition_to(Configuring));
        assert!(Configured.can_transition_to(Configuring));
        assert!(Configured.can_transition_to(Configured));
    }

    #[test]
    fn test_rejected_transitions() {
        use ConfigStatus::*;

        assert!(!Unconfigured.can_transition_to(Configured));
        assert!(!Unconfigured.can_transition_to(Error));
        assert!(!Error.can_transition_to(Configured));
        assert!(!Configured.can_transition_to(Error));
    }

    #[test]
    fn test_transition_to_reports_both_states() {
        let mut worker = Worker::discovered("10.0.0.5".parse().unwrap(), 1);
        let err = worker.transition_to(ConfigStatus::Configured).unwrap_err();

        match err {
            FleetError::InvalidTransition { from, to } => {
                assert_eq!(from, ConfigStatus::Unconfigured);
                assert_eq!(to, ConfigStatus::Configured);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(worker.status, ConfigStatus::Unconfigured);
    }

    #[test]
    fn test_status_serializes_upper_case() {
        let json = serde_json::to_string(&ConfigStatus::Configuring).unwrap();
        assert_eq!(json, "\"CONFIGURING\"");
    }
}
