use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 固件分析任务，入队后不可变
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnalysisTask {
    /// 分析标识，同时作为回调标识
    pub analysis_id: Uuid,
    /// 分析工具命令行
    pub command: String,
    /// 本地固件镜像路径
    pub source_path: String,
    /// 远程目标路径
    pub target_path: String,
    pub submitted_at: DateTime<Utc>,
}

impl AnalysisTask {
    pub fn new(
        analysis_id: Uuid,
        command: impl Into<String>,
        source_path: impl Into<String>,
        target_path: impl Into<String>,
    ) -> Self {
        Self {
            analysis_id,
            command: command.into(),
            source_path: source_path.into(),
            target_path: target_path.into(),
            submitted_at: Utc::now(),
        }
    }
}

/// 编排器状态快照，也是持久化镜像的格式
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorState {
    pub free_workers: BTreeSet<IpAddr>,
    pub busy_workers: BTreeMap<IpAddr, AnalysisTask>,
    pub tasks: VecDeque<AnalysisTask>,
}

impl OrchestratorState {
    pub fn is_tracked(&self, address: &IpAddr) -> bool {
        self.free_workers.contains(address) || self.busy_workers.contains_key(address)
    }
}
