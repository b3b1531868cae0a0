use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{FleetError, FleetResult};

/// 未指定具体版本时使用的占位版本
pub const LATEST_VERSION: &str = "latest";
/// DEPS依赖基于本地已缓存的软件包增量更新
pub const CACHED_VERSION: &str = "cached";

/// 依赖类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DependencyKind {
    /// 系统软件包集合
    #[serde(rename = "DEPS")]
    Deps,
    /// 分析工具代码仓库
    #[serde(rename = "REPO")]
    Repo,
    /// 外部漏洞数据源
    #[serde(rename = "EXTERNAL")]
    External,
    /// 分析工具容器镜像
    #[serde(rename = "DOCKERIMAGE")]
    DockerImage,
}

impl DependencyKind {
    pub const ALL: [DependencyKind; 4] = [
        DependencyKind::Deps,
        DependencyKind::Repo,
        DependencyKind::External,
        DependencyKind::DockerImage,
    ];

    /// 本地与远程存放该依赖的目录名
    pub fn folder_name(self) -> &'static str {
        match self {
            DependencyKind::Deps => "DEPS",
            DependencyKind::Repo => "REPO",
            DependencyKind::External => "EXTERNAL",
            DependencyKind::DockerImage => "DOCKERIMAGE",
        }
    }

    /// 本地准备该依赖的脚本名
    pub fn script_name(self) -> &'static str {
        match self {
            DependencyKind::Deps => "deps_host.sh",
            DependencyKind::Repo => "emba_repo_host.sh",
            DependencyKind::External => "external_host.sh",
            DependencyKind::DockerImage => "emba_docker_host.sh",
        }
    }

    pub fn archive_name(self) -> String {
        format!("{}.tar.gz", self.folder_name())
    }
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.folder_name())
    }
}

impl FromStr for DependencyKind {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEPS" => Ok(DependencyKind::Deps),
            "REPO" => Ok(DependencyKind::Repo),
            "EXTERNAL" => Ok(DependencyKind::External),
            "DOCKERIMAGE" => Ok(DependencyKind::DockerImage),
            _ => Err(FleetError::Configuration(format!("未知的依赖类型: {s}"))),
        }
    }
}

/// 依赖缓存可用性
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Availability {
    #[serde(rename = "UNAVAILABLE")]
    Unavailable,
    #[serde(rename = "IN_PROGRESS")]
    InProgress,
    #[serde(rename = "AVAILABLE")]
    Available,
}

/// 每种依赖的共享缓存状态
///
/// 只有 `used_by` 为空时才能离开 UNAVAILABLE；只有 AVAILABLE 时才能登记使用者。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DependencyState {
    pub kind: DependencyKind,
    pub availability: Availability,
    pub used_by: BTreeSet<IpAddr>,
}

impl DependencyState {
    pub fn new(kind: DependencyKind) -> Self {
        Self {
            kind,
            availability: Availability::Unavailable,
            used_by: BTreeSet::new(),
        }
    }

    pub fn in_use(&self) -> bool {
        !self.used_by.is_empty()
    }
}

/// 本地已缓存、用于分发的依赖版本（单例）
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CachedDependencyVersion {
    pub current: BTreeMap<DependencyKind, String>,
    /// 每种依赖曾经缓存过的版本，只增不减
    pub history: BTreeMap<DependencyKind, Vec<String>>,
}

impl CachedDependencyVersion {
    pub fn current(&self, kind: DependencyKind) -> Option<&str> {
        self.current.get(&kind).map(String::as_str)
    }

    /// 记录新缓存的版本
    pub fn set(&mut self, kind: DependencyKind, version: &str) {
        self.current.insert(kind, version.to_string());
        if version == LATEST_VERSION {
            return;
        }
        let history = self.history.entry(kind).or_default();
        if !history.iter().any(|v| v == version) {
            history.push(version.to_string());
        }
    }

    pub fn in_history(&self, kind: DependencyKind, version: &str) -> bool {
        self.history
            .get(&kind)
            .map(|h| h.iter().any(|v| v == version))
            .unwrap_or(false)
    }

    /// 当前缓存是否满足请求的版本
    ///
    /// 精确匹配，或请求的版本已出现在历史中（说明已有更新的缓存取代了它）。
    /// DEPS 只要有缓存就视为满足，软件包在本地按需增量补齐。
    pub fn satisfies(&self, kind: DependencyKind, version: &str) -> bool {
        let Some(current) = self.current(kind) else {
            return false;
        };
        if kind == DependencyKind::Deps {
            return true;
        }
        current == version || self.in_history(kind, version)
    }

    pub fn clear(&mut self, kind: DependencyKind) {
        self.current.remove(&kind);
    }
}

/// 单个已安装/可用的deb软件包
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DebPackage {
    pub version: String,
    pub architecture: String,
    pub sha256: String,
}

/// 软件包列表差异
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DebListDiff {
    pub new: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

impl DebListDiff {
    pub fn between(
        installed: &BTreeMap<String, DebPackage>,
        available: &BTreeMap<String, DebPackage>,
    ) -> Self {
        let mut diff = DebListDiff::default();

        for (name, package) in available {
            match installed.get(name) {
                None => diff.new.push(name.clone()),
                Some(current) if current != package => diff.updated.push(name.clone()),
                Some(_) => {}
            }
        }
        for name in installed.keys() {
            if !available.contains_key(name) {
                diff.removed.push(name.clone());
            }
        }

        diff
    }

    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

/// 远端最新可用的依赖版本（单例）
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AvailableDependencyVersion {
    pub repo_head: Option<String>,
    pub image_tag: Option<String>,
    pub nvd_head: Option<String>,
    pub nvd_time: Option<String>,
    pub epss_head: Option<String>,
    pub epss_time: Option<String>,
    /// 本地已准备好的软件包列表
    pub deb_list: BTreeMap<String, DebPackage>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl AvailableDependencyVersion {
    /// 未显式指定版本时，各依赖默认的目标版本
    pub fn version_for(&self, kind: DependencyKind) -> String {
        match kind {
            DependencyKind::Deps => {
                if self.deb_list.is_empty() {
                    LATEST_VERSION.to_string()
                } else {
                    CACHED_VERSION.to_string()
                }
            }
            DependencyKind::Repo => self
                .repo_head
                .clone()
                .unwrap_or_else(|| LATEST_VERSION.to_string()),
            DependencyKind::DockerImage => self
                .image_tag
                .clone()
                .unwrap_or_else(|| LATEST_VERSION.to_string()),
            DependencyKind::External => format!(
                "{},{}",
                self.nvd_head.as_deref().unwrap_or(LATEST_VERSION),
                self.epss_head.as_deref().unwrap_or(LATEST_VERSION)
            ),
        }
    }
}

/// 每个Worker上已安装的依赖版本记录
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DependencyVersionRecord {
    pub repo_head: Option<String>,
    pub image_tag: Option<String>,
    pub nvd_head: Option<String>,
    pub nvd_time: Option<String>,
    pub epss_head: Option<String>,
    pub epss_time: Option<String>,
    pub deb_list: BTreeMap<String, DebPackage>,
    pub deb_list_diff: DebListDiff,
    pub repo_outdated: bool,
    pub image_outdated: bool,
    pub external_outdated: bool,
    pub deps_outdated: bool,
}

impl DependencyVersionRecord {
    /// 与最新可用版本比较，刷新过期标记
    pub fn evaluate_outdated(&mut self, available: &AvailableDependencyVersion) {
        fn differs(installed: &Option<String>, latest: &Option<String>) -> bool {
            latest.is_some() && installed != latest
        }

        self.repo_outdated = differs(&self.repo_head, &available.repo_head);
        self.image_outdated = differs(&self.image_tag, &available.image_tag);
        self.external_outdated = differs(&self.nvd_head, &available.nvd_head)
            || differs(&self.epss_head, &available.epss_head);

        self.deb_list_diff = DebListDiff::between(&self.deb_list, &available.deb_list);
        self.deps_outdated = !self.deb_list_diff.is_empty() || self.deb_list.is_empty();
    }

    /// Worker上是否已安装指定版本；DEPS 总是需要重新执行安装
    pub fn has_installed(&self, kind: DependencyKind, version: &str) -> bool {
        match kind {
            DependencyKind::Deps => false,
            DependencyKind::Repo => self.repo_head.as_deref() == Some(version),
            DependencyKind::DockerImage => self.image_tag.as_deref() == Some(version),
            DependencyKind::External => match version.split_once(',') {
                Some((nvd, epss)) => {
                    self.nvd_head.as_deref() == Some(nvd) && self.epss_head.as_deref() == Some(epss)
                }
                None => false,
            },
        }
    }
}

/// 排队中的依赖更新请求
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerUpdate {
    pub id: Uuid,
    pub worker: IpAddr,
    pub kind: DependencyKind,
    pub version: String,
    pub created_at: DateTime<Utc>,
}

impl WorkerUpdate {
    pub fn new(worker: IpAddr, kind: DependencyKind, version: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            worker,
            kind,
            version: version.into(),
            created_at: Utc::now(),
        }
    }
}

/// 解析 `sha256sum *.deb` 的输出
///
/// 每行形如 `<sha256>  <name>_<version>_<arch>.deb`，无法识别的行直接跳过。
pub fn parse_deb_list(output: &str) -> FleetResult<BTreeMap<String, DebPackage>> {
    let pattern = Regex::new(r"^(?P<name>[^_]+)_(?P<version>[^_]+)_(?P<architecture>[^.]+)\.deb$")
        .map_err(|e| FleetError::Internal(format!("编译软件包匹配规则失败: {e}")))?;

    let mut packages = BTreeMap::new();
    for line in output.lines() {
        let Some((sha256, file)) = line.trim().split_once("  ") else {
            continue;
        };
        let file = file.trim().trim_start_matches('*');
        let file = file.rsplit('/').next().unwrap_or(file);

        if let Some(caps) = pattern.captures(file) {
            packages.insert(
                caps["name"].to_string(),
                DebPackage {
                    version: caps["version"].to_string(),
                    architecture: caps["architecture"].to_string(),
                    sha256: sha256.to_string(),
                },
            );
        }
    }

    Ok(packages)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package(version: &str, sha: &str) -> DebPackage {
        DebPackage {
            version: version.to_string(),
            architecture: "amd64".to_string(),
            sha256: sha.to_string(),
        }
    }

    #[test]
    fn test_cached_history_grows_monotonically() {
        let mut cached = CachedDependencyVersion::default();
        cached.set(DependencyKind::Repo, "aaa");
        cached.set(DependencyKind::Repo, "bbb");
        cached.set(DependencyKind::Repo, "aaa");
        cached.set(DependencyKind::Repo, LATEST_VERSION);

        assert_eq!(cached.current(DependencyKind::Repo), Some(LATEST_VERSION));
        assert_eq!(
            cached.history.get(&DependencyKind::Repo).unwrap(),
            &vec!["aaa".to_string(), "bbb".to_string()]
        );
    }

    #[test]
    fn test_satisfies_by_history() {
        let mut cached = CachedDependencyVersion::default();
        assert!(!cached.satisfies(DependencyKind::DockerImage, "1.0"));

        cached.set(DependencyKind::DockerImage, "1.0");
        cached.set(DependencyKind::DockerImage, "2.0");

        assert!(cached.satisfies(DependencyKind::DockerImage, "2.0"));
        assert!(cached.satisfies(DependencyKind::DockerImage, "1.0"));
        assert!(!cached.satisfies(DependencyKind::DockerImage, "3.0"));
    }

    #[test]
    fn test_deps_satisfied_by_any_staging() {
        let mut cached = CachedDependencyVersion::default();
        cached.set(DependencyKind::Deps, LATEST_VERSION);
        assert!(cached.satisfies(DependencyKind::Deps, CACHED_VERSION));
    }

    #[test]
    fn test_parse_deb_list() {
        let output = "\
0123abcd  curl_7.88.1-10_amd64.deb
4567ef01  ./libssl3_3.0.11-1_amd64.deb
garbage line
89ab  not-a-package.txt
";
        let packages = parse_deb_list(output).unwrap();

        assert_eq!(packages.len(), 2);
        assert_eq!(packages["curl"].version, "7.88.1-10");
        assert_eq!(packages["libssl3"].sha256, "4567ef01");
    }

    #[test]
    fn test_evaluate_outdated() {
        let mut available = AvailableDependencyVersion {
            repo_head: Some("head-2".to_string()),
            image_tag: Some("2.0".to_string()),
            nvd_head: Some("nvd-2".to_string()),
            epss_head: Some("epss-1".to_string()),
            ..Default::default()
        };
        available.deb_list.insert("curl".to_string(), package("8.0", "new"));
        available.deb_list.insert("git".to_string(), package("2.4", "same"));

        let mut record = DependencyVersionRecord {
            repo_head: Some("head-2".to_string()),
            image_tag: Some("1.0".to_string()),
            nvd_head: Some("nvd-1".to_string()),
            epss_head: Some("epss-1".to_string()),
            ..Default::default()
        };
        record.deb_list.insert("curl".to_string(), package("7.0", "old"));
        record.deb_list.insert("vim".to_string(), package("9.0", "x"));

        record.evaluate_outdated(&available);

        assert!(!record.repo_outdated);
        assert!(record.image_outdated);
        assert!(record.external_outdated);
        assert!(record.deps_outdated);
        assert_eq!(record.deb_list_diff.new, vec!["git".to_string()]);
        assert_eq!(record.deb_list_diff.removed, vec!["vim".to_string()]);
        assert_eq!(record.deb_list_diff.updated, vec!["curl".to_string()]);
    }

    #[test]
    fn test_empty_deb_list_is_outdated() {
        let mut record = DependencyVersionRecord::default();
        record.evaluate_outdated(&AvailableDependencyVersion::default());
        assert!(record.deps_outdated);
        assert!(!record.repo_outdated);
    }

    #[test]
    fn test_default_versions() {
        let available = AvailableDependencyVersion {
            nvd_head: Some("n1".to_string()),
            epss_head: Some("e1".to_string()),
            ..Default::default()
        };
        assert_eq!(available.version_for(DependencyKind::External), "n1,e1");
        assert_eq!(available.version_for(DependencyKind::Repo), LATEST_VERSION);
        assert_eq!(available.version_for(DependencyKind::Deps), LATEST_VERSION);
    }

    #[test]
    fn test_has_installed_external() {
        let record = DependencyVersionRecord {
            nvd_head: Some("n1".to_string()),
            epss_head: Some("e1".to_string()),
            ..Default::default()
        };
        assert!(record.has_installed(DependencyKind::External, "n1,e1"));
        assert!(!record.has_installed(DependencyKind::External, "n1,e2"));
        assert!(!record.has_installed(DependencyKind::Deps, CACHED_VERSION));
    }
}
