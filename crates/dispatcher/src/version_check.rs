//! 依赖版本检查
//!
//! 定期从远端获取各依赖的最新版本，保存为可用版本，并据此刷新每个Worker的过期标记。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use fleet_core::config::VersionCheckConfig;
use fleet_core::models::AvailableDependencyVersion;
use fleet_core::traits::Repositories;
use fleet_core::{FleetError, FleetResult};

/// 最新版本来源，返回值不包含本地软件包列表
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VersionSource: Send + Sync {
    async fn fetch(&self) -> FleetResult<AvailableDependencyVersion>;
}

#[derive(Debug, Deserialize)]
struct CommitEntry {
    sha: String,
    commit: CommitDetail,
}

#[derive(Debug, Deserialize)]
struct CommitDetail {
    author: CommitAuthor,
}

#[derive(Debug, Deserialize)]
struct CommitAuthor {
    date: String,
}

/// 从compose文件内容中提取镜像标签
pub fn extract_image_tag(pattern: &str, body: &str) -> FleetResult<Option<String>> {
    let regex = Regex::new(pattern)
        .map_err(|e| FleetError::Configuration(format!("无效的镜像标签正则 {pattern}: {e}")))?;
    Ok(regex
        .captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|tag| !tag.is_empty()))
}

/// 通过GitHub API获取最新提交，通过compose文件获取镜像标签
pub struct GithubVersionSource {
    client: reqwest::Client,
    config: VersionCheckConfig,
}

impl GithubVersionSource {
    pub fn new(config: VersionCheckConfig) -> FleetResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("analysis-fleet"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| FleetError::Http(format!("创建HTTP客户端失败: {e}")))?;

        Ok(Self { client, config })
    }

    async fn get(&self, url: &str) -> FleetResult<reqwest::Response> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FleetError::Http(format!("请求 {url} 失败: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FleetError::Http(format!("请求 {url} 返回 HTTP {status}")));
        }
        Ok(response)
    }

    /// 仓库最新提交的 (sha, 作者时间)
    async fn latest_commit(&self, repo: &str) -> FleetResult<(String, String)> {
        let url = format!(
            "{}/repos/{}/commits?per_page=1",
            self.config.api_base.trim_end_matches('/'),
            repo
        );
        let commits: Vec<CommitEntry> = self
            .get(&url)
            .await?
            .json()
            .await
            .map_err(|e| FleetError::Serialization(format!("解析 {repo} 的提交列表失败: {e}")))?;

        commits
            .into_iter()
            .next()
            .map(|c| (c.sha, c.commit.author.date))
            .ok_or_else(|| FleetError::Http(format!("仓库 {repo} 没有提交记录")))
    }

    async fn image_tag(&self) -> FleetResult<Option<String>> {
        let body = self
            .get(&self.config.compose_url)
            .await?
            .text()
            .await
            .map_err(|e| FleetError::Http(format!("读取compose文件失败: {e}")))?;
        extract_image_tag(&self.config.image_pattern, &body)
    }
}

#[async_trait]
impl VersionSource for GithubVersionSource {
    async fn fetch(&self) -> FleetResult<AvailableDependencyVersion> {
        let (repo_head, _) = self.latest_commit(&self.config.repo).await?;
        let (nvd_head, nvd_time) = self.latest_commit(&self.config.nvd_repo).await?;
        let (epss_head, epss_time) = self.latest_commit(&self.config.epss_repo).await?;
        let image_tag = self.image_tag().await?;

        Ok(AvailableDependencyVersion {
            repo_head: Some(repo_head),
            image_tag,
            nvd_head: Some(nvd_head),
            nvd_time: Some(nvd_time),
            epss_head: Some(epss_head),
            epss_time: Some(epss_time),
            ..AvailableDependencyVersion::default()
        })
    }
}

pub struct VersionChecker {
    source: Arc<dyn VersionSource>,
    repos: Repositories,
    interval: Duration,
}

impl VersionChecker {
    pub fn new(source: Arc<dyn VersionSource>, repos: Repositories, interval: Duration) -> Self {
        Self {
            source,
            repos,
            interval,
        }
    }

    /// 获取最新版本并刷新所有Worker的过期标记
    pub async fn refresh(&self) -> FleetResult<AvailableDependencyVersion> {
        let mut latest = self.source.fetch().await?;

        let current = self.repos.dependencies.get_available().await?;
        latest.deb_list = current.deb_list;
        latest.updated_at = Some(Utc::now());
        self.repos.dependencies.save_available(&latest).await?;

        let workers = self.repos.workers.list().await?;
        for worker in &workers {
            let mut record = self.repos.dependencies.get_record(worker.address).await?;
            record.evaluate_outdated(&latest);
            self.repos
                .dependencies
                .save_record(worker.address, &record)
                .await?;
        }

        info!(
            "依赖版本已刷新: repo={:?}, image={:?}, 共更新 {} 个Worker的记录",
            latest.repo_head,
            latest.image_tag,
            workers.len()
        );
        Ok(latest)
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!("启动依赖版本检查，间隔 {:?}", self.interval);
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.refresh().await {
                        Ok(_) => debug!("依赖版本检查完成"),
                        Err(e) => error!("依赖版本检查失败: {}", e),
                    }
                }
                _ = shutdown.recv() => {
                    info!("收到停止信号，退出依赖版本检查");
                    break;
                }
            }
        }
    }
}
