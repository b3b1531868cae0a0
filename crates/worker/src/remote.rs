//! 远程Worker操作
//!
//! 所有操作都通过 [`RemoteSession`] 执行。探测类命令的非零退出码本身就是结果
//! （文件不存在、进程已退出），其余命令失败时返回带退出码和命令文本的错误，
//! 由调用方决定是标记Worker为 ERROR 还是仅记录日志。

use std::collections::BTreeMap;
use std::path::Path;

use regex::Regex;
use tracing::{debug, info, warn};

use fleet_core::config::RemoteConfig;
use fleet_core::models::{
    parse_deb_list, AnalysisStatus, AnalysisTask, DependencyKind, DependencyVersionRecord,
};
use fleet_core::shell::{privileged, quote};
use fleet_core::traits::RemoteSession;
use fleet_core::{FleetError, FleetResult};

/// 依赖包与安装目录所在的根目录
const DEPENDENCY_ROOT: &str = "/root";
/// 分析日志目录中的主日志文件
const ANALYSIS_LOG_NAME: &str = "emba.log";
const HEAD_META_PATTERN: &str = r"(latest|[0-9a-f]{40})\s(N/A|.*\s\+[0-9]{4})";

/// Worker上的路径布局
#[derive(Debug, Clone)]
pub struct RemotePaths {
    pub firmware_dir: String,
    pub analysis_log_dir: String,
    pub install_root: String,
    pub run_log: String,
    pub completion_marker: String,
}

impl RemotePaths {
    pub fn from_config(config: &RemoteConfig) -> Self {
        Self {
            firmware_dir: config.firmware_dir.clone(),
            analysis_log_dir: config.analysis_log_dir.clone(),
            install_root: config.install_root.clone(),
            run_log: config.run_log.clone(),
            completion_marker: config.completion_marker.clone(),
        }
    }

    pub fn analysis_log_file(&self) -> String {
        format!("{}/{}", self.analysis_log_dir, ANALYSIS_LOG_NAME)
    }

    pub fn run_log_path(&self, session: &dyn RemoteSession) -> String {
        format!("{}/{}", home_dir(session), self.run_log)
    }
}

impl Default for RemotePaths {
    fn default() -> Self {
        Self::from_config(&RemoteConfig::default())
    }
}

/// 登录用户的主目录
pub fn home_dir(session: &dyn RemoteSession) -> String {
    if session.is_root() {
        "/root".to_string()
    } else {
        format!("/home/{}", session.user())
    }
}

pub fn dependency_folder(kind: DependencyKind) -> String {
    format!("{}/{}", DEPENDENCY_ROOT, kind.folder_name())
}

pub fn dependency_archive(kind: DependencyKind) -> String {
    format!("{}/{}", DEPENDENCY_ROOT, kind.archive_name())
}

fn sudo(session: &dyn RemoteSession, command: &str) -> String {
    privileged(command, session.is_root())
}

/// 以特权 `sh -c` 执行一段脚本
fn sudo_sh(session: &dyn RemoteSession, script: &str) -> String {
    sudo(session, &format!("sh -c {}", quote(script)))
}

/// 上传到用户可写位置，必要时再以特权移动到目标路径
async fn upload_privileged(
    session: &dyn RemoteSession,
    local: &Path,
    target: &str,
    staging_name: &str,
) -> FleetResult<()> {
    if session.is_root() {
        return session.put_file(local, target).await;
    }

    let staging = format!("{}/{}", home_dir(session), staging_name);
    session.put_file(local, &staging).await?;
    session
        .exec(&sudo(session, &format!("mv {} {}", quote(&staging), quote(target))))
        .await?;
    Ok(())
}

/// 上传固件并在后台启动分析，返回远程进程ID
pub async fn start_analysis(
    session: &dyn RemoteSession,
    task: &AnalysisTask,
    paths: &RemotePaths,
) -> FleetResult<u32> {
    let address = session.address();
    info!("[{}] 开始分析 {}", address, task.analysis_id);

    let firmware_dir = quote(&paths.firmware_dir);
    session
        .exec(&sudo(session, &format!("rm -rf {firmware_dir}")))
        .await?;
    session
        .exec(&sudo(session, &format!("mkdir -p {firmware_dir}")))
        .await?;

    upload_privileged(
        session,
        Path::new(&task.source_path),
        &task.target_path,
        "firmware_upload",
    )
    .await?;

    let run_log = paths.run_log_path(session);
    session
        .exec(&sudo(
            session,
            &format!("rm -rf {}", quote(&paths.analysis_log_dir)),
        ))
        .await?;
    session
        .exec(&sudo(session, &format!("rm -f {}", quote(&run_log))))
        .await?;

    let launch = format!(
        "nohup {} > {} 2>&1 & echo $!",
        sudo(session, &format!("sh -c {}", quote(&task.command))),
        quote(&run_log)
    );
    let output = session.exec(&launch).await?;
    let pid = output.trim().parse::<u32>().map_err(|_| {
        FleetError::Internal(format!("无法解析分析进程ID: {:?}", output.trim()))
    })?;

    info!("[{}] 分析 {} 已启动, pid={}", address, task.analysis_id, pid);
    Ok(pid)
}

/// 探测分析是否仍在运行
///
/// 日志中出现结束标记，或记录的进程已不存在，均视为 `Unassigned`。
/// 通道本身的错误原样返回，调用方应视为"未知"而非"已结束"。
pub async fn probe_analysis(
    session: &dyn RemoteSession,
    pid: Option<u32>,
    paths: &RemotePaths,
) -> FleetResult<AnalysisStatus> {
    let address = session.address();

    let marker_check = sudo(
        session,
        &format!(
            "grep -qF {} {}",
            quote(&paths.completion_marker),
            quote(&paths.analysis_log_file())
        ),
    );
    match session.exec(&marker_check).await {
        Ok(_) => {
            debug!("[{}] 分析日志中已出现结束标记", address);
            return Ok(AnalysisStatus::Unassigned);
        }
        Err(FleetError::NonZeroExit { .. }) => {
            debug!("[{}] 分析日志中未发现结束标记", address);
        }
        Err(e) => return Err(e),
    }

    match pid {
        Some(pid) => match session.exec(&sudo(session, &format!("kill -0 {pid}"))).await {
            Ok(_) => Ok(AnalysisStatus::Running),
            Err(FleetError::NonZeroExit { .. }) => {
                debug!("[{}] 分析进程 {} 已退出", address, pid);
                Ok(AnalysisStatus::Unassigned)
            }
            Err(e) => Err(e),
        },
        None => {
            let output = session
                .exec(&sudo_sh(session, "docker ps | grep emba || true"))
                .await?;
            if output.trim().is_empty() {
                debug!("[{}] 未找到分析容器", address);
                Ok(AnalysisStatus::Unassigned)
            } else {
                Ok(AnalysisStatus::Running)
            }
        }
    }
}

/// 尽力终止远程分析进程及其容器
pub async fn stop_analysis(session: &dyn RemoteSession, pid: Option<u32>) -> FleetResult<()> {
    if let Some(pid) = pid {
        session
            .exec(&sudo_sh(session, &format!("kill {pid} || true")))
            .await?;
    }
    session
        .exec(&sudo_sh(
            session,
            "docker ps | grep emba | awk '{print $1}' | xargs -r docker stop || true",
        ))
        .await?;
    info!("[{}] 已停止分析", session.address());
    Ok(())
}

/// 软重置：停止分析并清理日志、固件目录和运行日志
pub async fn soft_reset(
    session: &dyn RemoteSession,
    pid: Option<u32>,
    paths: &RemotePaths,
) -> FleetResult<()> {
    stop_analysis(session, pid).await?;

    session
        .exec(&sudo_sh(
            session,
            "docker ps -aq | xargs -r docker stop | xargs -r docker rm || true",
        ))
        .await?;
    for path in [
        paths.analysis_log_dir.clone(),
        paths.firmware_dir.clone(),
        paths.run_log_path(session),
    ] {
        session
            .exec(&sudo(session, &format!("rm -rf {}", quote(&path))))
            .await?;
    }

    info!("[{}] 软重置完成", session.address());
    Ok(())
}

/// 硬重置：软重置后运行卸载脚本
pub async fn hard_reset_remote(
    session: &dyn RemoteSession,
    pid: Option<u32>,
    paths: &RemotePaths,
) -> FleetResult<()> {
    soft_reset(session, pid, paths).await?;

    let uninstaller = format!("{}/full_uninstaller.sh", paths.install_root);
    session
        .exec(&sudo(session, &format!("bash {}", quote(&uninstaller))))
        .await?;

    info!("[{}] 硬重置完成", session.address());
    Ok(())
}

fn parse_os_release(output: &str) -> String {
    output
        .trim()
        .trim_start_matches("PRETTY_NAME=")
        .trim_matches('"')
        .to_string()
}

fn parse_free(output: &str) -> FleetResult<String> {
    output
        .split_whitespace()
        .nth(1)
        .map(|total| total.replace("Gi", "GB").replace("Mi", "MB"))
        .ok_or_else(|| FleetError::Internal(format!("无法解析内存信息: {output:?}")))
}

fn parse_df(output: &str) -> FleetResult<String> {
    let columns: Vec<&str> = output
        .lines()
        .next()
        .map(|line| line.split_whitespace().collect())
        .unwrap_or_default();
    if columns.len() < 4 {
        return Err(FleetError::Internal(format!("无法解析磁盘信息: {output:?}")));
    }

    let size = |value: &str| value.replace('G', "GB").replace('M', "MB");
    Ok(format!(
        "Free: {}  Total: {}",
        size(columns[3]),
        size(columns[1])
    ))
}

/// 确认会话用户可以免交互使用 sudo，root 直接通过
pub async fn check_privileges(session: &dyn RemoteSession) -> FleetResult<()> {
    if session.is_root() {
        return Ok(());
    }
    session.exec("sudo -n true").await.map(|_| ())
}

/// 采集系统信息快照
pub async fn fetch_system_info(session: &dyn RemoteSession) -> FleetResult<BTreeMap<String, String>> {
    let os = session.exec("grep PRETTY_NAME /etc/os-release").await?;
    let cpu = session.exec("nproc").await?;
    let ram = session.exec("free -h | grep Mem").await?;
    let disk = session.exec("df -h | grep '^/'").await?;

    let mut info = BTreeMap::new();
    info.insert("os_info".to_string(), parse_os_release(&os));
    info.insert("cpu_info".to_string(), format!("{} cores", cpu.trim()));
    info.insert("ram_info".to_string(), parse_free(&ram)?);
    info.insert("disk_info".to_string(), parse_df(&disk)?);
    Ok(info)
}

/// 解析 `git-head-meta` 文件，返回 (提交, 时间)
pub fn parse_head_meta(content: &str) -> FleetResult<(Option<String>, Option<String>)> {
    let pattern = Regex::new(HEAD_META_PATTERN)
        .map_err(|e| FleetError::Internal(format!("编译提交信息匹配规则失败: {e}")))?;

    Ok(match pattern.captures(content.trim()) {
        Some(captures) => {
            let head = captures.get(1).map(|m| m.as_str().to_string());
            let time = captures
                .get(2)
                .map(|m| m.as_str())
                .filter(|t| *t != "N/A")
                .map(str::to_string);
            (head, time)
        }
        None => (None, None),
    })
}

/// 从compose文件中取出镜像标签，镜像引用不带标签时返回 `None`
pub fn parse_image_tag(compose: &str) -> Option<String> {
    let line = compose.lines().find(|line| line.contains("image:"))?;
    let (_, reference) = line.split_once("image:")?;
    let reference = reference.trim().trim_matches(|c| c == '"' || c == '\'');
    // 仓库地址中的端口号也带冒号，标签只能出现在最后一段路径里
    let name = reference.rsplit('/').next()?;
    let (_, tag) = name.rsplit_once(':')?;
    let tag = tag.split('@').next().unwrap_or(tag).trim();
    (!tag.is_empty()).then(|| tag.to_string())
}

async fn read_if_exists(session: &dyn RemoteSession, path: &str) -> FleetResult<String> {
    let path = quote(path);
    session
        .exec(&sudo_sh(
            session,
            &format!("if test -f {path}; then cat {path}; fi"),
        ))
        .await
}

/// 读取Worker上已安装的依赖版本
///
/// 只填充安装标记，过期标记由调用方根据可用版本重新计算。
pub async fn read_installed_versions(
    session: &dyn RemoteSession,
    paths: &RemotePaths,
) -> FleetResult<DependencyVersionRecord> {
    let root = &paths.install_root;
    let mut record = DependencyVersionRecord::default();

    let compose = read_if_exists(session, &format!("{root}/docker-compose.yml")).await?;
    record.image_tag = parse_image_tag(&compose);

    let meta = read_if_exists(session, &format!("{root}/git-head-meta")).await?;
    record.repo_head = parse_head_meta(&meta)?.0;

    let meta = read_if_exists(
        session,
        &format!("{root}/external/nvd-json-data-feeds/git-head-meta"),
    )
    .await?;
    (record.nvd_head, record.nvd_time) = parse_head_meta(&meta)?;

    let meta = read_if_exists(session, &format!("{root}/external/EPSS-data/git-head-meta")).await?;
    (record.epss_head, record.epss_time) = parse_head_meta(&meta)?;

    let pkg_dir = quote(&format!("{}/pkg", dependency_folder(DependencyKind::Deps)));
    let deb_output = session
        .exec(&sudo_sh(
            session,
            &format!("if test -d {pkg_dir}; then cd {pkg_dir} && sha256sum *.deb; fi"),
        ))
        .await?;
    record.deb_list = parse_deb_list(&deb_output)?;

    debug!(
        "[{}] 已安装版本: repo={:?}, image={:?}, nvd={:?}, epss={:?}, debs={}",
        session.address(),
        record.repo_head,
        record.image_tag,
        record.nvd_head,
        record.epss_head,
        record.deb_list.len()
    );
    Ok(record)
}

/// 将本地打包好的依赖上传到Worker
pub async fn copy_dependency(
    session: &dyn RemoteSession,
    kind: DependencyKind,
    local_archive: &Path,
) -> FleetResult<()> {
    let archive = dependency_archive(kind);
    let folder = dependency_folder(kind);

    session
        .exec(&sudo_sh(
            session,
            &format!("rm -f {}; rm -rf {}", quote(&archive), quote(&folder)),
        ))
        .await?;
    upload_privileged(session, local_archive, &archive, &kind.archive_name()).await?;

    info!("[{}] 已上传依赖 {}", session.address(), kind);
    Ok(())
}

/// 解包并运行依赖自带的安装脚本
pub async fn install_dependency(session: &dyn RemoteSession, kind: DependencyKind) -> FleetResult<()> {
    let archive = quote(&dependency_archive(kind));
    let folder = dependency_folder(kind);
    let quoted_folder = quote(&folder);

    session
        .exec(&sudo(session, &format!("rm -rf {quoted_folder}")))
        .await?;
    session
        .exec(&sudo_sh(
            session,
            &format!(
                "mkdir {quoted_folder} && tar xzf {archive} -C {quoted_folder} >/dev/null 2>&1"
            ),
        ))
        .await?;

    let install = format!("{folder}/installer.sh > {folder}/installer.log 2>&1");
    if let Err(e) = session.exec(&sudo_sh(session, &install)).await {
        warn!(
            "[{}] 依赖 {} 安装脚本失败，日志见 {}/installer.log",
            session.address(),
            kind,
            folder
        );
        return Err(e);
    }

    info!("[{}] 已安装依赖 {}", session.address(), kind);
    Ok(())
}
