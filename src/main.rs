use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use fleet_core::config::AppConfig;
use fleet_core::models::AnalysisTask;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

mod app;
mod shutdown;

use app::Application;
use shutdown::ShutdownManager;

/// 运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// 启动编排服务直到收到停止信号
    Service,
    /// 校验并打印生效的配置
    CheckConfig,
    /// 扫描一个配置的地址段并登记发现的Worker
    Scan,
    /// 提交一个分析并运行到它结束
    Submit,
}

#[derive(Debug, Parser)]
#[command(name = "fleet", version, about = "分布式固件分析编排系统")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    #[arg(short, long, value_enum, default_value_t = Mode::Service)]
    mode: Mode,

    /// 日志级别，未指定时使用配置文件中的值
    #[arg(short, long, value_name = "LEVEL", value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_level: Option<String>,

    /// 日志格式
    #[arg(long, value_name = "FORMAT", value_parser = ["json", "pretty"])]
    log_format: Option<String>,

    /// scan 模式扫描的配置ID
    #[arg(long, value_name = "ID", required_if_eq("mode", "scan"))]
    configuration: Option<i64>,

    /// submit 模式执行的分析命令
    #[arg(long, value_name = "CMD", required_if_eq("mode", "submit"))]
    command: Option<String>,

    /// 本地固件镜像路径
    #[arg(long, value_name = "PATH", default_value = "")]
    source: String,

    /// Worker上的目标路径
    #[arg(long, value_name = "PATH", default_value = "")]
    target: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref()).with_context(|| {
        format!(
            "加载配置失败: {}",
            cli.config.as_deref().unwrap_or("<默认路径>")
        )
    })?;

    if cli.mode == Mode::CheckConfig {
        let rendered = config.to_toml().context("序列化配置失败")?;
        println!("{rendered}");
        return Ok(());
    }

    let log_level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let log_format = cli.log_format.as_deref().unwrap_or(&config.logging.format);
    init_logging(log_level, log_format)?;

    info!("启动分布式固件分析编排系统");
    if let Some(path) = &cli.config {
        info!("配置文件: {path}");
    }

    if let Some(listen) = &config.observability.metrics_listen {
        init_metrics(listen)?;
    }

    let app = Arc::new(Application::new(config).await?);
    let shutdown_manager = ShutdownManager::new();

    match cli.mode {
        Mode::Scan => {
            let configuration = cli.configuration.context("scan 模式需要 --configuration")?;
            let found = app.scan(configuration).await?;
            for address in &found {
                println!("{address}");
            }
            info!("配置 {} 扫描完成，登记 {} 个Worker", configuration, found.len());
            return Ok(());
        }
        Mode::Submit => {
            let command = cli.command.context("submit 模式需要 --command")?;
            let task = AnalysisTask::new(Uuid::new_v4(), command, cli.source, cli.target);
            info!("提交分析 {}", task.analysis_id);
            tokio::select! {
                result = app.run_task(task, &shutdown_manager) => result?,
                _ = wait_for_shutdown_signal() => {
                    warn!("分析结束前收到关闭信号，停止等待");
                    shutdown_manager.shutdown().await;
                }
            }
            return Ok(());
        }
        Mode::Service | Mode::CheckConfig => {}
    }

    let app_handle = {
        let shutdown_rx = shutdown_manager.subscribe().await;
        let app = Arc::clone(&app);
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("应用运行失败: {e:#}");
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown().await;

    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(Ok(())) => info!("应用已优雅关闭"),
        Ok(Err(e)) => error!("应用关闭时发生错误: {e}"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    info!("分布式固件分析编排系统已退出");
    Ok(())
}

/// 初始化日志系统
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("初始化JSON日志格式失败")?,
        "pretty" => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .context("初始化Pretty日志格式失败")?,
        other => return Err(anyhow::anyhow!("不支持的日志格式: {other}")),
    }

    Ok(())
}

/// 启动Prometheus指标导出
fn init_metrics(listen: &str) -> Result<()> {
    let address: SocketAddr = listen
        .parse()
        .with_context(|| format!("无效的指标监听地址: {listen}"))?;

    PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .context("启动Prometheus指标导出失败")?;

    info!("Prometheus指标导出监听于 {address}");
    Ok(())
}

/// 等待关闭信号
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}
