use anyhow::{Context, Result};
use clap::{Arg, Command};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use orchestrator_core::AppConfig;

mod app;
mod shutdown;

use app::Application;
use shutdown::ShutdownManager;

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let matches = Command::new("orchestrator")
        .version("1.0.0")
        .about("设备集群主从任务编排系统")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径")
                .default_value("config/orchestrator.toml"),
        )
        .arg(
            Arg::new("agents")
                .short('a')
                .long("agents")
                .value_name("N")
                .help("模拟Slave节点数量")
                .default_value("5"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .default_value("info"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"])
                .default_value("pretty"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").unwrap();
    let agent_count: usize = matches
        .get_one::<String>("agents")
        .unwrap()
        .parse()
        .context("agents参数必须是正整数")?;
    let log_level = matches.get_one::<String>("log-level").unwrap();
    let log_format = matches.get_one::<String>("log-format").unwrap();

    init_logging(log_level, log_format)?;

    info!("启动设备集群编排系统");
    info!("配置文件: {config_path}");

    let config = AppConfig::load(Some(config_path)).context("加载配置失败")?;
    let application = Application::new(config, agent_count).await?;

    let shutdown = ShutdownManager::new();

    let run = application.run(&shutdown);
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => result?,
        _ = signal::ctrl_c() => {
            info!("收到Ctrl+C，开始优雅关闭");
            shutdown.shutdown().await;
            run.await?;
        }
    }

    info!("编排系统已退出");
    Ok(())
}

fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("orchestrator={level},orchestrator_core={level},orchestrator_domain={level},orchestrator_infrastructure={level},orchestrator_master={level},orchestrator_slave={level}")));

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志失败")?;
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()
                .context("初始化日志失败")?;
        }
    }
    Ok(())
}
