use clap::{Parser, Subcommand};
use ftp_transfer_lib::config::TransferConfig;
use ftp_transfer_lib::core::{FileFilter, JsonReportSink, LogReportSink, ReportSink, RunStatus};
use ftp_transfer_lib::logging::{LogConfig, SizeRotatingWriter};
use ftp_transfer_lib::TransferOrchestrator;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const EXIT_FAILED: u8 = 1;
const EXIT_CONNECTION: u8 = 2;
const EXIT_CONFIG: u8 = 3;

#[derive(Parser, Debug)]
#[command(
    name = "ftp-transfer",
    version,
    about = "Move files between FTP / FTPS / SFTP servers with filtering, collision handling and archiving"
)]
struct Args {
    /// JSON configuration file
    #[arg(short = 'c', long = "config", value_name = "PATH", default_value = "config.json")]
    config: PathBuf,

    /// Also write the final report as JSON
    #[arg(long, value_name = "PATH", global = true)]
    report_json: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, Default)]
enum Command {
    /// Run the transfer (default)
    #[default]
    Run,
    /// Validate the configuration and print the resolved filter
    Check,
}

/// 初始化日志系统：控制台始终输出，文件日志按配置开启
fn init_logging(config: &LogConfig) {
    let mut env_filter = EnvFilter::from_default_env().add_directive(config.tracing_level().into());
    for directive in ["suppaftp=warn", "ssh2=warn"] {
        if let Ok(d) = directive.parse() {
            env_filter = env_filter.add_directive(d);
        }
    }

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let file_layer = if config.enabled {
        match SizeRotatingWriter::new(Path::new(&config.directory), config.max_size_mb) {
            Ok(writer) => Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false),
            ),
            Err(e) => {
                eprintln!("无法创建日志文件 {}: {}", config.directory, e);
                None
            }
        }
    } else {
        None
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn exit_code(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Success | RunStatus::PartialSuccess | RunStatus::Cancelled => ExitCode::SUCCESS,
        RunStatus::AllFailed | RunStatus::FailureThresholdExceeded => ExitCode::from(EXIT_FAILED),
        RunStatus::ConnectionError => ExitCode::from(EXIT_CONNECTION),
    }
}

fn check(config: &TransferConfig) -> anyhow::Result<()> {
    let filter = FileFilter::new(&config.filter, config.clock.now())?;
    println!("配置有效");
    println!(
        "  源:   {:?} {}:{} {}",
        config.source.protocol,
        config.source.host,
        config.source.effective_port(),
        config.source.directory
    );
    println!(
        "  目标: {:?} {}:{} {}",
        config.destination.protocol,
        config.destination.host,
        config.destination.effective_port(),
        config.destination.directory
    );
    println!("  过滤: {}", filter);
    println!("  冲突策略: {:?}", config.collision);
    Ok(())
}

async fn run(config: TransferConfig, report_json: Option<PathBuf>) -> anyhow::Result<RunStatus> {
    let threshold = config.failure_threshold;
    let orchestrator = TransferOrchestrator::new(config);

    let cancel = orchestrator.cancel_flag();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::error!("无法监听 Ctrl+C");
            return;
        }
        tracing::warn!("收到 Ctrl+C，当前文件完成后停止");
        cancel.store(true, Ordering::SeqCst);
    });

    let result = orchestrator.run().await;
    ctrl_c.abort();
    let report = result?;

    let mut sinks: Vec<Box<dyn ReportSink>> = vec![Box::new(LogReportSink::new(threshold))];
    if let Some(path) = report_json {
        sinks.push(Box::new(JsonReportSink::new(path)));
    }
    for sink in &sinks {
        if let Err(e) = sink.deliver(&report) {
            tracing::error!("投递报告失败: {}", e);
        }
    }

    Ok(report.classify(threshold))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match TransferConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{:#}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match args.command.unwrap_or_default() {
        Command::Check => match check(&config) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("{:#}", e);
                ExitCode::from(EXIT_CONFIG)
            }
        },
        Command::Run => {
            init_logging(&config.log);
            match run(config, args.report_json).await {
                Ok(status) => exit_code(status),
                Err(e) => {
                    tracing::error!("{:#}", e);
                    ExitCode::from(EXIT_CONFIG)
                }
            }
        }
    }
}
