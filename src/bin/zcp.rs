use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use zcp::config::Config;
use zcp::poll::Scheduler;

/// Forward Ceilometer metrics to Zabbix.
#[derive(Parser, Debug)]
#[command(name = "zcp", version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(
        long,
        short = 'c',
        env = "ZCP_CONFIG",
        default_value = "/etc/zcp/zcp.yaml",
        value_name = "PATH"
    )]
    config: PathBuf,

    /// Run a single poll cycle and exit.
    #[arg(long)]
    once: bool,

    /// Overrides the configured log level.
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("zcp: {}", e);
            return ExitCode::from(1);
        }
    };

    let level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.poll.log_level)
        .to_string();
    let log_file = config.poll.log_file.as_deref().map(Path::new);
    let _log_guard = match zcp::logging::init(&level, log_file) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("zcp: {}", e);
            return ExitCode::from(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "zcp starting"
    );

    let cycle = match zcp::build_cycle(&config).await {
        Ok(cycle) => cycle,
        Err(e) => {
            error!(error = %e, "startup failed");
            return ExitCode::from(1);
        }
    };

    if cli.once {
        return match cycle.run_cycle().await {
            Ok(report) => {
                info!(?report, "single cycle finished");
                ExitCode::SUCCESS
            }
            Err(e) if e.is_process_fatal() => {
                error!(error = %e, "fatal error");
                ExitCode::from(2)
            }
            Err(e) => {
                error!(error = %e, "poll cycle aborted");
                ExitCode::from(1)
            }
        };
    }

    let scheduler = Scheduler::new(
        Arc::new(cycle),
        config.poll.polling_interval,
        config.poll.overlap_policy(),
    );
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    match scheduler.run_until(shutdown).await {
        Ok(()) => {
            info!("zcp stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "zcp stopping on fatal error");
            ExitCode::from(2)
        }
    }
}
