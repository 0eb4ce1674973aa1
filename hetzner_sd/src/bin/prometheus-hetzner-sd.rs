use std::{
    env, io,
    path::{Path, PathBuf},
    process::ExitCode,
    str::FromStr,
};

use clap::{ArgAction, Args, Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusHandle;
use prometheus_hetzner_sd::{
    config::{self, Config, DEFAULT_ENDPOINT},
    discovery, web,
};
use tokio::{
    runtime::Builder,
    signal,
    time::Duration,
};
use tracing::{debug, error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

const ENV_FILE_VAR: &str = "PROMETHEUS_HETZNER_ENV_FILE";
const MAX_SHUTDOWN_DELAY: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("Failed to read config: {0}")]
    ReadConfig(config::Error),
    #[error(transparent)]
    Config(#[from] config::Error),
    #[error("Discovery failed: {0}")]
    Discovery(#[from] discovery::Error),
    #[error("Metrics server failed: {0}")]
    Web(#[from] web::Error),
    #[error("Could not join the spawned {0} task: {1}")]
    Join(&'static str, tokio::task::JoinError),
}

#[derive(Parser, Debug)]
#[command(
    name = "prometheus-hetzner-sd",
    version,
    about = "Prometheus Hetzner SD",
    disable_version_flag = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
struct Cli {
    /// Only log messages with given severity
    #[arg(
        long = "log.level",
        env = "PROMETHEUS_HETZNER_LOG_LEVEL",
        default_value = "info",
        global = true
    )]
    log_level: String,
    /// Enable pretty messages for logging
    #[arg(long = "log.pretty", env = "PROMETHEUS_HETZNER_LOG_PRETTY", global = true)]
    log_pretty: bool,
    /// Print the current version of that tool
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: Option<bool>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start integrated server
    Server(ServerArgs),
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Address to bind the metrics server
    #[arg(
        long = "web.address",
        env = "PROMETHEUS_HETZNER_WEB_ADDRESS",
        default_value = "0.0.0.0:9000"
    )]
    web_address: String,
    /// Path to bind the metrics server
    #[arg(
        long = "web.path",
        env = "PROMETHEUS_HETZNER_WEB_PATH",
        default_value = "/metrics"
    )]
    web_path: String,
    /// Path to write the `file_sd` config
    #[arg(
        long = "output.file",
        env = "PROMETHEUS_HETZNER_OUTPUT_FILE",
        default_value = "/etc/prometheus/hetzner.json"
    )]
    output_file: PathBuf,
    /// Discovery refresh interval in seconds
    #[arg(
        long = "output.refresh",
        env = "PROMETHEUS_HETZNER_OUTPUT_REFRESH",
        default_value_t = 30
    )]
    output_refresh: u64,
    /// Username for the Hetzner API
    #[arg(long = "hetzner.username", env = "PROMETHEUS_HETZNER_USERNAME")]
    username: Option<String>,
    /// Password for the Hetzner API
    #[arg(
        long = "hetzner.password",
        env = "PROMETHEUS_HETZNER_PASSWORD",
        hide_env_values = true
    )]
    password: Option<String>,
    /// Path to Hetzner configuration file
    #[arg(long = "hetzner.config", env = "PROMETHEUS_HETZNER_CONFIG")]
    config: Option<PathBuf>,
    /// Base URL of the Hetzner Robot webservice
    #[arg(
        long = "hetzner.endpoint",
        env = "PROMETHEUS_HETZNER_ENDPOINT",
        default_value = DEFAULT_ENDPOINT,
        hide = true
    )]
    endpoint: String,
}

/// The filter for `level`, `info` if the level is unknown.
fn log_level(level: &str) -> LevelFilter {
    LevelFilter::from_str(level).unwrap_or(LevelFilter::INFO)
}

/// Load variables from the dotenv file at `path`. Variables already set in
/// the environment take precedence.
fn load_env_file(path: &Path) -> Result<(), dotenvy::Error> {
    dotenvy::from_path(path)
}

fn setup_logger(logs: &config::Logs) {
    let level = log_level(&logs.level);
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logs.pretty {
        builder.with_ansi(true).finish().init();
    } else {
        builder.json().with_ansi(false).finish().init();
    }
}

fn build_config(logs: config::Logs, args: ServerArgs) -> Result<Config, Error> {
    let mut config = Config {
        server: config::Server {
            addr: args.web_address,
            path: args.web_path,
        },
        logs,
        target: config::Target {
            file: args.output_file,
            refresh: args.output_refresh,
            endpoint: args.endpoint,
            credentials: Vec::new(),
        },
    };

    if let Some(path) = &args.config {
        debug!("Reading config file at: {}", path.display());
        let file = config::load_file(path).map_err(Error::ReadConfig)?;
        config.merge_file(file);
    }

    config.validate_output()?;
    config.add_cli_credential(args.username, args.password)?;
    config.validate()?;
    Ok(config)
}

async fn termination() -> io::Result<()> {
    #[cfg(unix)]
    {
        let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = signal::ctrl_c() => res,
            _ = term.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await
    }
}

async fn inner_main(config: Config, handle: PrometheusHandle) -> Result<(), Error> {
    let (shutdown_watcher, shutdown_broadcast) = hetzner_sd_signal::signal();

    let discovery_server = discovery::Server::new(&config.target, shutdown_watcher.clone())?;
    let web_server = web::Server::new(&config.server, handle, shutdown_watcher.clone());

    // Any watcher left alive here would block `signal_and_wait` below.
    drop(shutdown_watcher);

    let mut dsrv = tokio::spawn(discovery_server.run());
    let mut wsrv = tokio::spawn(web_server.run());

    let res = tokio::select! {
        res = termination() => {
            info!("received termination signal");
            res.map_err(Error::from)
        }
        res = &mut dsrv => match res {
            Ok(discovery_result) => discovery_result.map_err(Error::from),
            Err(err) => Err(Error::Join("discovery", err)),
        },
        res = &mut wsrv => match res {
            Ok(web_result) => web_result.map_err(Error::from),
            Err(err) => Err(Error::Join("web", err)),
        },
    };

    if let Err(ref err) = res {
        error!("Shutting down after error: {err}");
    }
    shutdown_broadcast.signal_and_wait().await;
    res
}

fn main() -> ExitCode {
    // Loaded before parsing so the file can provide flag values.
    let env_file = env::var_os(ENV_FILE_VAR).map(|path| {
        let path = PathBuf::from(path);
        let res = load_env_file(&path);
        (path, res)
    });

    let cli = Cli::parse();
    let logs = config::Logs {
        level: cli.log_level,
        pretty: cli.log_pretty,
    };
    setup_logger(&logs);

    if LevelFilter::from_str(&logs.level).is_err() {
        warn!("Unknown log level {level:?}, using info", level = logs.level);
    }
    if let Some((path, Err(err))) = &env_file {
        warn!("Failed to load env file {}: {err}", path.display());
    }

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting prometheus-hetzner-sd {version}.");

    let Commands::Server(args) = cli.command;
    let config = match build_config(logs, args) {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let handle = match web::install_recorder() {
        Ok(handle) => handle,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match Builder::new_multi_thread().enable_io().enable_time().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("Failed to build runtime: {err}");
            return ExitCode::FAILURE;
        }
    };
    let res = runtime.block_on(inner_main(config, handle));
    runtime.shutdown_timeout(MAX_SHUTDOWN_DELAY);

    match res {
        Ok(()) => {
            info!("Bye. :)");
            ExitCode::SUCCESS
        }
        Err(_) => ExitCode::FAILURE,
    }
}
