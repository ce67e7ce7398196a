//! SFTP Server Binary
//!
//! Run with: cargo run --bin burrow-sftp-server -- --root /srv/data --user alice
//!
//! Every flag can also be given through its `SFTP_*` environment variable;
//! flags and variables override values from `--config`.

use burrow_sftp::{Config, LogFormat, LoggingConfig, Secret, Server};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(short, long, env = "SFTP_BIND_ADDRESS")]
    bind: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "SFTP_PORT")]
    port: Option<u16>,

    /// Root directory every session is confined to
    #[arg(short, long, env = "SFTP_DATA_ROOT")]
    root: Option<PathBuf>,

    /// Host key path (an ephemeral key is generated when absent)
    #[arg(long, env = "SFTP_KEY_FILE")]
    host_key: Option<PathBuf>,

    /// Accepted username
    #[arg(short, long, env = "SFTP_USER")]
    user: Option<String>,

    /// Password for the accepted username
    #[arg(long, env = "SFTP_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Debug logging
    #[arg(short, long, env = "SFTP_DEBUG")]
    debug: bool,

    /// Log format (json or text)
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Log file path
    #[arg(long, env = "SFTP_LOG_FILE")]
    log_file: Option<PathBuf>,
}

impl Args {
    /// Layer command line and environment values over `config`
    fn apply(self, config: &mut Config) {
        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(root) = self.root {
            config.root_dir = root;
        }
        if let Some(host_key) = self.host_key {
            config.host_key_path = Some(host_key);
        }
        if let Some(user) = self.user {
            config.username = user;
        }
        if let Some(password) = self.password {
            config.password = Secret::from(password);
        }
        if let Some(log_format) = self.log_format {
            config.logging.format = log_format;
        }
        if let Some(log_file) = self.log_file {
            config.logging.file = Some(log_file);
        }
        if self.debug {
            config.logging.level = "debug".to_string();
        }
    }
}

/// Install the global subscriber; the guard must live as long as `main`
fn init_logging(logging: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = || EnvFilter::new(&logging.level);

    let file_target = logging.file.as_ref().and_then(|log_file| {
        let directory = log_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = log_file.file_name()?;
        if let Err(e) = std::fs::create_dir_all(directory) {
            eprintln!("Warning: Failed to create log directory: {e}");
            eprintln!("Falling back to stderr logging");
            return None;
        }
        Some((directory.to_path_buf(), file_name.to_os_string()))
    });

    if let Some((directory, file_name)) = file_target {
        let file_appender = tracing_appender::rolling::daily(directory, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        match logging.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter())
                .with_writer(non_blocking)
                .with_current_span(true)
                .with_span_list(true)
                .init(),
            LogFormat::Text => tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(non_blocking)
                .init(),
        }
        return Some(guard);
    }

    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter())
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .with_span_list(true)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_writer(std::io::stderr)
            .init(),
    }
    None
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::from_file(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load config: {e}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    args.apply(&mut config);

    let _log_guard = init_logging(&config.logging);

    info!(
        event = "server_starting",
        version = env!("CARGO_PKG_VERSION"),
        "Starting Burrow SFTP Server"
    );

    // Password is masked by Secret's Debug impl
    info!(
        event = "server_configuration",
        bind_address = %config.bind_address,
        port = config.port,
        root_dir = ?config.root_dir,
        host_key = ?config.host_key_path,
        username = %config.username,
        password = ?config.password,
        timeout_secs = config.timeout,
        max_handles = config.max_handles,
        log_format = ?config.logging.format,
        log_file = ?config.logging.file,
        "SFTP Server Configuration"
    );

    let server = match Server::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!(
                event = "server_creation_failed",
                error = %e,
                "Failed to create server"
            );
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!(
            event = "server_error",
            error = %e,
            "Server encountered an error"
        );
        std::process::exit(1);
    }

    info!(event = "server_shutdown", "SFTP server shutdown complete");
}
