mod coordinator;
mod hook_uds;
mod hub_lock;
#[cfg(test)]
mod test_support;

use clap::Parser;
use coordinator::{Coordinator, CoordinatorConfig};
use hub_lock::HubLock;
use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tabsignal_core::config::{
    config_path, env_true, load_config, lock_path_for, resolve_log_dir, resolve_log_level,
    resolve_socket_path, ConfigError, TabSignalConfig, HUB_DEBUG_ENV,
};
use tabsignal_kitty::KittyRemote;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const LOG_FILE_NAME: &str = "tabsignal-hub.log";
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
struct Config {
    socket_path: PathBuf,
    log_dir: PathBuf,
    debug: bool,
    settings: TabSignalConfig,
    config_error: Option<ConfigError>,
}

#[derive(Parser, Debug)]
#[command(name = "tabsignal-hub", about = "Tab color signal hub for kitty")]
struct Args {
    #[arg(long, default_value = "")]
    socket: String,
    #[arg(long, default_value = "")]
    config: String,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let config = load_hub_config();
    let _log_guard = init_logging(&config);
    if let Some(err) = &config.config_error {
        warn!(event = "config_error", error = %err);
    }

    let lock_path = lock_path_for(&config.socket_path);
    let _hub_lock = match HubLock::try_acquire(&lock_path, &config.socket_path) {
        Ok(Some(lock)) => lock,
        Ok(None) => {
            info!(event = "hub_already_running", lock = %lock_path.display());
            return;
        }
        Err(err) => {
            error!(event = "hub_lock_error", lock = %lock_path.display(), error = %err);
            return;
        }
    };

    let settings = &config.settings;
    let terminal =
        KittyRemote::new(settings.kitten_bin.clone(), settings.command_timeout()).handle();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let coordinator = Coordinator::new(
        CoordinatorConfig::from_config(settings),
        terminal,
        shutdown_rx.clone(),
    );

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    info!(
        event = "hub_start",
        pid = std::process::id(),
        socket = %config.socket_path.display(),
        poll_interval_ms = settings.poll_interval_ms,
        poll_max_cycles = settings.poll_max_cycles
    );

    let uds_config = hook_uds::HookUdsConfig {
        socket_path: config.socket_path.clone(),
        write_timeout: WRITE_TIMEOUT,
        idle_exit: settings.hub_idle_exit(),
    };
    if let Err(err) = hook_uds::run(uds_config, coordinator, shutdown_rx).await {
        error!(event = "hub_error", error = %err);
    }
    info!(event = "hub_stop");
}

fn load_hub_config() -> Config {
    let args = Args::parse();
    let path = if args.config.trim().is_empty() {
        config_path()
    } else {
        PathBuf::from(&args.config)
    };
    let (settings, config_error) = match load_config(&path) {
        Ok(settings) => (settings, None),
        Err(err) => (TabSignalConfig::default(), Some(err)),
    };
    Config {
        socket_path: resolve_socket_path(&args.socket),
        log_dir: resolve_log_dir(&args.log_dir),
        debug: args.debug || env_true(HUB_DEBUG_ENV),
        settings,
        config_error,
    }
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = resolve_log_level(config.debug);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &Path) -> io::Result<LogGuard> {
    if log_dir.as_os_str().is_empty() {
        return Ok(LogGuard { file: None });
    }
    if std::fs::create_dir_all(log_dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(LOG_FILE_NAME))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}
