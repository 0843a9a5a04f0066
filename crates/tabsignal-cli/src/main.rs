mod client;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use client::ClientConfig;
use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};
use tabsignal_core::config::{
    config_path, env_nonempty, load_config, resolve_log_dir, resolve_log_level,
    resolve_socket_path, TabSignalConfig, INSTANCE_ENV, WINDOW_ENV,
};
use tabsignal_core::hook_ipc::{ClearPayload, HookMsg, SignalPayload, StatusReport, StatusRequest};
use tabsignal_core::HookEvent;
use tabsignal_kitty::{KittyRemote, TerminalControl};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const LOG_FILE_NAME: &str = "tabsignal-hook.log";
const SPAWN_WAIT: Duration = Duration::from_millis(1_500);

#[derive(Parser)]
#[command(name = "tabsignal")]
#[command(about = "Tab color signals for kitty", long_about = None)]
struct Cli {
    #[arg(long, global = true, default_value = "")]
    socket: String,
    #[arg(long, global = true, default_value = "")]
    log_dir: String,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report a hook event for the current window; always exits 0
    Hook {
        /// tool-use, confirm, stop or bell
        event: String,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Drop the signal of the tab owning a window
    Clear {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Show tracked tabs and running pollers
    Status {
        #[arg(long, default_value = "")]
        instance: String,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print the visible text of a window
    ScreenText {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Run the hub in the foreground
    Hub,
}

#[derive(Args, Debug, Clone, Default)]
struct TargetArgs {
    /// Remote-control address of the kitty instance (defaults to $KITTY_LISTEN_ON)
    #[arg(long, default_value = "")]
    instance: String,
    /// kitty window id (defaults to $KITTY_WINDOW_ID)
    #[arg(long)]
    window: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    instance_id: String,
    window_id: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let stdout_enabled = cli.debug && !matches!(cli.command, Commands::Hook { .. });
    let _log_guard = init_logging(&resolve_log_dir(&cli.log_dir), cli.debug, stdout_enabled);
    let settings = match load_config(&config_path()) {
        Ok(settings) => settings,
        Err(err) => {
            warn!(event = "config_error", error = %err);
            TabSignalConfig::default()
        }
    };

    let client = ClientConfig {
        socket_path: resolve_socket_path(&cli.socket),
        reply_timeout: settings.ack_timeout(),
        spawn_wait: SPAWN_WAIT,
        hub_bin: Some(client::hub_binary()),
    };

    match cli.command {
        Commands::Hook { event, target } => {
            run_hook(&client, &event, &target).await;
            Ok(())
        }
        Commands::Clear { target } => {
            let target = resolve_target(&target).context("no target window")?;
            let reply = client::send(
                &client,
                &client::envelope(HookMsg::Clear(ClearPayload {
                    instance_id: target.instance_id,
                    window_id: target.window_id,
                })),
            )
            .await?;
            expect_ack(reply.msg)
        }
        Commands::Status { instance, json } => {
            let request = StatusRequest {
                instance_id: Some(instance).filter(|value| !value.trim().is_empty()),
            };
            let reply = client::send(&client, &client::envelope(HookMsg::Status(request))).await?;
            let report = match reply.msg {
                HookMsg::StatusReport(report) => report,
                HookMsg::Error(err) => bail!("hub error {}: {}", err.code, err.message),
                other => bail!("unexpected reply: {}", other.kind()),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", render_status(&report));
            }
            Ok(())
        }
        Commands::ScreenText { target } => {
            let target = resolve_target(&target).context("no target window")?;
            let remote = KittyRemote::new(settings.kitten_bin.clone(), settings.command_timeout());
            let text = remote
                .read_screen_text(&target.instance_id, target.window_id)
                .await?;
            print!("{text}");
            Ok(())
        }
        Commands::Hub => {
            let mut cmd = std::process::Command::new(client::hub_binary());
            cmd.arg("--socket").arg(&client.socket_path);
            if !cli.log_dir.trim().is_empty() {
                cmd.arg("--log-dir").arg(&cli.log_dir);
            }
            if cli.debug {
                cmd.arg("--debug");
            }
            let status = cmd.status().context("failed to run tabsignal-hub")?;
            if !status.success() {
                bail!("tabsignal-hub exited with {status}");
            }
            Ok(())
        }
    }
}

/// Every failure is logged and swallowed: the calling runtime must never see
/// an error or extra latency from a hook.
async fn run_hook(client: &ClientConfig, event: &str, target: &TargetArgs) {
    let event = match event.parse::<HookEvent>() {
        Ok(event) => event,
        Err(err) => {
            warn!(event = "hook_bad_event", error = %err);
            return;
        }
    };
    let Some(target) = resolve_target(target) else {
        debug!(event = "hook_no_target", hook = %event);
        return;
    };

    let request = client::envelope(HookMsg::Signal(SignalPayload {
        instance_id: target.instance_id.clone(),
        window_id: target.window_id,
        event,
    }));
    match client::send(client, &request).await {
        Ok(reply) => {
            info!(
                event = "hook_sent",
                hook = %event,
                instance = %target.instance_id,
                window_id = target.window_id,
                reply = reply.msg.kind()
            );
        }
        Err(err) => {
            warn!(event = "hook_send_failed", hook = %event, error = %err);
        }
    }
}

fn resolve_target(args: &TargetArgs) -> Option<Target> {
    target_from(
        args,
        env_nonempty(INSTANCE_ENV),
        env_nonempty(WINDOW_ENV),
    )
}

fn target_from(
    args: &TargetArgs,
    env_instance: Option<String>,
    env_window: Option<String>,
) -> Option<Target> {
    let instance_id = if args.instance.trim().is_empty() {
        env_instance?
    } else {
        args.instance.trim().to_string()
    };
    let window_id = match args.window {
        Some(window_id) => window_id,
        None => env_window?.trim().parse().ok()?,
    };
    Some(Target {
        instance_id,
        window_id,
    })
}

fn expect_ack(msg: HookMsg) -> Result<()> {
    match msg {
        HookMsg::Ack(ack) if ack.accepted => Ok(()),
        HookMsg::Ack(ack) => bail!(
            "hub rejected request: {}",
            ack.message.unwrap_or_default()
        ),
        HookMsg::Error(err) => bail!("hub error {}: {}", err.code, err.message),
        other => bail!("unexpected reply: {}", other.kind()),
    }
}

fn render_status(report: &StatusReport) -> String {
    let mut out = String::new();
    if report.records.is_empty() {
        out.push_str("No tracked tabs\n");
    } else {
        out.push_str(&format!("Tracked tabs ({}):\n", report.records.len()));
        for record in &report.records {
            out.push_str(&format!(
                "- {} {}{} since {}\n",
                record.key(),
                record.color,
                if record.painted { "" } else { " (unpainted)" },
                format_ms(record.updated_at_ms)
            ));
        }
    }
    for poller in &report.pollers {
        out.push_str(&format!(
            "poller #{} {} {} cycles={} started {}\n",
            poller.poller_id,
            poller.instance_id,
            poller.phase,
            poller.cycles,
            format_ms(poller.started_at_ms)
        ));
    }
    out
}

fn format_ms(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_string())
}

fn init_logging(log_dir: &Path, debug: bool, stdout_enabled: bool) -> Option<LogGuard> {
    let level = resolve_log_level(debug);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = open_log_file(log_dir).unwrap_or(LogGuard { file: None });
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone(), stdout_enabled));
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
    stdout_enabled: bool,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>, stdout_enabled: bool) -> Self {
        Self {
            stdout_enabled,
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.stdout_enabled {
            let _ = io::stdout().write_all(buf);
        }
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.stdout_enabled {
            let _ = io::stdout().flush();
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use tabsignal_core::hook_ipc::{AckPayload, ErrorPayload};
    use tabsignal_core::{PollerHandle, PollerPhase, TabColor, TabState};

    fn args(instance: &str, window: Option<u64>) -> TargetArgs {
        TargetArgs {
            instance: instance.to_string(),
            window,
        }
    }

    #[test]
    fn flags_win_over_environment() {
        let target = target_from(
            &args("unix:@flag", Some(9)),
            Some("unix:@env".to_string()),
            Some("4".to_string()),
        );
        assert_eq!(
            target,
            Some(Target {
                instance_id: "unix:@flag".to_string(),
                window_id: 9,
            })
        );
    }

    #[test]
    fn environment_fills_missing_flags() {
        let target = target_from(
            &args("", None),
            Some("unix:@mykitty-12".to_string()),
            Some(" 4 ".to_string()),
        );
        assert_eq!(
            target,
            Some(Target {
                instance_id: "unix:@mykitty-12".to_string(),
                window_id: 4,
            })
        );
    }

    #[test]
    fn missing_or_garbled_context_has_no_target() {
        assert_eq!(target_from(&args("", Some(1)), None, None), None);
        assert_eq!(
            target_from(&args("unix:@k", None), None, Some("abc".to_string())),
            None
        );
        assert_eq!(target_from(&args("unix:@k", None), None, None), None);
    }

    #[test]
    fn hook_subcommand_accepts_any_event_text() {
        let cli = Cli::parse_from([
            "tabsignal",
            "hook",
            "not-an-event",
            "--window",
            "3",
        ]);
        match cli.command {
            Commands::Hook { event, target } => {
                assert_eq!(event, "not-an-event");
                assert_eq!(target.window, Some(3));
            }
            _ => panic!("expected hook"),
        }
    }

    #[test]
    fn ack_replies_are_checked() {
        assert!(expect_ack(HookMsg::Ack(AckPayload {
            accepted: true,
            message: None,
        }))
        .is_ok());
        let err = expect_ack(HookMsg::Error(ErrorPayload {
            code: "unsupported_version".to_string(),
            message: "too new".to_string(),
        }))
        .expect_err("error reply");
        assert!(err.to_string().contains("unsupported_version"));
    }

    #[test]
    fn status_lists_records_and_pollers() {
        let report = StatusReport {
            records: vec![TabState {
                instance_id: "unix:@k".to_string(),
                tab_id: 2,
                color: TabColor::Red,
                painted: false,
                updated_at_ms: 0,
            }],
            pollers: vec![PollerHandle {
                instance_id: "unix:@k".to_string(),
                poller_id: 7,
                phase: PollerPhase::Running,
                started_at_ms: 0,
                cycles: 3,
            }],
        };
        let rendered = render_status(&report);
        assert!(rendered.contains("- unix:@k::2 red (unpainted) since 1970-01-01T00:00:00+00:00"));
        assert!(rendered.contains("poller #7 unix:@k running cycles=3"));
        assert_eq!(render_status(&StatusReport::default()), "No tracked tabs\n");
    }
}
