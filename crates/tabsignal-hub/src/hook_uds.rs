use crate::coordinator::Coordinator;
use std::{
    io,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
#[cfg(unix)]
use std::{fs, os::unix::fs::PermissionsExt};
use tabsignal_core::hook_ipc::{
    decode_frame, encode_frame, AckPayload, ErrorPayload, HookEnvelope, HookMsg,
    CURRENT_PROTOCOL_VERSION, DEFAULT_MAX_FRAME_BYTES,
};
#[cfg(unix)]
use tokio::net::{
    unix::{OwnedReadHalf, OwnedWriteHalf},
    UnixListener, UnixStream,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::watch,
};
use tracing::{debug, info, warn};

pub const HUB_SENDER_ID: &str = "tabsignal-hub";

const IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
pub struct HookUdsConfig {
    pub socket_path: PathBuf,
    pub write_timeout: Duration,
    /// Exit once nothing was tracked and nobody connected for this long.
    pub idle_exit: Option<Duration>,
}

#[cfg(not(unix))]
pub async fn run(
    _config: HookUdsConfig,
    _coordinator: Arc<Coordinator>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let _ = shutdown.changed().await;
    Ok(())
}

#[cfg(unix)]
pub async fn run(
    config: HookUdsConfig,
    coordinator: Arc<Coordinator>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    if let Some(parent) = config.socket_path.parent() {
        fs::create_dir_all(parent)?;
        let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
    }

    if config.socket_path.exists() {
        let _ = fs::remove_file(&config.socket_path);
    }

    let listener = UnixListener::bind(&config.socket_path)?;
    let _ = fs::set_permissions(&config.socket_path, fs::Permissions::from_mode(0o600));

    let server = Arc::new(HookUdsServer::new(config.clone(), coordinator));
    let mut idle_tick = tokio::time::interval(IDLE_CHECK_INTERVAL.min(
        config.idle_exit.unwrap_or(IDLE_CHECK_INTERVAL),
    ));

    info!(
        event = "hook_uds_start",
        socket = %config.socket_path.display(),
        idle_exit_secs = config.idle_exit.map(|value| value.as_secs())
    );

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_ok() && *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        let server = server.clone();
                        tokio::spawn(async move {
                            server.handle_connection(stream).await;
                        });
                    }
                    Err(err) => {
                        warn!(event = "hook_uds_accept_error", error = %err);
                    }
                }
            }
            _ = idle_tick.tick(), if config.idle_exit.is_some() => {
                if server.idle_expired().await {
                    info!(event = "hook_uds_idle_exit");
                    break;
                }
            }
        }
    }

    let _ = fs::remove_file(&config.socket_path);
    info!(event = "hook_uds_stop", socket = %config.socket_path.display());
    Ok(())
}

#[cfg(unix)]
struct HookUdsServer {
    config: HookUdsConfig,
    coordinator: Arc<Coordinator>,
    conn_counter: AtomicU64,
    active_conns: AtomicUsize,
    started: Instant,
    last_activity_ms: AtomicU64,
}

#[cfg(unix)]
impl HookUdsServer {
    fn new(config: HookUdsConfig, coordinator: Arc<Coordinator>) -> Self {
        Self {
            config,
            coordinator,
            conn_counter: AtomicU64::new(0),
            active_conns: AtomicUsize::new(0),
            started: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("hook-conn-{id}")
    }

    fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_activity_ms.store(elapsed, Ordering::SeqCst);
    }

    fn quiet_for(&self) -> Duration {
        let now = self.started.elapsed().as_millis() as u64;
        let last = self.last_activity_ms.load(Ordering::SeqCst);
        Duration::from_millis(now.saturating_sub(last))
    }

    async fn idle_expired(&self) -> bool {
        let Some(idle_exit) = self.config.idle_exit else {
            return false;
        };
        self.active_conns.load(Ordering::SeqCst) == 0
            && self.quiet_for() >= idle_exit
            && self.coordinator.is_idle().await
    }

    async fn handle_connection(self: Arc<Self>, stream: UnixStream) {
        let conn_id = self.next_conn_id();
        self.active_conns.fetch_add(1, Ordering::SeqCst);
        self.touch();

        let (reader_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader_half);

        while let Some(envelope) = read_next_valid_frame(&mut reader).await {
            self.touch();
            let Some(reply) = self.dispatch(&conn_id, envelope).await else {
                continue;
            };
            if !send_frame(&mut writer, &reply, self.config.write_timeout, &conn_id).await {
                break;
            }
        }

        self.active_conns.fetch_sub(1, Ordering::SeqCst);
        self.touch();
        debug!(event = "hook_uds_disconnect", conn_id = %conn_id);
    }

    /// Routes one request. Signals and clears are acknowledged before the
    /// coordinator runs them so the hook never waits on the terminal.
    async fn dispatch(&self, conn_id: &str, envelope: HookEnvelope) -> Option<HookEnvelope> {
        let request_id = envelope.request_id.clone();
        let reply = |msg| Some(HookEnvelope::new(HUB_SENDER_ID, request_id.clone(), msg));

        if envelope.version.0 > CURRENT_PROTOCOL_VERSION {
            warn!(
                event = "hook_uds_unsupported_version",
                conn_id = %conn_id,
                version = envelope.version.0
            );
            return reply(HookMsg::Error(ErrorPayload {
                code: "unsupported_version".to_string(),
                message: format!(
                    "protocol version {} is newer than {}",
                    envelope.version.0, CURRENT_PROTOCOL_VERSION
                ),
            }));
        }

        match envelope.msg {
            HookMsg::Signal(payload) => {
                debug!(
                    event = "hook_uds_signal",
                    conn_id = %conn_id,
                    sender = %envelope.sender_id,
                    instance = %payload.instance_id,
                    window_id = payload.window_id,
                    hook = %payload.event
                );
                let coordinator = self.coordinator.clone();
                tokio::spawn(async move {
                    coordinator
                        .handle_signal(&payload.instance_id, payload.window_id, payload.event)
                        .await;
                });
                reply(HookMsg::Ack(AckPayload {
                    accepted: true,
                    message: None,
                }))
            }
            HookMsg::Clear(payload) => {
                let coordinator = self.coordinator.clone();
                tokio::spawn(async move {
                    coordinator
                        .clear_window(&payload.instance_id, payload.window_id)
                        .await;
                });
                reply(HookMsg::Ack(AckPayload {
                    accepted: true,
                    message: None,
                }))
            }
            HookMsg::Status(request) => {
                let report = self.coordinator.status(request.instance_id.as_deref()).await;
                reply(HookMsg::StatusReport(report))
            }
            other => {
                warn!(
                    event = "hook_uds_unexpected_message",
                    conn_id = %conn_id,
                    kind = other.kind()
                );
                reply(HookMsg::Error(ErrorPayload {
                    code: "unexpected_message".to_string(),
                    message: format!("hub does not accept '{}' frames", other.kind()),
                }))
            }
        }
    }
}

#[cfg(unix)]
async fn send_frame(
    writer: &mut OwnedWriteHalf,
    envelope: &HookEnvelope,
    write_timeout: Duration,
    conn_id: &str,
) -> bool {
    let frame = match encode_frame(envelope, DEFAULT_MAX_FRAME_BYTES) {
        Ok(value) => value,
        Err(err) => {
            warn!(event = "hook_uds_encode_error", conn_id = %conn_id, error = %err);
            return true;
        }
    };
    let send = async {
        writer.write_all(&frame).await?;
        writer.flush().await
    };
    match tokio::time::timeout(write_timeout, send).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            debug!(event = "hook_uds_write_error", conn_id = %conn_id, error = %err);
            false
        }
        Err(_) => {
            warn!(event = "hook_uds_write_timeout", conn_id = %conn_id);
            false
        }
    }
}

#[cfg(unix)]
async fn read_next_valid_frame(reader: &mut BufReader<OwnedReadHalf>) -> Option<HookEnvelope> {
    loop {
        let mut line = Vec::new();
        let n = match reader.read_until(b'\n', &mut line).await {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "hook_uds_read_error", error = %err);
                return None;
            }
        };
        if n == 0 {
            return None;
        }
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        match decode_frame::<HookEnvelope>(&line, DEFAULT_MAX_FRAME_BYTES) {
            Ok(envelope) => return Some(envelope),
            Err(err) => {
                warn!(event = "hook_uds_decode_error", error = %err);
                continue;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::coordinator::CoordinatorConfig;
    use crate::test_support::FakeTerminal;
    use std::path::Path;
    use std::time::{SystemTime, UNIX_EPOCH};
    use tabsignal_core::config::PaletteConfig;
    use tabsignal_core::hook_ipc::{
        ClearPayload, ProtocolVersion, SignalPayload, StatusReport, StatusRequest,
    };
    use tabsignal_core::{HookEvent, TabColor};
    use tabsignal_kitty::TerminalHandle;

    const INSTANCE: &str = "unix:@mykitty-77";

    fn test_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir()
            .join(format!("tabsignal-hub-test-{name}-{nanos}"))
            .join("hub.sock")
    }

    async fn wait_for_socket(path: &Path) {
        for _ in 0..100 {
            if path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("socket did not appear: {}", path.display());
    }

    async fn launch_hub(
        name: &str,
        idle_exit: Option<Duration>,
    ) -> (
        PathBuf,
        Arc<FakeTerminal>,
        watch::Sender<bool>,
        tokio::task::JoinHandle<io::Result<()>>,
    ) {
        let path = test_path(name);
        let terminal = FakeTerminal::new();
        terminal.add_window(INSTANCE, 5, 1);
        terminal.add_window(INSTANCE, 6, 2);
        terminal.focus_tab(INSTANCE, 2);
        let handle: TerminalHandle = terminal.clone();

        let (tx, rx) = watch::channel(false);
        let coordinator = Coordinator::new(
            CoordinatorConfig {
                poll_interval: Duration::from_secs(3_600),
                poll_debounce: Duration::from_secs(3_600),
                poll_max_cycles: 10,
                fast_path: true,
                palette: PaletteConfig::default(),
            },
            handle,
            rx.clone(),
        );
        let cfg = HookUdsConfig {
            socket_path: path.clone(),
            write_timeout: Duration::from_secs(1),
            idle_exit,
        };
        let server = tokio::spawn(run(cfg, coordinator, rx));
        wait_for_socket(&path).await;
        (path, terminal, tx, server)
    }

    async fn connect(path: &Path) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
        let stream = UnixStream::connect(path)
            .await
            .unwrap_or_else(|err| panic!("connect failed: {err}"));
        let (reader, writer) = stream.into_split();
        (BufReader::new(reader), writer)
    }

    async fn write_raw(writer: &mut OwnedWriteHalf, bytes: &[u8]) {
        writer.write_all(bytes).await.expect("write");
        writer.flush().await.expect("flush");
    }

    async fn request(
        reader: &mut BufReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
        envelope: &HookEnvelope,
    ) -> HookEnvelope {
        let frame = encode_frame(envelope, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        write_raw(writer, &frame).await;
        let mut line = Vec::new();
        let read =
            tokio::time::timeout(Duration::from_secs(3), reader.read_until(b'\n', &mut line))
                .await
                .expect("read timeout")
                .expect("read error");
        assert!(read > 0, "unexpected EOF");
        decode_frame(&line, DEFAULT_MAX_FRAME_BYTES).expect("decode")
    }

    fn signal(request_id: &str, window_id: u64, event: HookEvent) -> HookEnvelope {
        HookEnvelope::new(
            "hook-test",
            Some(request_id.to_string()),
            HookMsg::Signal(SignalPayload {
                instance_id: INSTANCE.to_string(),
                window_id,
                event,
            }),
        )
    }

    fn status() -> HookEnvelope {
        HookEnvelope::new(
            "hook-test",
            Some("status".to_string()),
            HookMsg::Status(StatusRequest {
                instance_id: Some(INSTANCE.to_string()),
            }),
        )
    }

    async fn wait_for_report(
        reader: &mut BufReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
        accept: impl Fn(&StatusReport) -> bool,
    ) -> StatusReport {
        for _ in 0..100 {
            let reply = request(reader, writer, &status()).await;
            let HookMsg::StatusReport(report) = reply.msg else {
                panic!("expected status report, got {}", reply.msg.kind());
            };
            if accept(&report) {
                return report;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("status never matched");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn signal_is_acked_and_lands_in_status() {
        let (path, terminal, shutdown, server) = launch_hub("signal", None).await;
        let (mut reader, mut writer) = connect(&path).await;

        let ack = request(&mut reader, &mut writer, &signal("req-1", 5, HookEvent::Stop)).await;
        assert_eq!(ack.sender_id, HUB_SENDER_ID);
        assert_eq!(ack.request_id.as_deref(), Some("req-1"));
        assert_eq!(
            ack.msg,
            HookMsg::Ack(AckPayload {
                accepted: true,
                message: None,
            })
        );

        let report = wait_for_report(&mut reader, &mut writer, |report| {
            report.pollers.len() == 1 && report.records.first().map_or(false, |r| r.painted)
        })
        .await;
        assert_eq!(report.records[0].tab_id, 1);
        assert_eq!(report.records[0].color, TabColor::Red);
        assert_eq!(terminal.paints_for(1).len(), 1);

        let clear = HookEnvelope::new(
            "hook-test",
            Some("req-2".to_string()),
            HookMsg::Clear(ClearPayload {
                instance_id: INSTANCE.to_string(),
                window_id: 5,
            }),
        );
        let ack = request(&mut reader, &mut writer, &clear).await;
        assert_eq!(ack.msg.kind(), "ack");
        wait_for_report(&mut reader, &mut writer, |report| report.records.is_empty()).await;

        shutdown.send(true).expect("shutdown");
        server.await.expect("join").expect("run");
        assert!(!path.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_lines_are_skipped() {
        let (path, _terminal, shutdown, server) = launch_hub("malformed", None).await;
        let (mut reader, mut writer) = connect(&path).await;

        write_raw(&mut writer, b"\n   \n{not json}\n").await;
        let reply = request(&mut reader, &mut writer, &status()).await;
        assert_eq!(reply.request_id.as_deref(), Some("status"));
        assert_eq!(reply.msg, HookMsg::StatusReport(StatusReport::default()));

        shutdown.send(true).expect("shutdown");
        server.await.expect("join").expect("run");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn newer_protocol_and_hub_frames_get_errors() {
        let (path, _terminal, shutdown, server) = launch_hub("errors", None).await;
        let (mut reader, mut writer) = connect(&path).await;

        let mut future = signal("req-v9", 5, HookEvent::Stop);
        future.version = ProtocolVersion(9);
        let reply = request(&mut reader, &mut writer, &future).await;
        match reply.msg {
            HookMsg::Error(payload) => assert_eq!(payload.code, "unsupported_version"),
            other => panic!("expected error, got {}", other.kind()),
        }

        let stray = HookEnvelope::new(
            "hook-test",
            None,
            HookMsg::Ack(AckPayload {
                accepted: true,
                message: None,
            }),
        );
        let reply = request(&mut reader, &mut writer, &stray).await;
        match reply.msg {
            HookMsg::Error(payload) => assert_eq!(payload.code, "unexpected_message"),
            other => panic!("expected error, got {}", other.kind()),
        }

        let report = wait_for_report(&mut reader, &mut writer, |_| true).await;
        assert!(report.records.is_empty());

        shutdown.send(true).expect("shutdown");
        server.await.expect("join").expect("run");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn idle_hub_exits_on_its_own() {
        let (path, _terminal, _shutdown, server) =
            launch_hub("idle", Some(Duration::from_millis(100))).await;

        let result = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("hub did not exit");
        result.expect("join").expect("run");
        assert!(!path.exists());
    }
}
