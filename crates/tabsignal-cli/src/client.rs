//! Hub connection for the short-lived CLI: connect, auto-start the hub when
//! nothing listens, send one request and wait a bounded time for the reply.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tabsignal_core::hook_ipc::{
    decode_frame, encode_frame, HookEnvelope, HookMsg, DEFAULT_MAX_FRAME_BYTES,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, info};

pub const HUB_BIN_NAME: &str = "tabsignal-hub";

const CONNECT_RETRY: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub socket_path: PathBuf,
    pub reply_timeout: Duration,
    /// How long to wait for a freshly spawned hub to bind its socket.
    pub spawn_wait: Duration,
    /// `None` never starts a hub.
    pub hub_bin: Option<PathBuf>,
}

pub fn sender_id() -> String {
    format!("tabsignal-cli-{}", std::process::id())
}

pub fn envelope(msg: HookMsg) -> HookEnvelope {
    HookEnvelope::new(
        &sender_id(),
        Some(uuid::Uuid::new_v4().to_string()),
        msg,
    )
}

/// Sibling of the running executable when present, else resolved via PATH.
pub fn hub_binary() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(HUB_BIN_NAME)))
        .filter(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from(HUB_BIN_NAME))
}

pub async fn send(config: &ClientConfig, request: &HookEnvelope) -> Result<HookEnvelope> {
    let stream = connect_or_spawn(config).await?;
    exchange(stream, request, config.reply_timeout).await
}

async fn connect_or_spawn(config: &ClientConfig) -> Result<UnixStream> {
    match UnixStream::connect(&config.socket_path).await {
        Ok(stream) => return Ok(stream),
        Err(err) => {
            debug!(
                event = "hub_connect_failed",
                socket = %config.socket_path.display(),
                error = %err
            );
        }
    }

    let Some(hub_bin) = &config.hub_bin else {
        bail!("hub not reachable at {}", config.socket_path.display());
    };
    spawn_hub(hub_bin, &config.socket_path)?;

    let started = Instant::now();
    loop {
        tokio::time::sleep(CONNECT_RETRY).await;
        if let Ok(stream) = UnixStream::connect(&config.socket_path).await {
            return Ok(stream);
        }
        if started.elapsed() >= config.spawn_wait {
            bail!(
                "hub did not come up at {} within {:?}",
                config.socket_path.display(),
                config.spawn_wait
            );
        }
    }
}

/// Starts the hub detached from the calling process group with null stdio.
/// Racing spawns are harmless: the loser fails to take the hub lock and exits.
pub fn spawn_hub(hub_bin: &Path, socket_path: &Path) -> Result<()> {
    let mut cmd = Command::new(hub_bin);
    cmd.arg("--socket")
        .arg(socket_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    let child = cmd
        .spawn()
        .with_context(|| format!("failed to start {}", hub_bin.display()))?;
    info!(event = "hub_spawned", pid = child.id(), bin = %hub_bin.display());
    Ok(())
}

async fn exchange(
    stream: UnixStream,
    request: &HookEnvelope,
    reply_timeout: Duration,
) -> Result<HookEnvelope> {
    let (reader, mut writer) = stream.into_split();
    let frame = encode_frame(request, DEFAULT_MAX_FRAME_BYTES)?;

    let round_trip = async {
        writer.write_all(&frame).await?;
        writer.flush().await?;
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        let read = reader.read_until(b'\n', &mut line).await?;
        Ok::<_, std::io::Error>((read, line))
    };
    let (read, line) = tokio::time::timeout(reply_timeout, round_trip)
        .await
        .with_context(|| format!("no reply from hub within {reply_timeout:?}"))??;
    if read == 0 {
        bail!("hub closed the connection without replying");
    }
    Ok(decode_frame(&line, DEFAULT_MAX_FRAME_BYTES)?)
}
