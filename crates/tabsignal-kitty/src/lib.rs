//! kitty remote-control adapter.
//!
//! Every call goes through `kitten @ --to <instance> ...` with a hard timeout.
//! Queries degrade to empty answers on failure so callers never block on the
//! terminal; commands report failures so the hub can retry on its next pass.

use serde::Deserialize;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tabsignal_core::{TabFocus, TabPalette};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

pub type TerminalFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type TerminalHandle = Arc<dyn TerminalControl>;

/// Black-box command/query interface of a terminal emulator instance.
pub trait TerminalControl: Send + Sync {
    /// All tabs of the instance with their focus flag. Empty on any failure.
    fn list_tabs<'a>(&'a self, instance_id: &'a str) -> TerminalFuture<'a, Vec<TabFocus>>;
    /// Tab owning `window_id`, or `None` when it cannot be resolved.
    fn resolve_window<'a>(
        &'a self,
        instance_id: &'a str,
        window_id: u64,
    ) -> TerminalFuture<'a, Option<TabFocus>>;
    fn apply_color<'a>(
        &'a self,
        instance_id: &'a str,
        tab_id: u64,
        palette: &'a TabPalette,
    ) -> TerminalFuture<'a, Result<(), TerminalError>>;
    fn read_screen_text<'a>(
        &'a self,
        instance_id: &'a str,
        window_id: u64,
    ) -> TerminalFuture<'a, Result<String, TerminalError>>;
}

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("remote control timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote control binary not found: {0}")]
    NotFound(String),
    #[error("remote control command failed ({status}): {stderr}")]
    Failed { status: String, stderr: String },
    #[error("unexpected remote control output: {0}")]
    Parse(String),
    #[error("remote control io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct KittyRemote {
    binary: String,
    timeout: Duration,
}

impl KittyRemote {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn handle(self) -> TerminalHandle {
        Arc::new(self)
    }

    async fn run(&self, instance_id: &str, args: Vec<String>) -> Result<String, TerminalError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(remote_args(instance_id, &args))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) if err.kind() == io::ErrorKind::NotFound => {
                return Err(TerminalError::NotFound(self.binary.clone()));
            }
            Ok(Err(err)) => return Err(TerminalError::Io(err)),
            Err(_) => return Err(TerminalError::Timeout(self.timeout)),
        };

        if !output.status.success() {
            return Err(TerminalError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    pub async fn ls(&self, instance_id: &str) -> Result<Vec<LsOsWindow>, TerminalError> {
        let raw = self.run(instance_id, vec!["ls".to_string()]).await?;
        parse_ls(&raw)
    }
}

impl TerminalControl for KittyRemote {
    fn list_tabs<'a>(&'a self, instance_id: &'a str) -> TerminalFuture<'a, Vec<TabFocus>> {
        Box::pin(async move {
            match self.ls(instance_id).await {
                Ok(windows) => tab_focus(&windows),
                Err(err) => {
                    debug!(event = "kitty_list_tabs_failed", instance = %instance_id, error = %err);
                    Vec::new()
                }
            }
        })
    }

    fn resolve_window<'a>(
        &'a self,
        instance_id: &'a str,
        window_id: u64,
    ) -> TerminalFuture<'a, Option<TabFocus>> {
        Box::pin(async move {
            match self.ls(instance_id).await {
                Ok(windows) => find_window(&windows, window_id),
                Err(err) => {
                    debug!(
                        event = "kitty_resolve_failed",
                        instance = %instance_id,
                        window_id,
                        error = %err
                    );
                    None
                }
            }
        })
    }

    fn apply_color<'a>(
        &'a self,
        instance_id: &'a str,
        tab_id: u64,
        palette: &'a TabPalette,
    ) -> TerminalFuture<'a, Result<(), TerminalError>> {
        Box::pin(async move {
            self.run(instance_id, set_tab_color_args(tab_id, palette))
                .await
                .map(|_| ())
        })
    }

    fn read_screen_text<'a>(
        &'a self,
        instance_id: &'a str,
        window_id: u64,
    ) -> TerminalFuture<'a, Result<String, TerminalError>> {
        Box::pin(async move { self.run(instance_id, get_text_args(window_id)).await })
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LsOsWindow {
    pub id: u64,
    #[serde(default = "default_true")]
    pub is_focused: bool,
    #[serde(default)]
    pub tabs: Vec<LsTab>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LsTab {
    pub id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub is_focused: bool,
    #[serde(default)]
    pub windows: Vec<LsWindow>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LsWindow {
    pub id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub is_focused: bool,
}

fn default_true() -> bool {
    true
}

pub fn parse_ls(raw: &str) -> Result<Vec<LsOsWindow>, TerminalError> {
    serde_json::from_str(raw).map_err(|err| TerminalError::Parse(err.to_string()))
}

/// A tab counts as focused only while its OS window has focus too.
pub fn tab_focus(windows: &[LsOsWindow]) -> Vec<TabFocus> {
    windows
        .iter()
        .flat_map(|os_window| {
            os_window.tabs.iter().map(move |tab| TabFocus {
                tab_id: tab.id,
                focused: os_window.is_focused && tab.is_focused,
            })
        })
        .collect()
}

pub fn find_window(windows: &[LsOsWindow], window_id: u64) -> Option<TabFocus> {
    windows.iter().find_map(|os_window| {
        os_window
            .tabs
            .iter()
            .find(|tab| tab.windows.iter().any(|window| window.id == window_id))
            .map(|tab| TabFocus {
                tab_id: tab.id,
                focused: os_window.is_focused && tab.is_focused,
            })
    })
}

pub fn remote_args(instance_id: &str, args: &[String]) -> Vec<String> {
    let mut full = vec!["@".to_string()];
    if !instance_id.trim().is_empty() {
        full.push("--to".to_string());
        full.push(instance_id.to_string());
    }
    full.extend(args.iter().cloned());
    full
}

pub fn set_tab_color_args(tab_id: u64, palette: &TabPalette) -> Vec<String> {
    let slot = |name: &str, value: &Option<String>| {
        format!("{name}={}", value.as_deref().unwrap_or("NONE"))
    };
    vec![
        "set-tab-color".to_string(),
        "--match".to_string(),
        format!("id:{tab_id}"),
        slot("active_fg", &palette.active_fg),
        slot("active_bg", &palette.active_bg),
        slot("inactive_fg", &palette.inactive_fg),
        slot("inactive_bg", &palette.inactive_bg),
    ]
}

pub fn get_text_args(window_id: u64) -> Vec<String> {
    vec![
        "get-text".to_string(),
        "--match".to_string(),
        format!("id:{window_id}"),
        "--extent".to_string(),
        "screen".to_string(),
    ]
}
