use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod config;
pub mod hook_ipc;
pub mod reconcile;
pub mod store;

/// Indicator color stored for a tab. The absence of a record is the "none" state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabColor {
    Blue,
    BluePaused,
    Yellow,
    Red,
}

impl TabColor {
    pub const ALL: [TabColor; 4] = [
        TabColor::Blue,
        TabColor::BluePaused,
        TabColor::Yellow,
        TabColor::Red,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TabColor::Blue => "blue",
            TabColor::BluePaused => "blue_paused",
            TabColor::Yellow => "yellow",
            TabColor::Red => "red",
        }
    }

    pub fn priority(&self) -> SignalPriority {
        match self {
            TabColor::Blue | TabColor::BluePaused => SignalPriority::Activity,
            TabColor::Yellow => SignalPriority::Attention,
            TabColor::Red => SignalPriority::Finished,
        }
    }

    /// Paused blue keeps its bookkeeping but shows nothing on the tab.
    pub fn is_visible(&self) -> bool {
        !matches!(self, TabColor::BluePaused)
    }

    pub fn is_activity(&self) -> bool {
        matches!(self, TabColor::Blue | TabColor::BluePaused)
    }
}

impl fmt::Display for TabColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TabColor {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "blue" => Ok(TabColor::Blue),
            "blue_paused" | "blue-paused" | "bluepaused" => Ok(TabColor::BluePaused),
            "yellow" => Ok(TabColor::Yellow),
            "red" => Ok(TabColor::Red),
            other => Err(format!("Unknown color: {other}")),
        }
    }
}

/// Total order used when two signals compete for the same tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SignalPriority {
    Activity,
    Attention,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    Applied(TabColor),
    Suppressed {
        current: TabColor,
        requested: TabColor,
    },
}

impl Merge {
    pub fn is_applied(&self) -> bool {
        matches!(self, Merge::Applied(_))
    }

    /// Color the record holds after the merge.
    pub fn color(&self) -> TabColor {
        match self {
            Merge::Applied(color) => *color,
            Merge::Suppressed { current, .. } => *current,
        }
    }
}

/// Priority merge: the request wins when its priority is at least the current one.
pub fn merge(current: Option<TabColor>, requested: TabColor) -> Merge {
    match current {
        Some(current) if requested.priority() < current.priority() => {
            Merge::Suppressed { current, requested }
        }
        _ => Merge::Applied(requested),
    }
}

/// External event classes that trigger a hook invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    ToolUse,
    Confirm,
    Stop,
    Bell,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::ToolUse => "tool_use",
            HookEvent::Confirm => "confirm",
            HookEvent::Stop => "stop",
            HookEvent::Bell => "bell",
        }
    }

    pub fn requested_color(&self) -> TabColor {
        match self {
            HookEvent::ToolUse => TabColor::Blue,
            HookEvent::Confirm | HookEvent::Bell => TabColor::Yellow,
            HookEvent::Stop => TabColor::Red,
        }
    }

    /// Events of a more terminal class than plain activity.
    pub fn supersedes_activity(&self) -> bool {
        !matches!(self, HookEvent::ToolUse)
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookEvent {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase().replace('-', "_");
        match normalized.as_str() {
            "tool_use" | "pre_tool_use" | "post_tool_use" | "activity" => Ok(HookEvent::ToolUse),
            "confirm" | "notification" | "permission" => Ok(HookEvent::Confirm),
            "stop" | "stopped" | "done" => Ok(HookEvent::Stop),
            "bell" => Ok(HookEvent::Bell),
            other => Err(format!("Unknown hook event: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TabKey {
    pub instance_id: String,
    pub tab_id: u64,
}

impl TabKey {
    pub fn new(instance_id: impl Into<String>, tab_id: u64) -> Self {
        Self {
            instance_id: instance_id.into(),
            tab_id,
        }
    }
}

impl fmt::Display for TabKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.instance_id, self.tab_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowKey {
    pub instance_id: String,
    pub window_id: u64,
}

impl WindowKey {
    pub fn new(instance_id: impl Into<String>, window_id: u64) -> Self {
        Self {
            instance_id: instance_id.into(),
            window_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabState {
    pub instance_id: String,
    pub tab_id: u64,
    pub color: TabColor,
    /// Whether the terminal currently shows `color`.
    #[serde(default)]
    pub painted: bool,
    #[serde(default)]
    pub updated_at_ms: i64,
}

impl TabState {
    pub fn key(&self) -> TabKey {
        TabKey::new(self.instance_id.clone(), self.tab_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabFocus {
    pub tab_id: u64,
    pub focused: bool,
}

/// Live focus flags for every tab of one instance, fetched fresh per pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FocusSnapshot {
    pub tabs: Vec<TabFocus>,
}

impl FocusSnapshot {
    pub fn new(tabs: Vec<TabFocus>) -> Self {
        Self { tabs }
    }

    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }

    pub fn focus_of(&self, tab_id: u64) -> Option<bool> {
        self.tabs
            .iter()
            .find(|tab| tab.tab_id == tab_id)
            .map(|tab| tab.focused)
    }
}

/// Tab colors sent to the terminal. `None` resets that slot to the default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabPalette {
    #[serde(default)]
    pub active_fg: Option<String>,
    #[serde(default)]
    pub active_bg: Option<String>,
    #[serde(default)]
    pub inactive_fg: Option<String>,
    #[serde(default)]
    pub inactive_bg: Option<String>,
}

impl TabPalette {
    pub fn reset() -> Self {
        Self::default()
    }

    pub fn is_reset(&self) -> bool {
        self.active_fg.is_none()
            && self.active_bg.is_none()
            && self.inactive_fg.is_none()
            && self.inactive_bg.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerPhase {
    Starting,
    Running,
    Exiting,
}

impl PollerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollerPhase::Starting => "starting",
            PollerPhase::Running => "running",
            PollerPhase::Exiting => "exiting",
        }
    }
}

impl fmt::Display for PollerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerHandle {
    pub instance_id: String,
    pub poller_id: u64,
    pub phase: PollerPhase,
    pub started_at_ms: i64,
    #[serde(default)]
    pub cycles: u32,
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
