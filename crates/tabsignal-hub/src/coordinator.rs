use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tabsignal_core::config::{PaletteConfig, TabSignalConfig};
use tabsignal_core::hook_ipc::StatusReport;
use tabsignal_core::reconcile::{apply_update, reconcile};
use tabsignal_core::store::ColorStore;
use tabsignal_core::{
    now_ms, FocusSnapshot, HookEvent, Merge, PollerHandle, PollerPhase, TabColor, TabKey,
    WindowKey,
};
use tabsignal_kitty::TerminalHandle;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// A paint that lost a race with a clear gets one follow-up reset.
const MAX_PAINT_ATTEMPTS: usize = 2;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub poll_interval: Duration,
    pub poll_debounce: Duration,
    pub poll_max_cycles: u32,
    pub fast_path: bool,
    pub palette: PaletteConfig,
}

impl CoordinatorConfig {
    pub fn from_config(config: &TabSignalConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            poll_debounce: config.poll_debounce(),
            poll_max_cycles: config.poll_max_cycles(),
            fast_path: config.fast_path,
            palette: config.palette.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    /// The window's cached tab already shows a signal a repeat cannot upgrade.
    FastPath,
    Unresolved,
    FocusedNoop,
    ClearedWhileFocused,
    Applied(TabColor),
    Suppressed {
        current: TabColor,
        requested: TabColor,
    },
}

impl HookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookOutcome::FastPath => "fast_path",
            HookOutcome::Unresolved => "unresolved",
            HookOutcome::FocusedNoop => "focused_noop",
            HookOutcome::ClearedWhileFocused => "cleared_while_focused",
            HookOutcome::Applied(_) => "applied",
            HookOutcome::Suppressed { .. } => "suppressed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerExit {
    /// No record left for the instance.
    Idle,
    /// Cycle budget exhausted; remaining records were force-cleared.
    CycleCap,
    Shutdown,
}

impl PollerExit {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollerExit::Idle => "idle",
            PollerExit::CycleCap => "cycle_cap",
            PollerExit::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Default)]
pub struct CoordinatorState {
    pub store: ColorStore,
    pub pollers: HashMap<String, PollerHandle>,
}

impl CoordinatorState {
    /// Drops the registry entry only while it still belongs to `poller_id`.
    fn release_poller(&mut self, instance_id: &str, poller_id: u64) -> bool {
        let owned = self
            .pollers
            .get(instance_id)
            .map(|handle| handle.poller_id == poller_id)
            .unwrap_or(false);
        if owned {
            self.pollers.remove(instance_id);
        }
        owned
    }

    fn own_poller(&mut self, instance_id: &str, poller_id: u64) -> Option<&mut PollerHandle> {
        self.pollers
            .get_mut(instance_id)
            .filter(|handle| handle.poller_id == poller_id)
    }
}

/// Owns the color store and the per-instance supervisors. Every mutation of
/// coordination state happens under `state`; terminal round trips never do.
pub struct Coordinator {
    config: CoordinatorConfig,
    terminal: TerminalHandle,
    state: Mutex<CoordinatorState>,
    poller_counter: AtomicU64,
    shutdown: watch::Receiver<bool>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        terminal: TerminalHandle,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            terminal,
            state: Mutex::new(CoordinatorState::default()),
            poller_counter: AtomicU64::new(0),
            shutdown,
        })
    }

    pub async fn handle_signal(
        self: &Arc<Self>,
        instance_id: &str,
        window_id: u64,
        event: HookEvent,
    ) -> HookOutcome {
        let window = WindowKey::new(instance_id, window_id);

        if self.config.fast_path && event == HookEvent::ToolUse {
            let hinted = self.state.lock().await.store.hinted_color(&window);
            if matches!(
                hinted,
                Some(TabColor::Blue | TabColor::Yellow | TabColor::Red)
            ) {
                debug!(
                    event = "hook_fast_path",
                    instance = %instance_id,
                    window_id,
                    color = ?hinted
                );
                return HookOutcome::FastPath;
            }
        }

        let Some(focus) = self.terminal.resolve_window(instance_id, window_id).await else {
            debug!(
                event = "hook_unresolved",
                instance = %instance_id,
                window_id,
                hook = %event
            );
            return HookOutcome::Unresolved;
        };
        let key = TabKey::new(instance_id, focus.tab_id);

        if focus.focused {
            let cleared = {
                let mut state = self.state.lock().await;
                let superseded = event.supersedes_activity()
                    && state
                        .store
                        .color(&key)
                        .map(|color| color.is_activity())
                        .unwrap_or(false);
                if superseded {
                    state.store.clear(&key)
                } else {
                    state.store.remember_window(window, key.clone());
                    None
                }
            };
            let outcome = match cleared {
                Some(record) => {
                    if (record.color.is_visible() || !record.painted)
                        && !self.paint(&key, None).await
                    {
                        self.ensure_poller(instance_id).await;
                    }
                    HookOutcome::ClearedWhileFocused
                }
                None => HookOutcome::FocusedNoop,
            };
            info!(
                event = "hook_signal",
                tab = %key,
                hook = %event,
                focused = true,
                outcome = outcome.as_str()
            );
            return outcome;
        }

        let requested = event.requested_color();
        let (outcome, needs_paint) = {
            let mut state = self.state.lock().await;
            let set = state.store.set(&key, requested);
            state.store.remember_window(window, key.clone());
            let painted = state
                .store
                .get(&key)
                .map(|record| record.painted)
                .unwrap_or(false);
            let outcome = match set.merge {
                Merge::Applied(color) => HookOutcome::Applied(color),
                Merge::Suppressed { current, requested } => {
                    HookOutcome::Suppressed { current, requested }
                }
            };
            (outcome, set.applied() && !painted)
        };

        if needs_paint {
            self.paint(&key, Some(requested)).await;
        }
        info!(
            event = "hook_signal",
            tab = %key,
            hook = %event,
            focused = false,
            outcome = outcome.as_str(),
            color = %requested
        );
        self.ensure_poller(instance_id).await;
        outcome
    }

    /// Explicitly clears the tab owning `window_id`. Returns whether a record existed.
    pub async fn clear_window(self: &Arc<Self>, instance_id: &str, window_id: u64) -> bool {
        let window = WindowKey::new(instance_id, window_id);
        let resolved = match self.terminal.resolve_window(instance_id, window_id).await {
            Some(focus) => Some(TabKey::new(instance_id, focus.tab_id)),
            None => self.state.lock().await.store.hinted_key(&window).cloned(),
        };
        let Some(key) = resolved else {
            debug!(event = "hook_clear_unresolved", instance = %instance_id, window_id);
            return false;
        };

        let removed = self.state.lock().await.store.clear(&key);
        if removed.is_some() && !self.paint(&key, None).await {
            self.ensure_poller(instance_id).await;
        }
        info!(event = "hook_clear", tab = %key, removed = removed.is_some());
        removed.is_some()
    }

    pub async fn status(&self, instance_id: Option<&str>) -> StatusReport {
        let state = self.state.lock().await;
        let mut pollers = state
            .pollers
            .values()
            .filter(|handle| instance_id.map_or(true, |id| handle.instance_id == id))
            .cloned()
            .collect::<Vec<_>>();
        pollers.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        let records = match instance_id {
            Some(id) => state.store.instance_records(id),
            None => state.store.all_records(),
        };
        StatusReport { records, pollers }
    }

    pub async fn is_idle(&self) -> bool {
        let state = self.state.lock().await;
        state.store.is_empty() && state.pollers.is_empty()
    }

    /// Starts the supervisor for `instance_id` unless one already owns the
    /// registry entry. An entry in `Exiting` is replaced, since that
    /// supervisor no longer looks at new records.
    pub async fn ensure_poller(self: &Arc<Self>, instance_id: &str) -> Option<JoinHandle<PollerExit>> {
        let poller_id = {
            let mut state = self.state.lock().await;
            let live = state
                .pollers
                .get(instance_id)
                .map(|handle| handle.phase != PollerPhase::Exiting)
                .unwrap_or(false);
            if live {
                return None;
            }
            let poller_id = self.poller_counter.fetch_add(1, Ordering::SeqCst) + 1;
            state.pollers.insert(
                instance_id.to_string(),
                PollerHandle {
                    instance_id: instance_id.to_string(),
                    poller_id,
                    phase: PollerPhase::Starting,
                    started_at_ms: now_ms(),
                    cycles: 0,
                },
            );
            poller_id
        };

        info!(event = "poller_start", instance = %instance_id, poller_id);
        let coordinator = Arc::clone(self);
        let instance_id = instance_id.to_string();
        Some(tokio::spawn(async move {
            coordinator.run_poller(instance_id, poller_id).await
        }))
    }

    async fn run_poller(self: Arc<Self>, instance_id: String, poller_id: u64) -> PollerExit {
        let exit = self.poll_cycles(&instance_id, poller_id).await;
        self.state
            .lock()
            .await
            .release_poller(&instance_id, poller_id);
        info!(
            event = "poller_exit",
            instance = %instance_id,
            poller_id,
            reason = exit.as_str()
        );
        exit
    }

    async fn poll_cycles(&self, instance_id: &str, poller_id: u64) -> PollerExit {
        let mut shutdown = self.shutdown.clone();
        if !pause(&mut shutdown, self.config.poll_debounce).await {
            return PollerExit::Shutdown;
        }

        for cycle in 1..=self.config.poll_max_cycles {
            {
                let mut state = self.state.lock().await;
                if !state.store.has_instance_records(instance_id)
                    && !state.store.has_pending_resets(instance_id)
                {
                    // Released in the same critical section that saw the empty
                    // store, so a later record always finds no live entry.
                    state.release_poller(instance_id, poller_id);
                    return PollerExit::Idle;
                }
                if let Some(handle) = state.own_poller(instance_id, poller_id) {
                    handle.phase = PollerPhase::Running;
                    handle.cycles = cycle;
                }
            }

            self.reconcile_once(instance_id).await;

            if !pause(&mut shutdown, self.config.poll_interval).await {
                return PollerExit::Shutdown;
            }
        }

        let abandoned = {
            let mut state = self.state.lock().await;
            if let Some(handle) = state.own_poller(instance_id, poller_id) {
                handle.phase = PollerPhase::Exiting;
            }
            state.store.clear_instance(instance_id)
        };
        if !abandoned.is_empty() {
            warn!(
                event = "poller_force_clear",
                instance = %instance_id,
                poller_id,
                records = abandoned.len()
            );
        }
        for record in abandoned {
            self.paint(&record.key(), None).await;
        }
        let unreset = {
            let mut state = self.state.lock().await;
            let keys = state.store.pending_resets(instance_id);
            for key in &keys {
                state.store.reset_done(key);
            }
            keys
        };
        for key in unreset {
            warn!(event = "reset_abandoned", tab = %key, poller_id);
        }
        PollerExit::CycleCap
    }

    /// One reconciliation pass for `instance_id`. Returns the number of
    /// updates applied to the store plus the failed resets it retried.
    pub async fn reconcile_once(&self, instance_id: &str) -> usize {
        let snapshot = FocusSnapshot::new(self.terminal.list_tabs(instance_id).await);
        if snapshot.is_empty() {
            debug!(event = "reconcile_skipped", instance = %instance_id);
            return 0;
        }

        let (applied, resets) = {
            let mut state = self.state.lock().await;
            let records = state.store.instance_records(instance_id);
            let applied = reconcile(&records, &snapshot)
                .into_iter()
                .filter(|update| apply_update(&mut state.store, update))
                .collect::<Vec<_>>();
            let mut resets = Vec::new();
            for key in state.store.pending_resets(instance_id) {
                if snapshot.focus_of(key.tab_id).is_some() {
                    resets.push(key);
                } else {
                    state.store.reset_done(&key);
                }
            }
            (applied, resets)
        };

        for update in &applied {
            debug!(
                event = "reconcile_update",
                tab = %update.key,
                action = update.action.as_str(),
                from = %update.from,
                to = ?update.to
            );
            if update.needs_paint() {
                self.paint(&update.key, update.to).await;
            }
        }
        for key in &resets {
            debug!(event = "reset_retry", tab = %key);
            self.paint(key, None).await;
        }
        applied.len() + resets.len()
    }

    /// Sends the palette for `color` and reconciles the `painted` flag with
    /// whatever the store holds once the command returns. A failed reset of a
    /// cleared tab stays pending until a later pass gets it through. Returns
    /// false when the terminal rejected the command.
    async fn paint(&self, key: &TabKey, color: Option<TabColor>) -> bool {
        let mut color = color;
        for _ in 0..MAX_PAINT_ATTEMPTS {
            let palette = self.config.palette.for_color(color);
            let result = self
                .terminal
                .apply_color(&key.instance_id, key.tab_id, &palette)
                .await;

            let mut state = self.state.lock().await;
            let current = state.store.color(key);
            if let Err(err) = result {
                match current {
                    Some(current) => state.store.mark_painted(key, current, false),
                    None => state.store.mark_reset_pending(key),
                }
                warn!(event = "paint_failed", tab = %key, color = ?color, error = %err);
                return false;
            }

            let shows_current = self.config.palette.for_color(current) == palette;
            match current {
                Some(current) => {
                    state.store.mark_painted(key, current, shows_current);
                    return true;
                }
                None if shows_current => {
                    state.store.reset_done(key);
                    return true;
                }
                // The record was cleared while the command was in flight.
                None => color = None,
            }
        }
        true
    }
}

/// Sleeps for `duration`. Returns false once shutdown was requested.
async fn pause(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        changed = shutdown.changed() => match changed {
            Ok(()) => !*shutdown.borrow(),
            Err(_) => {
                tokio::time::sleep(duration).await;
                true
            }
        },
    }
}
