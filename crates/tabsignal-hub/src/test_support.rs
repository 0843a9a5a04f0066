use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tabsignal_core::{TabFocus, TabPalette};
use tabsignal_kitty::{TerminalControl, TerminalError, TerminalFuture};
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaintCall {
    pub instance_id: String,
    pub tab_id: u64,
    pub palette: TabPalette,
}

#[derive(Default)]
struct FakeState {
    // (instance, window) -> tab
    windows: HashMap<(String, u64), u64>,
    // (instance, tab) -> focused
    tabs: BTreeMap<(String, u64), bool>,
    paints: Vec<PaintCall>,
    fail_paint: bool,
    hold: Option<Arc<Notify>>,
    holding: bool,
    list_calls: usize,
    resolve_calls: usize,
}

/// Scripted terminal that records every command it receives.
#[derive(Default)]
pub struct FakeTerminal {
    state: Mutex<FakeState>,
}

impl FakeTerminal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut *guard)
    }

    pub fn add_window(&self, instance_id: &str, window_id: u64, tab_id: u64) {
        self.with(|state| {
            state
                .windows
                .insert((instance_id.to_string(), window_id), tab_id);
            state
                .tabs
                .entry((instance_id.to_string(), tab_id))
                .or_insert(false);
        });
    }

    /// Focuses `tab_id` and unfocuses every other tab of the instance.
    pub fn focus_tab(&self, instance_id: &str, tab_id: u64) {
        self.with(|state| {
            for ((instance, tab), focused) in state.tabs.iter_mut() {
                if instance == instance_id {
                    *focused = *tab == tab_id;
                }
            }
        });
    }

    pub fn blur_all(&self, instance_id: &str) {
        self.with(|state| {
            for ((instance, _), focused) in state.tabs.iter_mut() {
                if instance == instance_id {
                    *focused = false;
                }
            }
        });
    }

    pub fn close_tab(&self, instance_id: &str, tab_id: u64) {
        self.with(|state| {
            state.tabs.remove(&(instance_id.to_string(), tab_id));
            state
                .windows
                .retain(|(instance, _), tab| !(instance == instance_id && *tab == tab_id));
        });
    }

    pub fn set_fail_paint(&self, fail: bool) {
        self.with(|state| state.fail_paint = fail);
    }

    /// The next `apply_color` waits for the returned gate before it lands.
    pub fn hold_next_paint(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.with(|state| {
            state.hold = Some(gate.clone());
            state.holding = false;
        });
        gate
    }

    /// A paint is parked on the gate from `hold_next_paint`.
    pub fn paint_held(&self) -> bool {
        self.with(|state| state.holding)
    }

    pub fn paints(&self) -> Vec<PaintCall> {
        self.with(|state| state.paints.clone())
    }

    pub fn paints_for(&self, tab_id: u64) -> Vec<TabPalette> {
        self.with(|state| {
            state
                .paints
                .iter()
                .filter(|call| call.tab_id == tab_id)
                .map(|call| call.palette.clone())
                .collect()
        })
    }

    pub fn list_calls(&self) -> usize {
        self.with(|state| state.list_calls)
    }

    pub fn resolve_calls(&self) -> usize {
        self.with(|state| state.resolve_calls)
    }
}

impl TerminalControl for FakeTerminal {
    fn list_tabs<'a>(&'a self, instance_id: &'a str) -> TerminalFuture<'a, Vec<TabFocus>> {
        Box::pin(async move {
            self.with(|state| {
                state.list_calls += 1;
                state
                    .tabs
                    .iter()
                    .filter(|((instance, _), _)| instance == instance_id)
                    .map(|((_, tab_id), focused)| TabFocus {
                        tab_id: *tab_id,
                        focused: *focused,
                    })
                    .collect()
            })
        })
    }

    fn resolve_window<'a>(
        &'a self,
        instance_id: &'a str,
        window_id: u64,
    ) -> TerminalFuture<'a, Option<TabFocus>> {
        Box::pin(async move {
            self.with(|state| {
                state.resolve_calls += 1;
                let tab_id = *state.windows.get(&(instance_id.to_string(), window_id))?;
                let focused = *state.tabs.get(&(instance_id.to_string(), tab_id))?;
                Some(TabFocus { tab_id, focused })
            })
        })
    }

    fn apply_color<'a>(
        &'a self,
        instance_id: &'a str,
        tab_id: u64,
        palette: &'a TabPalette,
    ) -> TerminalFuture<'a, Result<(), TerminalError>> {
        Box::pin(async move {
            let gate = self.with(|state| {
                let gate = state.hold.take();
                if gate.is_some() {
                    state.holding = true;
                }
                gate
            });
            if let Some(gate) = gate {
                gate.notified().await;
                self.with(|state| state.holding = false);
            }
            self.with(|state| {
                if state.fail_paint {
                    return Err(TerminalError::Failed {
                        status: "exit status: 1".to_string(),
                        stderr: "scripted failure".to_string(),
                    });
                }
                state.paints.push(PaintCall {
                    instance_id: instance_id.to_string(),
                    tab_id,
                    palette: palette.clone(),
                });
                Ok(())
            })
        })
    }

    fn read_screen_text<'a>(
        &'a self,
        _instance_id: &'a str,
        window_id: u64,
    ) -> TerminalFuture<'a, Result<String, TerminalError>> {
        Box::pin(async move { Ok(format!("screen of window {window_id}")) })
    }
}
