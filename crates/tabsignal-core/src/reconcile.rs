//! Pure focus reconciliation: stored colors plus a live focus snapshot in,
//! color updates out. No terminal or store access happens here.

use crate::store::ColorStore;
use crate::{FocusSnapshot, TabColor, TabKey, TabState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Focused blue tab: hide the in-progress indicator while the user looks.
    Suspend,
    /// Paused blue tab lost focus: show the in-progress indicator again.
    Resume,
    /// Focused red/yellow tab: the signal has been seen.
    Dismiss,
    /// Nothing changes but the last visible update failed.
    Repaint,
    /// The tab no longer exists in the terminal.
    Forget,
}

impl ReconcileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileAction::Suspend => "suspend",
            ReconcileAction::Resume => "resume",
            ReconcileAction::Dismiss => "dismiss",
            ReconcileAction::Repaint => "repaint",
            ReconcileAction::Forget => "forget",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorUpdate {
    pub key: TabKey,
    pub action: ReconcileAction,
    pub from: TabColor,
    pub to: Option<TabColor>,
}

impl ColorUpdate {
    pub fn needs_paint(&self) -> bool {
        !matches!(self.action, ReconcileAction::Forget)
    }
}

pub fn reconcile(records: &[TabState], snapshot: &FocusSnapshot) -> Vec<ColorUpdate> {
    // An empty snapshot means the focus query failed; never act on it.
    if snapshot.is_empty() {
        return Vec::new();
    }
    records
        .iter()
        .filter_map(|record| plan_record(record, snapshot))
        .collect()
}

fn plan_record(record: &TabState, snapshot: &FocusSnapshot) -> Option<ColorUpdate> {
    let update = |action, to| ColorUpdate {
        key: record.key(),
        action,
        from: record.color,
        to,
    };

    let Some(focused) = snapshot.focus_of(record.tab_id) else {
        return Some(update(ReconcileAction::Forget, None));
    };

    match (focused, record.color) {
        (true, TabColor::Blue) => Some(update(
            ReconcileAction::Suspend,
            Some(TabColor::BluePaused),
        )),
        (true, TabColor::Red | TabColor::Yellow) => Some(update(ReconcileAction::Dismiss, None)),
        (false, TabColor::BluePaused) => {
            Some(update(ReconcileAction::Resume, Some(TabColor::Blue)))
        }
        (_, color) if !record.painted => Some(update(ReconcileAction::Repaint, Some(color))),
        _ => None,
    }
}

/// Applies one update with compare-and-set on the color the reconciler saw.
/// Returns false when a concurrent mutation already moved the record.
pub fn apply_update(store: &mut ColorStore, update: &ColorUpdate) -> bool {
    match update.action {
        ReconcileAction::Repaint => store.color(&update.key) == Some(update.from),
        _ => store.transition(&update.key, update.from, update.to),
    }
}
