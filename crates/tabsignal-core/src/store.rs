use crate::{merge, now_ms, Merge, TabColor, TabKey, TabState, WindowKey};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Result of a `set` request against the stored color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetOutcome {
    pub previous: Option<TabColor>,
    pub merge: Merge,
}

impl SetOutcome {
    pub fn applied(&self) -> bool {
        self.merge.is_applied()
    }

    /// Applied and moved the record to a different color.
    pub fn changed(&self) -> bool {
        self.applied() && self.previous != Some(self.merge.color())
    }
}

/// Keyed record of every tab's indicator color plus the window fast-path hints.
/// Hints only ever point at live records.
#[derive(Debug, Default)]
pub struct ColorStore {
    records: BTreeMap<TabKey, TabState>,
    hints: HashMap<WindowKey, TabKey>,
    // Cleared tabs whose reset the terminal has not accepted yet.
    pending_resets: BTreeSet<TabKey>,
}

impl ColorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &TabKey, color: TabColor) -> SetOutcome {
        let previous = self.records.get(key).map(|record| record.color);
        let outcome = merge(previous, color);
        if outcome.is_applied() {
            self.pending_resets.remove(key);
            let painted = self
                .records
                .get(key)
                .map(|record| record.painted && record.color == color)
                .unwrap_or(false);
            self.records.insert(
                key.clone(),
                TabState {
                    instance_id: key.instance_id.clone(),
                    tab_id: key.tab_id,
                    color,
                    painted,
                    updated_at_ms: now_ms(),
                },
            );
        }
        SetOutcome {
            previous,
            merge: outcome,
        }
    }

    pub fn get(&self, key: &TabKey) -> Option<&TabState> {
        self.records.get(key)
    }

    pub fn color(&self, key: &TabKey) -> Option<TabColor> {
        self.records.get(key).map(|record| record.color)
    }

    /// Removes the record and every hint that points at it.
    pub fn clear(&mut self, key: &TabKey) -> Option<TabState> {
        let removed = self.records.remove(key);
        self.hints.retain(|_, target| target != key);
        removed
    }

    /// Compare-and-set used by the reconciler: only moves the record when it
    /// still holds `from`. `to == None` clears it.
    pub fn transition(&mut self, key: &TabKey, from: TabColor, to: Option<TabColor>) -> bool {
        if self.color(key) != Some(from) {
            return false;
        }
        match to {
            Some(color) => {
                if let Some(record) = self.records.get_mut(key) {
                    if record.color != color {
                        record.painted = false;
                    }
                    record.color = color;
                    record.updated_at_ms = now_ms();
                }
            }
            None => {
                self.clear(key);
            }
        }
        true
    }

    /// Records that the terminal now shows `color` for `key`. Ignored when the
    /// record moved on in the meantime.
    pub fn mark_painted(&mut self, key: &TabKey, color: TabColor, painted: bool) {
        if let Some(record) = self.records.get_mut(key) {
            if record.color == color {
                record.painted = painted;
            }
        }
    }

    pub fn instance_records(&self, instance_id: &str) -> Vec<TabState> {
        self.records
            .values()
            .filter(|record| record.instance_id == instance_id)
            .cloned()
            .collect()
    }

    pub fn has_instance_records(&self, instance_id: &str) -> bool {
        self.records
            .keys()
            .any(|key| key.instance_id == instance_id)
    }

    pub fn clear_instance(&mut self, instance_id: &str) -> Vec<TabState> {
        let keys = self
            .records
            .keys()
            .filter(|key| key.instance_id == instance_id)
            .cloned()
            .collect::<Vec<_>>();
        keys.iter().filter_map(|key| self.clear(key)).collect()
    }

    pub fn all_records(&self) -> Vec<TabState> {
        self.records.values().cloned().collect()
    }

    /// No records and no outstanding resets.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.pending_resets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Points `window` at `key`. Ignored unless `key` has a record.
    pub fn remember_window(&mut self, window: WindowKey, key: TabKey) {
        if self.records.contains_key(&key) {
            self.hints.insert(window, key);
        }
    }

    pub fn hint_count(&self) -> usize {
        self.hints.len()
    }

    /// Flags a cleared tab whose reset failed. Ignored while a record exists,
    /// since the record's `painted` flag already drives the repaint.
    pub fn mark_reset_pending(&mut self, key: &TabKey) {
        if !self.records.contains_key(key) {
            self.pending_resets.insert(key.clone());
        }
    }

    pub fn reset_done(&mut self, key: &TabKey) -> bool {
        self.pending_resets.remove(key)
    }

    pub fn pending_resets(&self, instance_id: &str) -> Vec<TabKey> {
        self.pending_resets
            .iter()
            .filter(|key| key.instance_id == instance_id)
            .cloned()
            .collect()
    }

    pub fn has_pending_resets(&self, instance_id: &str) -> bool {
        self.pending_resets
            .iter()
            .any(|key| key.instance_id == instance_id)
    }

    /// Color of the tab a window last resolved to, when that record still exists.
    pub fn hinted_color(&self, window: &WindowKey) -> Option<TabColor> {
        self.hints.get(window).and_then(|key| self.color(key))
    }

    pub fn hinted_key(&self, window: &WindowKey) -> Option<&TabKey> {
        self.hints.get(window)
    }
}
