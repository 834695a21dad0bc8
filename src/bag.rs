use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::log_parser::BagEntry;

/// (page, slot, item id)
type SlotKey = (u32, u32, String);

/// Inventory state and net per-item change detection.
///
/// Slots are keyed by page, slot *and* item id because stacks move, split and
/// merge freely; only per-item totals are meaningful. The baseline holds the
/// totals that subsequent changes are measured against.
#[derive(Debug, Default)]
pub struct BagState {
    slots: HashMap<SlotKey, u32>,
    baseline: HashMap<String, i64>,
    initialized: bool,
}

impl BagState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Replace all state with a full snapshot. Returns the number of distinct items.
    pub fn initialize(&mut self, entries: &[BagEntry]) -> usize {
        self.slots.clear();
        for entry in entries {
            self.slots.insert(slot_key(entry), entry.quantity);
        }
        self.baseline = self.totals();
        self.initialized = true;
        debug!(slots = self.slots.len(), items = self.baseline.len(), "Bag initialized");
        self.baseline.len()
    }

    /// Re-anchor the baseline to the current slot contents.
    pub fn reset_baseline(&mut self) {
        self.baseline = self.totals();
    }

    /// Apply slot updates and return the net change of every item whose total
    /// moved away from the baseline. Reported items have their baseline
    /// advanced so the same change is never reported twice.
    pub fn apply_and_diff(&mut self, mutations: &[BagEntry]) -> BTreeMap<String, i64> {
        let mut changes = BTreeMap::new();
        if !self.initialized {
            return changes;
        }

        for entry in mutations {
            self.slots.insert(slot_key(entry), entry.quantity);
        }

        let current = self.totals();
        let mut item_ids: Vec<&String> = current.keys().chain(self.baseline.keys()).collect();
        item_ids.sort();
        item_ids.dedup();

        for item_id in item_ids {
            let now = current.get(item_id).copied().unwrap_or(0);
            let before = self.baseline.get(item_id).copied().unwrap_or(0);
            if now != before {
                changes.insert(item_id.clone(), now - before);
            }
        }
        for (item_id, delta) in &changes {
            let now = self.baseline.get(item_id).copied().unwrap_or(0) + delta;
            self.baseline.insert(item_id.clone(), now);
        }
        changes
    }

    /// Current total held of one item.
    pub fn item_count(&self, item_id: &str) -> i64 {
        self.slots
            .iter()
            .filter(|((_, _, id), _)| id == item_id)
            .map(|(_, &n)| n as i64)
            .sum()
    }

    /// Current totals for all items.
    pub fn totals(&self) -> HashMap<String, i64> {
        let mut totals: HashMap<String, i64> = HashMap::new();
        for ((_, _, item_id), &quantity) in &self.slots {
            *totals.entry(item_id.clone()).or_insert(0) += quantity as i64;
        }
        totals
    }

    pub fn baseline_of(&self, item_id: &str) -> Option<i64> {
        self.baseline.get(item_id).copied()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.baseline.clear();
        self.initialized = false;
    }
}

fn slot_key(entry: &BagEntry) -> SlotKey {
    (entry.page_id, entry.slot_id, entry.item_id.clone())
}
