//! Drop-tracking state machine.
//!
//! Consumes log chunks in arrival order and coordinates the parser, bag state,
//! price book and session history. Every observable change is reported to a
//! [`NotificationSink`].

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::bag::BagState;
use crate::catalog::ItemCatalog;
use crate::config::{Config, DisplayMode};
use crate::events::{
    CurrentMapStats, DropView, MapStats, Notification, NotificationSink, SessionStats,
    TrackerSnapshot,
};
use crate::log_parser::{BagEntry, LogEvent, LogParser, MapChange, ParserSettings, PriceSearch};
use crate::models::{per_hour, DropItem, MapRun, Session};
use crate::prices::PriceBook;
use crate::storage::SessionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Uninitialized,
    AwaitingInit,
    Idle,
    InMap,
}

/// What a single chunk did to the tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkStats {
    pub events: usize,
    pub drops: usize,
    pub price_updates: usize,
    pub map_changes: usize,
}

pub struct Tracker {
    parser: LogParser,
    bag: BagState,
    prices: PriceBook,
    catalog: Arc<ItemCatalog>,
    store: Arc<dyn SessionStore>,
    sink: Box<dyn NotificationSink>,

    initialized: bool,
    awaiting_init: bool,
    current_map: Option<MapRun>,
    current_session: Option<Session>,
    display_mode: DisplayMode,

    min_init_items: usize,
    use_real_time_stats: bool,
    prices_dirty: bool,
}

impl Tracker {
    pub fn new(
        config: &Config,
        catalog: Arc<ItemCatalog>,
        prices: PriceBook,
        store: Arc<dyn SessionStore>,
        sink: Box<dyn NotificationSink>,
    ) -> Self {
        let mut prices = prices;
        prices.set_tax(config.tax());
        Self {
            parser: LogParser::new(ParserSettings::from(config)),
            bag: BagState::new(),
            prices,
            catalog,
            store,
            sink,
            initialized: false,
            awaiting_init: false,
            current_map: None,
            current_session: None,
            display_mode: config.display_mode,
            min_init_items: config.min_init_items,
            use_real_time_stats: config.use_real_time_stats,
            prices_dirty: false,
        }
    }

    // ── Accessors ─────────────────────────────────────────────────────

    pub fn phase(&self) -> Phase {
        if self.awaiting_init {
            Phase::AwaitingInit
        } else if !self.initialized {
            Phase::Uninitialized
        } else if self.current_map.is_some() {
            Phase::InMap
        } else {
            Phase::Idle
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn in_map(&self) -> bool {
        self.current_map.is_some()
    }

    pub fn bag(&self) -> &BagState {
        &self.bag
    }

    pub fn prices(&self) -> &PriceBook {
        &self.prices
    }

    pub fn catalog(&self) -> &ItemCatalog {
        &self.catalog
    }

    pub fn current_map(&self) -> Option<&MapRun> {
        self.current_map.as_ref()
    }

    pub fn current_session(&self) -> Option<&Session> {
        self.current_session.as_ref()
    }

    pub fn display_mode(&self) -> DisplayMode {
        self.display_mode
    }

    pub fn pending_searches(&self) -> usize {
        self.parser.pending_searches()
    }

    /// Whether prices changed since the last call.
    pub fn take_prices_dirty(&mut self) -> bool {
        std::mem::take(&mut self.prices_dirty)
    }

    // ── Log processing ────────────────────────────────────────────────

    /// Main entry point: process one chunk of newly appended log text.
    pub fn process_chunk(&mut self, text: &str) -> ChunkStats {
        let events = self.parser.parse_chunk(text);
        let mut stats = ChunkStats {
            events: events.len(),
            ..ChunkStats::default()
        };

        if self.awaiting_init || !self.initialized {
            let init: Vec<BagEntry> = events
                .iter()
                .filter_map(|ev| match ev {
                    LogEvent::Init(entry) => Some(entry.clone()),
                    _ => None,
                })
                .collect();
            if init.len() >= self.min_init_items {
                self.commit_initialization(&init);
            } else if !init.is_empty() {
                debug!(
                    entries = init.len(),
                    required = self.min_init_items,
                    "Ignoring partial bag snapshot"
                );
            }
        }

        // Consecutive modifications are diffed as one batch.
        let mut batch: Vec<BagEntry> = Vec::new();
        for event in events {
            match event {
                LogEvent::Init(_) => {}
                LogEvent::Modify(entry) => batch.push(entry),
                LogEvent::Map(change) => {
                    stats.drops += self.flush_modifications(&mut batch);
                    stats.map_changes += 1;
                    self.on_map_change(change);
                }
                LogEvent::Price(search) => {
                    stats.drops += self.flush_modifications(&mut batch);
                    if self.on_price_search(search) {
                        stats.price_updates += 1;
                    }
                }
            }
        }
        stats.drops += self.flush_modifications(&mut batch);
        stats
    }

    fn commit_initialization(&mut self, entries: &[BagEntry]) {
        let item_count = self.bag.initialize(entries);
        self.initialized = true;
        self.awaiting_init = false;
        info!(item_count, slots = entries.len(), "Inventory initialized");
        self.emit(Notification::Initialized { item_count });
    }

    fn on_map_change(&mut self, change: MapChange) {
        if change.entering {
            self.on_map_enter(change.is_league_zone);
        } else {
            self.on_map_exit();
        }
    }

    fn on_map_enter(&mut self, is_league_zone: bool) {
        if self.current_map.is_some() {
            debug!("Map enter while already in a map, ignoring");
            return;
        }
        self.bag.reset_baseline();
        self.current_map = Some(MapRun::start(is_league_zone));
        if self.current_session.is_none() {
            let session = self.store.create();
            info!(session_id = %session.id, "Session started");
            self.current_session = Some(session);
        }
        info!(is_league_zone, "Entered map");
        self.emit(Notification::MapEnter);
        self.emit_state();
    }

    fn on_map_exit(&mut self) {
        let Some(mut map) = self.current_map.take() else {
            debug!("Map exit without an open map, ignoring");
            return;
        };
        map.ended_at = Some(Utc::now());
        info!(
            duration = map.duration_secs(),
            value = map.total_value(),
            drops = map.drops.len(),
            "Exited map"
        );
        if let Some(session) = self.current_session.as_mut() {
            session.maps.push(map);
        }
        self.persist_session();
        self.emit(Notification::MapExit);
        self.emit_state();
    }

    /// Diff and record a batch of slot updates. Returns the number of drops recorded.
    fn flush_modifications(&mut self, batch: &mut Vec<BagEntry>) -> usize {
        if batch.is_empty() {
            return 0;
        }
        let mutations = std::mem::take(batch);
        if !self.initialized {
            return 0;
        }
        let changes = self.bag.apply_and_diff(&mutations);
        if changes.is_empty() {
            return 0;
        }
        if self.current_map.is_none() {
            debug!(items = changes.len(), "Inventory changed outside a map, not recorded");
            return 0;
        }

        let mut recorded = 0;
        for (item_id, quantity) in changes {
            // Gear, memories and other untradeable items are not valued.
            let Some(info) = self.catalog.lookup(&item_id) else {
                debug!(item_id = %item_id, quantity, "Skipping unknown item");
                continue;
            };
            let item_name = info.name.clone();
            let price = self.prices.get_price_with_tax(&item_id);
            let price_status = self.prices.price_status(&item_id);
            let drop = DropItem::new(item_id.clone(), quantity, price);
            let value = drop.value;
            if let Some(map) = self.current_map.as_mut() {
                map.drops.push(drop);
            }
            recorded += 1;
            self.emit(Notification::Drop {
                item_id,
                item_name,
                quantity,
                value,
                price_status,
            });
        }
        self.emit_state();
        recorded
    }

    /// Returns `true` when the price book was updated.
    fn on_price_search(&mut self, search: PriceSearch) -> bool {
        let Some(price) = self.prices.update_from_search(&search.item_id, &search.samples) else {
            return false;
        };
        info!(
            item_id = %search.item_id,
            price,
            samples = search.samples.len(),
            raw_samples = search.raw_sample_count,
            batch_average = search.average,
            "Price updated from auction search"
        );
        self.prices_dirty = true;
        self.backfill_prices(&search.item_id);
        self.emit(Notification::PriceUpdate {
            item_id: search.item_id,
            price,
        });
        self.emit_state();
        true
    }

    /// Re-value every drop of `item_id` recorded so far in this session.
    fn backfill_prices(&mut self, item_id: &str) {
        let Some(price) = self.prices.get_price_with_tax(item_id) else {
            return;
        };
        let closed = self
            .current_session
            .iter_mut()
            .flat_map(|s| s.maps.iter_mut());
        for map in closed.chain(self.current_map.iter_mut()) {
            for drop in map.drops.iter_mut().filter(|d| d.item_id == item_id) {
                drop.value = Some(price * drop.quantity as f64);
            }
        }
        self.persist_session();
    }

    fn persist_session(&mut self) {
        let Some(session) = self.current_session.as_ref() else {
            return;
        };
        if let Err(e) = self.store.save(session) {
            let session_id = session.id.clone();
            error!(session_id = %session_id, error = %e, "Failed to save session");
            self.emit(Notification::PersistFailed {
                session_id,
                error: e.to_string(),
            });
        }
    }

    // ── Commands ──────────────────────────────────────────────────────

    /// Forget the inventory and wait for the player to sort their bag.
    pub fn request_initialization(&mut self) {
        self.bag.clear();
        self.initialized = false;
        self.awaiting_init = true;
        info!("Waiting for bag sort to initialize inventory");
        self.emit_state();
    }

    /// Accepts `"value"` or `"items"`; anything else is ignored.
    pub fn set_display_mode(&mut self, mode: &str) {
        match mode.parse::<DisplayMode>() {
            Ok(mode) => {
                self.display_mode = mode;
                self.emit_state();
            }
            Err(e) => debug!(error = %e, "Ignoring display mode"),
        }
    }

    /// Record the Flame Elementium spent on the open map.
    pub fn set_investment(&mut self, investment: f64) -> bool {
        let Some(map) = self.current_map.as_mut() else {
            return false;
        };
        map.investment = investment;
        self.emit_state();
        true
    }

    /// Manual price override.
    pub fn set_price(&mut self, item_id: &str, price: f64) {
        self.prices.set_price(item_id, price);
        self.prices_dirty = true;
        self.emit_state();
    }

    pub fn remove_price(&mut self, item_id: &str) -> bool {
        let removed = self.prices.remove_price(item_id);
        self.prices_dirty |= removed;
        removed
    }

    /// Close and persist the current session; the inventory stays initialized.
    pub fn reset_session(&mut self) {
        if let Some(session) = self.current_session.as_mut() {
            session.ended_at = Some(Utc::now());
            info!(session_id = %session.id, "Session closed");
        }
        self.persist_session();
        self.current_session = None;
        self.current_map = None;
        self.emit(Notification::SessionReset);
        self.emit_state();
    }

    /// Drop all tracking state.
    pub fn reset_all(&mut self) {
        self.bag.clear();
        self.parser.clear_pending();
        self.initialized = false;
        self.awaiting_init = false;
        self.current_map = None;
        self.current_session = None;
        self.display_mode = DisplayMode::default();
        info!("Tracker reset");
        self.emit(Notification::Reset);
        self.emit_state();
    }

    pub fn update_config(&mut self, config: &Config) {
        self.prices.set_tax(config.tax());
        self.min_init_items = config.min_init_items;
        self.use_real_time_stats = config.use_real_time_stats;
        self.parser.set_settings(ParserSettings::from(config));
        self.emit_state();
    }

    // ── Snapshot ──────────────────────────────────────────────────────

    pub fn snapshot(&self) -> TrackerSnapshot {
        let current_map = self.current_map.as_ref().map(|m| CurrentMapStats {
            duration: m.duration_secs(),
            value: m.total_value(),
            items: m.total_items(),
            investment: m.investment,
            is_league_zone: m.is_league_zone,
        });
        let session = self
            .current_session
            .as_ref()
            .map(|s| self.session_stats(s, current_map.as_ref()));

        TrackerSnapshot {
            initialized: self.initialized,
            awaiting_init: self.awaiting_init,
            in_map: self.current_map.is_some(),
            display_mode: self.display_mode,
            current_map,
            session,
        }
    }

    fn session_stats(&self, session: &Session, open: Option<&CurrentMapStats>) -> SessionStats {
        let open_map = self.current_map.as_ref();
        let drops = session
            .all_drops()
            .chain(open_map.into_iter().flat_map(|m| m.drops.iter()))
            .map(|d| self.drop_view(d))
            .collect();

        let (value, items, value_per_hour, maps_per_hour) = if self.use_real_time_stats {
            // Live figures: include the open map, rate over wall-clock time.
            let open_value = open.map_or(0.0, |m| m.value);
            let open_net = open.map_or(0.0, |m| m.value - m.investment);
            let secs = session.session_duration_secs();
            (
                session.total_value() + open_value,
                session.total_items() + open.map_or(0, |m| m.items),
                per_hour(session.net_value() + open_net, secs),
                per_hour(session.map_count() as f64, secs),
            )
        } else {
            (
                session.total_value(),
                session.total_items(),
                session.value_per_hour(),
                session.maps_per_hour(),
            )
        };

        SessionStats {
            id: session.id.clone(),
            duration_mapping: session.total_duration_secs() + open.map_or(0.0, |m| m.duration),
            duration_total: session.session_duration_secs(),
            value,
            items,
            map_count: session.map_count(),
            value_per_hour,
            maps_per_hour,
            drops,
            maps: session
                .maps
                .iter()
                .enumerate()
                .filter(|(_, m)| m.is_finished() && !m.is_league_zone)
                .map(|(index, m)| MapStats {
                    index,
                    total_value: m.total_value(),
                    duration_seconds: m.duration_secs(),
                })
                .collect(),
        }
    }

    fn drop_view(&self, drop: &DropItem) -> DropView {
        DropView {
            item_id: drop.item_id.clone(),
            item_name: self.catalog.name(&drop.item_id),
            item_type: self.catalog.item_type(&drop.item_id),
            quantity: drop.quantity,
            value: drop.value,
            timestamp: drop.timestamp,
            price_status: self.prices.price_status(&drop.item_id),
        }
    }

    // ── Notifications ─────────────────────────────────────────────────

    fn emit(&mut self, notification: Notification) {
        if let Err(e) = self.sink.notify(&notification) {
            warn!(event = notification.kind(), error = %e, "Notification not delivered");
        }
    }

    fn emit_state(&mut self) {
        let snapshot = self.snapshot();
        self.emit(Notification::State(Box::new(snapshot)));
    }
}
