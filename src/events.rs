use std::sync::mpsc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::config::DisplayMode;
use crate::prices::PriceStatus;

/// Everything the engine reports to the presentation layer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Initialized {
        item_count: usize,
    },
    MapEnter,
    MapExit,
    Drop {
        item_id: String,
        item_name: String,
        quantity: i64,
        value: Option<f64>,
        price_status: PriceStatus,
    },
    PriceUpdate {
        item_id: String,
        price: f64,
    },
    State(Box<TrackerSnapshot>),
    SessionReset,
    Reset,
    PersistFailed {
        session_id: String,
        error: String,
    },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Initialized { .. } => "initialized",
            Notification::MapEnter => "map_enter",
            Notification::MapExit => "map_exit",
            Notification::Drop { .. } => "drop",
            Notification::PriceUpdate { .. } => "price_update",
            Notification::State(_) => "state",
            Notification::SessionReset => "session_reset",
            Notification::Reset => "reset",
            Notification::PersistFailed { .. } => "persist_failed",
        }
    }
}

// ── Snapshot payload ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackerSnapshot {
    pub initialized: bool,
    pub awaiting_init: bool,
    pub in_map: bool,
    pub display_mode: DisplayMode,
    pub current_map: Option<CurrentMapStats>,
    pub session: Option<SessionStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentMapStats {
    pub duration: f64,
    pub value: f64,
    pub items: i64,
    pub investment: f64,
    pub is_league_zone: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub id: String,
    /// Seconds spent inside maps, including the open one.
    pub duration_mapping: f64,
    /// Wall-clock seconds since the session started.
    pub duration_total: f64,
    pub value: f64,
    pub items: i64,
    pub map_count: usize,
    pub value_per_hour: f64,
    pub maps_per_hour: f64,
    pub drops: Vec<DropView>,
    pub maps: Vec<MapStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DropView {
    pub item_id: String,
    pub item_name: String,
    pub item_type: String,
    pub quantity: i64,
    pub value: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub price_status: PriceStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapStats {
    pub index: usize,
    pub total_value: f64,
    pub duration_seconds: f64,
}

// ── Sinks ─────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("notification receiver disconnected")]
    Disconnected,
}

/// Receiver of engine notifications. Failures are reported back to the engine.
pub trait NotificationSink: Send {
    fn notify(&mut self, notification: &Notification) -> Result<(), SinkError>;
}

/// Forwards notifications over a channel to another thread.
pub struct ChannelSink {
    tx: mpsc::Sender<Notification>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Notification>) -> Self {
        Self { tx }
    }

    pub fn pair() -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel();
        (Self::new(tx), rx)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&mut self, notification: &Notification) -> Result<(), SinkError> {
        self.tx
            .send(notification.clone())
            .map_err(|_| SinkError::Disconnected)
    }
}

/// Writes notable notifications to the log; snapshots are skipped.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&mut self, notification: &Notification) -> Result<(), SinkError> {
        match notification {
            Notification::State(_) => {}
            Notification::Drop {
                item_name,
                quantity,
                value,
                ..
            } => info!(item = %item_name, quantity, value = ?value, "Drop"),
            Notification::PriceUpdate { item_id, price } => {
                info!(item_id = %item_id, price, "Price updated")
            }
            other => info!(event = other.kind(), "Tracker event"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_serialization() {
        let json = serde_json::to_value(Notification::Initialized { item_count: 3 }).unwrap();
        assert_eq!(json["type"], "initialized");
        assert_eq!(json["item_count"], 3);

        let json = serde_json::to_value(Notification::MapEnter).unwrap();
        assert_eq!(json["type"], "map_enter");

        let json = serde_json::to_value(Notification::Drop {
            item_id: "5010".into(),
            item_name: "Compass".into(),
            quantity: -1,
            value: None,
            price_status: PriceStatus::Unknown,
        })
        .unwrap();
        assert_eq!(json["type"], "drop");
        assert!(json["value"].is_null());
        assert_eq!(json["price_status"], "unknown");
    }

    #[test]
    fn test_channel_sink_reports_disconnect() {
        let (mut sink, rx) = ChannelSink::pair();
        sink.notify(&Notification::Reset).unwrap();
        assert_eq!(rx.recv().unwrap().kind(), "reset");
        drop(rx);
        assert!(matches!(
            sink.notify(&Notification::Reset),
            Err(SinkError::Disconnected)
        ));
    }
}
