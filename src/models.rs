use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single gained (positive) or consumed (negative) stack change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropItem {
    pub item_id: String,
    pub quantity: i64,
    pub timestamp: DateTime<Utc>,
    /// Tax-adjusted value, `None` until a price is known.
    pub value: Option<f64>,
}

impl DropItem {
    pub fn new(item_id: impl Into<String>, quantity: i64, price: Option<f64>) -> Self {
        Self {
            item_id: item_id.into(),
            quantity,
            timestamp: Utc::now(),
            value: price.map(|p| p * quantity as f64),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapRun {
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub drops: Vec<DropItem>,
    #[serde(default)]
    pub is_league_zone: bool,
    /// Flame Elementium spent to open the map.
    #[serde(default)]
    pub investment: f64,
}

impl MapRun {
    pub fn start(is_league_zone: bool) -> Self {
        Self {
            started_at: Utc::now(),
            ended_at: None,
            drops: Vec::new(),
            is_league_zone,
            investment: 0.0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Seconds spent in the map; an open run is measured up to now.
    pub fn duration_secs(&self) -> f64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    pub fn total_value(&self) -> f64 {
        self.drops.iter().filter_map(|d| d.value).sum()
    }

    pub fn total_items(&self) -> i64 {
        self.drops
            .iter()
            .filter(|d| d.quantity > 0)
            .map(|d| d.quantity)
            .sum()
    }

    pub fn net_value(&self) -> f64 {
        self.total_value() - self.investment
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub maps: Vec<MapRun>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            ended_at: None,
            maps: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Gross value of all closed maps, before investment.
    pub fn total_value(&self) -> f64 {
        self.maps.iter().map(MapRun::total_value).sum()
    }

    pub fn total_investment(&self) -> f64 {
        self.maps.iter().map(|m| m.investment).sum()
    }

    pub fn net_value(&self) -> f64 {
        self.total_value() - self.total_investment()
    }

    pub fn total_items(&self) -> i64 {
        self.maps.iter().map(MapRun::total_items).sum()
    }

    /// Time spent inside maps.
    pub fn total_duration_secs(&self) -> f64 {
        self.maps.iter().map(MapRun::duration_secs).sum()
    }

    /// Wall-clock time since the session started.
    pub fn session_duration_secs(&self) -> f64 {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    /// Completed maps, league zones excluded.
    pub fn map_count(&self) -> usize {
        self.maps
            .iter()
            .filter(|m| m.is_finished() && !m.is_league_zone)
            .count()
    }

    pub fn value_per_hour(&self) -> f64 {
        per_hour(self.net_value(), self.session_duration_secs())
    }

    pub fn maps_per_hour(&self) -> f64 {
        per_hour(self.map_count() as f64, self.session_duration_secs())
    }

    pub fn all_drops(&self) -> impl Iterator<Item = &DropItem> {
        self.maps.iter().flat_map(|m| m.drops.iter())
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
            total_value: self.total_value(),
            total_investment: self.total_investment(),
            net_value: self.net_value(),
            total_items: self.total_items(),
            total_duration: self.total_duration_secs(),
            session_duration: self.session_duration_secs(),
            map_count: self.map_count(),
            value_per_hour: self.value_per_hour(),
            maps_per_hour: self.maps_per_hour(),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Derived figures of a session without the map list.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_value: f64,
    pub total_investment: f64,
    pub net_value: f64,
    pub total_items: i64,
    pub total_duration: f64,
    pub session_duration: f64,
    pub map_count: usize,
    pub value_per_hour: f64,
    pub maps_per_hour: f64,
}

pub(crate) fn per_hour(amount: f64, secs: f64) -> f64 {
    let hours = secs / 3600.0;
    if hours > 0.0 {
        amount / hours
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn drop_with(quantity: i64, value: Option<f64>) -> DropItem {
        DropItem {
            item_id: "200100".to_string(),
            quantity,
            timestamp: Utc::now(),
            value,
        }
    }

    #[test]
    fn test_map_net_value() {
        let mut run = MapRun::start(false);
        run.drops.push(drop_with(1, Some(100.0)));
        run.investment = 20.0;
        run.ended_at = Some(Utc::now());
        assert_eq!(run.total_value(), 100.0);
        assert_eq!(run.net_value(), 80.0);
    }

    #[test]
    fn test_map_totals_ignore_missing_values_and_consumption() {
        let mut run = MapRun::start(false);
        run.drops.push(drop_with(5, None));
        run.drops.push(drop_with(3, Some(30.0)));
        run.drops.push(drop_with(-2, Some(-4.0)));
        assert_eq!(run.total_items(), 8);
        assert_eq!(run.total_value(), 26.0);
    }

    #[test]
    fn test_drop_value_from_price() {
        let drop = DropItem::new("C", 4, Some(2.5));
        assert_eq!(drop.value, Some(10.0));
        assert_eq!(DropItem::new("C", 4, None).value, None);
    }

    #[test]
    fn test_session_map_count_skips_league_and_open_maps() {
        let mut session = Session::new();
        let mut done = MapRun::start(false);
        done.ended_at = Some(Utc::now());
        let mut league = MapRun::start(true);
        league.ended_at = Some(Utc::now());
        session.maps.push(done);
        session.maps.push(league);
        session.maps.push(MapRun::start(false));
        assert_eq!(session.map_count(), 1);
    }

    #[test]
    fn test_session_rates() {
        let start = Utc::now() - Duration::hours(2);
        let mut map = MapRun::start(false);
        map.started_at = start;
        map.ended_at = Some(start + Duration::minutes(10));
        map.drops.push(drop_with(1, Some(500.0)));
        map.investment = 100.0;
        let session = Session {
            id: "s".into(),
            started_at: start,
            ended_at: Some(start + Duration::hours(2)),
            maps: vec![map],
        };
        assert_eq!(session.net_value(), 400.0);
        assert!((session.value_per_hour() - 200.0).abs() < 1e-9);
        assert!((session.maps_per_hour() - 0.5).abs() < 1e-9);
        assert!((session.total_duration_secs() - 600.0).abs() < 1e-9);
    }

    #[test]
    fn test_per_hour_zero_duration() {
        assert_eq!(per_hour(10.0, 0.0), 0.0);
    }
}
