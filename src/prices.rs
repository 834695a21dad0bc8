use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::FLAME_ELEMENTIUM_ID;
use crate::config::TaxPolicy;

/// Items whose value is fixed. Flame Elementium is the unit of account.
pub const PINNED_PRICES: &[(&str, f64)] = &[(FLAME_ELEMENTIUM_ID, 1.0)];

/// Below this many samples the spread cannot be estimated; use the median.
const MIN_ROBUST_SAMPLES: usize = 5;
const MODIFIED_Z_SCALE: f64 = 0.6745;
const MODIFIED_Z_CUTOFF: f64 = 3.5;
/// Relative tolerance used when more than half the samples are identical.
const FLAT_TOLERANCE: f64 = 0.05;
const FLAT_TOLERANCE_FLOOR: f64 = 0.01;

const FRESH_SECS: i64 = 180;
const STALE_SECS: i64 = 900;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub price: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceStatus {
    Fresh,
    Stale,
    Old,
    Unknown,
}

impl PriceStatus {
    fn from_age(age_secs: Option<i64>) -> Self {
        match age_secs {
            None => PriceStatus::Unknown,
            Some(a) if a < FRESH_SECS => PriceStatus::Fresh,
            Some(a) if a < STALE_SECS => PriceStatus::Stale,
            Some(_) => PriceStatus::Old,
        }
    }
}

pub fn pinned_price(item_id: &str) -> Option<f64> {
    PINNED_PRICES
        .iter()
        .find(|(id, _)| *id == item_id)
        .map(|(_, p)| *p)
}

/// Local price database fed by auction house searches.
#[derive(Debug, Clone)]
pub struct PriceBook {
    records: HashMap<String, PriceRecord>,
    tax: TaxPolicy,
}

impl Default for PriceBook {
    fn default() -> Self {
        Self::new(TaxPolicy::default())
    }
}

impl PriceBook {
    pub fn new(tax: TaxPolicy) -> Self {
        Self::from_records(HashMap::new(), tax)
    }

    /// Restore saved records; pinned prices are always re-stamped.
    pub fn from_records(mut records: HashMap<String, PriceRecord>, tax: TaxPolicy) -> Self {
        let now = Utc::now();
        for (item_id, price) in PINNED_PRICES {
            records.insert(
                item_id.to_string(),
                PriceRecord {
                    price: *price,
                    updated_at: now,
                },
            );
        }
        Self { records, tax }
    }

    pub fn records(&self) -> &HashMap<String, PriceRecord> {
        &self.records
    }

    pub fn tax(&self) -> TaxPolicy {
        self.tax
    }

    pub fn set_tax(&mut self, tax: TaxPolicy) {
        self.tax = tax;
    }

    pub fn get_price(&self, item_id: &str) -> Option<f64> {
        self.records.get(item_id).map(|r| r.price)
    }

    /// Price after the auction house fee; the currency itself is never taxed.
    pub fn get_price_with_tax(&self, item_id: &str) -> Option<f64> {
        let price = self.get_price(item_id)?;
        if self.tax.enabled && item_id != FLAME_ELEMENTIUM_ID {
            Some(price * (1.0 - self.tax.rate))
        } else {
            Some(price)
        }
    }

    /// Manual override. Pinned items are left untouched.
    pub fn set_price(&mut self, item_id: &str, price: f64) {
        self.set_price_at(item_id, price, Utc::now());
    }

    fn set_price_at(&mut self, item_id: &str, price: f64, now: DateTime<Utc>) {
        if pinned_price(item_id).is_some() {
            return;
        }
        self.records.insert(
            item_id.to_string(),
            PriceRecord {
                price: (price * 10_000.0).round() / 10_000.0,
                updated_at: now,
            },
        );
    }

    pub fn remove_price(&mut self, item_id: &str) -> bool {
        if pinned_price(item_id).is_some() {
            return false;
        }
        self.records.remove(item_id).is_some()
    }

    /// Fold an auction search into a single estimate and store it.
    ///
    /// Uses the median absolute deviation to drop listings such as 9999
    /// price-fixing or accidental 1-unit posts; unlike an IQR filter it holds
    /// up when more than a quarter of the listings are bogus.
    pub fn update_from_search(&mut self, item_id: &str, samples: &[f64]) -> Option<f64> {
        if let Some(pinned) = pinned_price(item_id) {
            return Some(pinned);
        }
        let estimate = robust_estimate(samples)?;
        self.set_price_at(item_id, estimate, Utc::now());
        debug!(item_id, samples = samples.len(), estimate, "Price estimated");
        Some(estimate)
    }

    pub fn price_age_secs(&self, item_id: &str) -> Option<i64> {
        self.price_age_secs_at(item_id, Utc::now())
    }

    pub fn price_age_secs_at(&self, item_id: &str, now: DateTime<Utc>) -> Option<i64> {
        self.records
            .get(item_id)
            .map(|r| (now - r.updated_at).num_seconds())
    }

    pub fn price_status(&self, item_id: &str) -> PriceStatus {
        self.price_status_at(item_id, Utc::now())
    }

    pub fn price_status_at(&self, item_id: &str, now: DateTime<Utc>) -> PriceStatus {
        PriceStatus::from_age(self.price_age_secs_at(item_id, now))
    }
}

/// Median/MAD filtered mean of the samples; `None` for an empty batch.
pub fn robust_estimate(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    let median = median_of_sorted(&sorted);
    if sorted.len() < MIN_ROBUST_SAMPLES {
        return Some(median);
    }

    let mut deviations: Vec<f64> = sorted.iter().map(|p| (p - median).abs()).collect();
    deviations.sort_by(f64::total_cmp);
    let mad = median_of_sorted(&deviations);

    let kept: Vec<f64> = if mad == 0.0 {
        let threshold = if median > 0.0 {
            median * FLAT_TOLERANCE
        } else {
            FLAT_TOLERANCE_FLOOR
        };
        sorted
            .iter()
            .copied()
            .filter(|p| (p - median).abs() <= threshold)
            .collect()
    } else {
        sorted
            .iter()
            .copied()
            .filter(|p| MODIFIED_Z_SCALE * (p - median).abs() / mad <= MODIFIED_Z_CUTOFF)
            .collect()
    };

    if kept.is_empty() {
        Some(median)
    } else {
        Some(kept.iter().sum::<f64>() / kept.len() as f64)
    }
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    let mid = n / 2;
    if n % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const EPS: f64 = 1e-9;

    #[test]
    fn test_outlier_filtered() {
        let mut book = PriceBook::default();
        let price = book
            .update_from_search("B", &[10.0, 10.0, 10.0, 10.0, 9999.0])
            .unwrap();
        assert!((price - 10.0).abs() < EPS);
        assert_eq!(book.get_price("B"), Some(10.0));
    }

    #[test]
    fn test_majority_value_wins_with_heavy_contamination() {
        let samples = [
            50.0, 50.0, 50.0, 50.0, 50.0, 50.0, 1.0, 9999.0, 9999.0, 5000.0, 0.5,
        ];
        let estimate = robust_estimate(&samples).unwrap();
        assert!((estimate - 50.0).abs() < 1e-6);
    }

    #[test]
    fn test_small_batch_uses_median() {
        assert_eq!(robust_estimate(&[1.0, 100.0, 3.0]), Some(3.0));
        assert_eq!(robust_estimate(&[1.0, 2.0, 3.0, 100.0]), Some(2.5));
        assert_eq!(robust_estimate(&[]), None);
    }

    #[test]
    fn test_mad_filter_keeps_spread() {
        // median 12.5, MAD 1.5; 100 scores ~39 and is dropped
        let estimate = robust_estimate(&[10.0, 11.0, 12.0, 13.0, 14.0, 100.0]).unwrap();
        assert!((estimate - 12.0).abs() < EPS);
    }

    #[test]
    fn test_zero_median_floor() {
        let estimate = robust_estimate(&[0.0, 0.0, 0.0, 0.005, 7.0]).unwrap();
        assert!((estimate - 0.00125).abs() < EPS);
    }

    #[test]
    fn test_pinned_item_is_fixed() {
        let mut book = PriceBook::default();
        assert_eq!(
            book.update_from_search(FLAME_ELEMENTIUM_ID, &[3.0, 4.0]),
            Some(1.0)
        );
        book.set_price(FLAME_ELEMENTIUM_ID, 42.0);
        assert_eq!(book.get_price(FLAME_ELEMENTIUM_ID), Some(1.0));
        assert!(!book.remove_price(FLAME_ELEMENTIUM_ID));
    }

    #[test]
    fn test_tax_applied_except_currency() {
        let mut book = PriceBook::new(TaxPolicy {
            enabled: true,
            rate: 0.125,
        });
        book.set_price("C", 8.0);
        assert_eq!(book.get_price_with_tax("C"), Some(7.0));
        assert_eq!(book.get_price_with_tax(FLAME_ELEMENTIUM_ID), Some(1.0));
        assert_eq!(book.get_price_with_tax("missing"), None);
        book.set_tax(TaxPolicy::default());
        assert_eq!(book.get_price_with_tax("C"), Some(8.0));
    }

    #[test]
    fn test_set_price_rounds() {
        let mut book = PriceBook::default();
        book.set_price("D", 1.234567);
        assert_eq!(book.get_price("D"), Some(1.2346));
    }

    #[test]
    fn test_price_status_thresholds() {
        let mut book = PriceBook::default();
        let now = Utc::now();
        book.set_price_at("E", 2.0, now);
        assert_eq!(book.price_status_at("E", now + Duration::seconds(60)), PriceStatus::Fresh);
        assert_eq!(book.price_status_at("E", now + Duration::seconds(180)), PriceStatus::Stale);
        assert_eq!(book.price_status_at("E", now + Duration::seconds(899)), PriceStatus::Stale);
        assert_eq!(book.price_status_at("E", now + Duration::seconds(900)), PriceStatus::Old);
        assert_eq!(book.price_status_at("nope", now), PriceStatus::Unknown);
    }

    #[test]
    fn test_from_records_restamps_pinned() {
        let mut saved = HashMap::new();
        saved.insert(
            FLAME_ELEMENTIUM_ID.to_string(),
            PriceRecord {
                price: 9.0,
                updated_at: Utc::now() - Duration::days(3),
            },
        );
        let book = PriceBook::from_records(saved, TaxPolicy::default());
        assert_eq!(book.get_price(FLAME_ELEMENTIUM_ID), Some(1.0));
        assert_eq!(book.price_status(FLAME_ELEMENTIUM_ID), PriceStatus::Fresh);
    }
}
