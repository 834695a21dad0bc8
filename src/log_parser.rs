use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{Config, DEFAULT_LEAGUE_PREFIXES, DEFAULT_REFUGE_SCENE};

/// Auction samples beyond this count are ignored (listings arrive cheapest first).
pub const MAX_PRICE_SAMPLES: usize = 30;

const BAG_MODIFY_MARKER: &str = "BagMgr@:Modfy BagItem";
const BAG_INIT_MARKER: &str = "BagMgr@:InitBagData";
const SCENE_CHANGE_MARKER: &str = "PageApplyBase@ _UpdateGameEnd:";
const LAST_SCENE_FIELD: &str = "LastSceneName = World'/Game/Art/Maps/";
const NEXT_SCENE_FIELD: &str = "NextSceneName = World'/Game/Art/Maps/";
const PRICE_SEARCH_MARKER: &str = "XchgSearchPrice----SynId";
const PRICE_RESPONSE_MARKER: &str = "RecvMessage";
const PRICE_BLOCK_END_MARKERS: &[&str] = &["SendMessage End", "RecvMessage End"];
const PRICE_REFER_FIELD: &str = "+refer [";

// ── Parsed event types ────────────────────────────────────────────────

/// One inventory slot as reported by InitBagData or Modfy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BagEntry {
    pub page_id: u32,
    pub slot_id: u32,
    pub item_id: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MapChange {
    /// `true` when leaving the refuge, `false` when returning to it.
    pub entering: bool,
    pub is_league_zone: bool,
    pub from_scene: String,
    pub to_scene: String,
}

/// A batch of auction house listings for one item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceSearch {
    pub item_id: String,
    /// First [`MAX_PRICE_SAMPLES`] listings in log order.
    pub samples: Vec<f64>,
    /// Listings seen in the response before capping.
    pub raw_sample_count: usize,
    /// Plain mean of `samples`.
    pub average: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum LogEvent {
    Init(BagEntry),
    Modify(BagEntry),
    Map(MapChange),
    Price(PriceSearch),
}

// ── Parser ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ParserSettings {
    pub refuge_scene: String,
    pub league_zone_prefixes: Vec<String>,
    pub max_pending_searches: usize,
}

impl Default for ParserSettings {
    fn default() -> Self {
        Self {
            refuge_scene: DEFAULT_REFUGE_SCENE.to_string(),
            league_zone_prefixes: DEFAULT_LEAGUE_PREFIXES
                .iter()
                .map(|p| p.to_string())
                .collect(),
            max_pending_searches: 256,
        }
    }
}

impl From<&Config> for ParserSettings {
    fn from(config: &Config) -> Self {
        Self {
            refuge_scene: config.refuge_scene.clone(),
            league_zone_prefixes: config.league_zone_prefixes.clone(),
            max_pending_searches: config.max_pending_searches.max(1),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingSearch {
    item_id: String,
    seq: u64,
}

/// Extracts events from raw log text. Only the price-search correlation
/// table survives between calls.
#[derive(Debug, Default)]
pub struct LogParser {
    settings: ParserSettings,
    pending: HashMap<String, PendingSearch>,
    next_seq: u64,
}

impl LogParser {
    pub fn new(settings: ParserSettings) -> Self {
        Self {
            settings,
            pending: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn settings(&self) -> &ParserSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: ParserSettings) {
        self.settings = settings;
        self.evict_overflow();
    }

    /// Number of price requests still waiting for their response.
    pub fn pending_searches(&self) -> usize {
        self.pending.len()
    }

    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    /// Every event in the chunk, ordered by position in the text.
    pub fn parse_chunk(&mut self, text: &str) -> Vec<LogEvent> {
        let mut events: Vec<(usize, LogEvent)> = Vec::new();
        for (offset, line) in lines_with_offsets(text) {
            if let Some(entry) = parse_bag_line(line, BAG_INIT_MARKER) {
                events.push((offset, LogEvent::Init(entry)));
            } else if let Some(entry) = parse_bag_line(line, BAG_MODIFY_MARKER) {
                events.push((offset, LogEvent::Modify(entry)));
            }
        }
        events.extend(
            self.scan_map_changes(text)
                .into_iter()
                .map(|(o, m)| (o, LogEvent::Map(m))),
        );
        events.extend(
            self.scan_price_searches(text)
                .into_iter()
                .map(|(o, p)| (o, LogEvent::Price(p))),
        );
        // Stable sort keeps same-line records in discovery order.
        events.sort_by_key(|(offset, _)| *offset);
        events.into_iter().map(|(_, ev)| ev).collect()
    }

    /// Full-snapshot entries (written when the player sorts the bag).
    pub fn parse_bag_init(&self, text: &str) -> Vec<BagEntry> {
        text.lines()
            .filter_map(|line| parse_bag_line(line, BAG_INIT_MARKER))
            .collect()
    }

    /// Single-slot updates (pickups, consumption, moves).
    pub fn parse_bag_modifications(&self, text: &str) -> Vec<BagEntry> {
        text.lines()
            .filter_map(|line| parse_bag_line(line, BAG_MODIFY_MARKER))
            .collect()
    }

    /// Scene transitions that cross the refuge boundary.
    pub fn parse_map_changes(&self, text: &str) -> Vec<MapChange> {
        self.scan_map_changes(text)
            .into_iter()
            .map(|(_, m)| m)
            .collect()
    }

    /// Completed request/response pairs. Requests whose response has not been
    /// seen yet stay pending for later calls.
    pub fn parse_price_searches(&mut self, text: &str) -> Vec<PriceSearch> {
        self.scan_price_searches(text)
            .into_iter()
            .map(|(_, p)| p)
            .collect()
    }

    // ── Scene changes ─────────────────────────────────────────────────

    fn scan_map_changes(&self, text: &str) -> Vec<(usize, MapChange)> {
        let starts: Vec<usize> = text
            .match_indices(SCENE_CHANGE_MARKER)
            .map(|(i, _)| i)
            .collect();
        let mut changes = Vec::new();
        for (n, &start) in starts.iter().enumerate() {
            let end = starts.get(n + 1).copied().unwrap_or(text.len());
            let block = &text[start..end];
            let Some((last, rest)) = quoted_after(block, LAST_SCENE_FIELD) else {
                continue;
            };
            let Some((next, _)) = quoted_after(rest, NEXT_SCENE_FIELD) else {
                continue;
            };
            if let Some(change) = self.classify_transition(last, next) {
                debug!(
                    from = last,
                    to = next,
                    entering = change.entering,
                    "Scene change"
                );
                changes.push((start, change));
            }
        }
        changes
    }

    fn classify_transition(&self, last: &str, next: &str) -> Option<MapChange> {
        let refuge = self.settings.refuge_scene.as_str();
        let from_refuge = last.contains(refuge);
        let to_refuge = next.contains(refuge);
        let entering = match (from_refuge, to_refuge) {
            (true, false) => true,
            (false, true) => false,
            _ => return None,
        };
        Some(MapChange {
            entering,
            is_league_zone: self.is_league_zone(next),
            from_scene: last.to_string(),
            to_scene: next.to_string(),
        })
    }

    fn is_league_zone(&self, scene: &str) -> bool {
        self.settings
            .league_zone_prefixes
            .iter()
            .any(|prefix| scene.starts_with(prefix.as_str()))
    }

    // ── Price searches ────────────────────────────────────────────────

    fn scan_price_searches(&mut self, text: &str) -> Vec<(usize, PriceSearch)> {
        let mut found = Vec::new();
        let mut block: Option<PriceBlock> = None;

        for (offset, line) in lines_with_offsets(text) {
            if line.contains(PRICE_SEARCH_MARKER) {
                if let Some(done) = block.take() {
                    self.finish_block(done, &mut found);
                }
                block = parse_price_header(line, offset);
                continue;
            }
            let Some(current) = block.as_mut() else {
                continue;
            };
            if PRICE_BLOCK_END_MARKERS.iter().any(|m| line.contains(m)) {
                if let Some(done) = block.take() {
                    self.finish_block(done, &mut found);
                }
                continue;
            }
            match &mut current.kind {
                BlockKind::Request { item_id } => {
                    if item_id.is_none() {
                        *item_id = parse_refer(line);
                    }
                }
                BlockKind::Response { samples } => {
                    if let Some(price) = parse_sample(line) {
                        samples.push(price);
                    }
                }
            }
        }
        if let Some(done) = block.take() {
            self.finish_block(done, &mut found);
        }
        found
    }

    fn finish_block(&mut self, block: PriceBlock, found: &mut Vec<(usize, PriceSearch)>) {
        match block.kind {
            BlockKind::Request { item_id: Some(item_id) } => {
                self.register_request(block.syn_id, item_id);
            }
            BlockKind::Request { item_id: None } => {
                debug!(syn_id = %block.syn_id, "Price request without item reference");
            }
            BlockKind::Response { samples } => {
                let Some(pending) = self.pending.remove(&block.syn_id) else {
                    debug!(syn_id = %block.syn_id, "Price response without pending request");
                    return;
                };
                if samples.is_empty() {
                    debug!(item_id = %pending.item_id, "Price response without listings");
                    return;
                }
                found.push((block.offset, build_search(pending.item_id, samples)));
            }
        }
    }

    fn register_request(&mut self, syn_id: String, item_id: String) {
        let seq = self.next_seq;
        self.next_seq += 1;
        debug!(syn_id = %syn_id, item_id = %item_id, "Price request pending");
        self.pending.insert(syn_id, PendingSearch { item_id, seq });
        self.evict_overflow();
    }

    fn evict_overflow(&mut self) {
        while self.pending.len() > self.settings.max_pending_searches {
            let oldest = self
                .pending
                .iter()
                .min_by_key(|(_, p)| p.seq)
                .map(|(id, _)| id.clone());
            let Some(syn_id) = oldest else {
                break;
            };
            if let Some(evicted) = self.pending.remove(&syn_id) {
                warn!(
                    syn_id = %syn_id,
                    item_id = %evicted.item_id,
                    "Evicting unanswered price request"
                );
            }
        }
    }
}

#[derive(Debug)]
struct PriceBlock {
    syn_id: String,
    offset: usize,
    kind: BlockKind,
}

#[derive(Debug)]
enum BlockKind {
    Request { item_id: Option<String> },
    Response { samples: Vec<f64> },
}

fn build_search(item_id: String, mut samples: Vec<f64>) -> PriceSearch {
    let raw_sample_count = samples.len();
    samples.truncate(MAX_PRICE_SAMPLES);
    let average = samples.iter().sum::<f64>() / samples.len() as f64;
    PriceSearch {
        item_id,
        samples,
        raw_sample_count,
        average: (average * 10_000.0).round() / 10_000.0,
    }
}

// ── Line parsers ──────────────────────────────────────────────────────

fn parse_bag_line(line: &str, marker: &str) -> Option<BagEntry> {
    // BagMgr@:Modfy BagItem PageId = 102 SlotId = 0 ConfigBaseId = 100300 Num = 671
    let idx = line.find(marker)?;
    let rest = &line[idx + marker.len()..];
    let page_id = extract_field(rest, "PageId")?;
    let slot_id = extract_field(rest, "SlotId")?;
    let item_id = extract_field_str(rest, "ConfigBaseId")?;
    if !item_id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let quantity = extract_field(rest, "Num")?;
    Some(BagEntry {
        page_id,
        slot_id,
        item_id,
        quantity,
    })
}

fn parse_price_header(line: &str, offset: usize) -> Option<PriceBlock> {
    // ----Socket RecvMessage STT----XchgSearchPrice----SynId = 4521
    let idx = line.find(PRICE_SEARCH_MARKER)?;
    let syn_id = extract_field_str(&line[idx..], "SynId")?;
    let kind = if line[..idx].contains(PRICE_RESPONSE_MARKER) {
        BlockKind::Response {
            samples: Vec::new(),
        }
    } else {
        BlockKind::Request { item_id: None }
    };
    Some(PriceBlock {
        syn_id,
        offset,
        kind,
    })
}

fn parse_refer(line: &str) -> Option<String> {
    // |  +refer [100200]
    let idx = line.find(PRICE_REFER_FIELD)?;
    let rest = &line[idx + PRICE_REFER_FIELD.len()..];
    let end = rest.find(']')?;
    let id = rest[..end].trim();
    if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) {
        Some(id.to_string())
    } else {
        None
    }
}

fn parse_sample(line: &str) -> Option<f64> {
    // |      +3 [12.5]
    for (idx, _) in line.match_indices('+') {
        let rest = &line[idx + 1..];
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            continue;
        }
        let rest = rest[digits..].trim_start();
        let Some(rest) = rest.strip_prefix('[') else {
            continue;
        };
        let Some(end) = rest.find(']') else {
            continue;
        };
        if let Ok(value) = rest[..end].trim().parse::<f64>() {
            if value.is_finite() {
                return Some(value);
            }
        }
    }
    None
}

// ── Field extraction helpers ──────────────────────────────────────────

fn extract_field(line: &str, name: &str) -> Option<u32> {
    extract_field_str(line, name)?.parse().ok()
}

fn extract_field_str(line: &str, name: &str) -> Option<String> {
    let idx = line.find(name)?;
    let rest = &line[idx + name.len()..];
    // Skip optional whitespace + '=' + whitespace
    let rest = rest.trim_start();
    let rest = rest.strip_prefix('=')?;
    let rest = rest.trim_start();
    // Read until next whitespace or end
    let end = rest.find(|c: char| c.is_whitespace()).unwrap_or(rest.len());
    let val = &rest[..end];
    if val.is_empty() {
        None
    } else {
        Some(val.to_string())
    }
}

/// Text after `field` up to the closing quote, plus the remainder.
fn quoted_after<'a>(text: &'a str, field: &str) -> Option<(&'a str, &'a str)> {
    let idx = text.find(field)?;
    let rest = &text[idx + field.len()..];
    let end = rest.find('\'')?;
    Some((&rest[..end], &rest[end + 1..]))
}

fn lines_with_offsets(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.split_inclusive('\n').scan(0usize, |offset, raw| {
        let start = *offset;
        *offset += raw.len();
        Some((start, raw.trim_end_matches(['\r', '\n'])))
    })
}
