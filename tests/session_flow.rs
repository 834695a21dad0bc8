//! End-to-end runs of the tracker against on-disk storage.
//!
//! Log text is written the way the game emits it, timestamps and all, and fed
//! through the same service the `watch` command uses.

use std::fmt::Write as _;

use tli_tracker::catalog::FLAME_ELEMENTIUM_ID;
use tli_tracker::config::Config;
use tli_tracker::events::{ChannelSink, Notification};
use tli_tracker::service::TrackerService;
use tli_tracker::storage::{load_prices, DataDir, JsonSessionStore, SessionStore};
use tli_tracker::watcher::split_lines;

const REFUGE: &str = "01SD/XZ_YuJinZhiXiBiNanSuo200/XZ_YuJinZhiXiBiNanSuo200";
const MAP: &str = "03YL/YL_BeiFengLinDi201/YL_BeiFengLinDi201";
const COMPASS: &str = "5210";
const EMBER: &str = "5011";

const ITEMS_JSON: &str = r#"{
    "5210": {"name": "Compass", "type": "Compass"},
    "5011": "Ember"
}"#;

fn stamp(line: &str) -> String {
    format!("[2024.06.01-12.00.00:000][  7]GameLog: Display: [Game] {}\n", line)
}

fn bag_snapshot() -> String {
    let mut out = String::new();
    out += &stamp(&format!(
        "BagMgr@:InitBagData PageId = 102 SlotId = 0 ConfigBaseId = {} Num = 500",
        FLAME_ELEMENTIUM_ID
    ));
    // Filler so the snapshot clears the minimum size.
    for slot in 1..25 {
        out += &stamp(&format!(
            "BagMgr@:InitBagData PageId = 103 SlotId = {} ConfigBaseId = {} Num = 1",
            slot,
            900000 + slot
        ));
    }
    out
}

fn modify(slot: u32, item: &str, num: u32) -> String {
    stamp(&format!(
        "BagMgr@:Modfy BagItem PageId = 102 SlotId = {} ConfigBaseId = {} Num = {}",
        slot, item, num
    ))
}

fn scene(last: &str, next: &str) -> String {
    stamp(&format!(
        "PageApplyBase@ _UpdateGameEnd: LastSceneName = World'/Game/Art/Maps/{}' NextSceneName = World'/Game/Art/Maps/{}'",
        last, next
    ))
}

fn search_request(syn_id: u32, item: &str) -> String {
    let mut out = stamp(&format!(
        "----Socket SendMessage STT----XchgSearchPrice----SynId = {}",
        syn_id
    ));
    let _ = writeln!(out, "+filters+");
    let _ = writeln!(out, "|  +refer [{}]", item);
    let _ = writeln!(out, "----Socket SendMessage End----");
    out
}

fn search_response(syn_id: u32, prices: &[f64]) -> String {
    let mut out = stamp(&format!(
        "----Socket RecvMessage STT----XchgSearchPrice----SynId = {}",
        syn_id
    ));
    let _ = writeln!(out, "+prices+");
    for (i, p) in prices.iter().enumerate() {
        let _ = writeln!(out, "|      +{} [{}]", i + 1, p);
    }
    let _ = writeln!(out, "----Socket RecvMessage End----");
    out
}

struct Fixture {
    _dir: tempfile::TempDir,
    data: DataDir,
    service: TrackerService,
    notifications: std::sync::mpsc::Receiver<Notification>,
}

fn fixture(config: Config) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let data = DataDir::resolve(Some(dir.path().to_path_buf())).unwrap();
    std::fs::write(data.items_path(), ITEMS_JSON).unwrap();
    let (sink, notifications) = ChannelSink::pair();
    let service = TrackerService::open(&data, config, Box::new(sink)).unwrap();
    Fixture {
        _dir: dir,
        data,
        service,
        notifications,
    }
}

fn kinds(rx: &std::sync::mpsc::Receiver<Notification>) -> Vec<&'static str> {
    rx.try_iter().map(|n| n.kind()).collect()
}

#[test]
fn test_farming_run_with_late_price() {
    let fx = fixture(Config::default());
    fx.service.process_chunk(&bag_snapshot());
    assert!(fx.service.snapshot().initialized);

    // Map 1: a compass drops while its price is unknown, plus some currency.
    fx.service.process_chunk(&scene(REFUGE, MAP));
    fx.service
        .process_chunk(&(modify(3, COMPASS, 2) + &modify(0, FLAME_ELEMENTIUM_ID, 560)));
    fx.service.process_chunk(&scene(MAP, REFUGE));

    let snapshot = fx.service.snapshot();
    let session = snapshot.session.as_ref().unwrap();
    assert_eq!(session.map_count, 1);
    assert_eq!(session.value, 60.0);
    let compass = session.drops.iter().find(|d| d.item_id == COMPASS).unwrap();
    assert_eq!(compass.value, None);
    assert_eq!(compass.item_name, "Compass");

    // Price search from the auction house, request and response in separate chunks.
    fx.service.process_chunk(&search_request(31, COMPASS));
    let stats = fx
        .service
        .process_chunk(&search_response(31, &[25.0, 25.0, 25.0, 26.0, 24.0, 9999.0]));
    assert_eq!(stats.price_updates, 1);

    fx.service.flush().unwrap();
    let history = JsonSessionStore::open(fx.data.sessions_path(), 100).unwrap();
    let saved = history.get(&session.id).unwrap().unwrap();
    let saved_compass = saved.maps[0]
        .drops
        .iter()
        .find(|d| d.item_id == COMPASS)
        .unwrap();
    assert_eq!(saved_compass.value, Some(50.0));
    assert_eq!(saved.total_value(), 110.0);

    let prices = load_prices(&fx.data.prices_path()).unwrap();
    assert_eq!(prices.get(COMPASS).map(|r| r.price), Some(25.0));

    let seen = kinds(&fx.notifications);
    assert_eq!(seen.first(), Some(&"initialized"));
    assert!(seen.contains(&"price_update"));
    assert_eq!(seen.iter().filter(|k| **k == "drop").count(), 2);
}

#[test]
fn test_investment_and_net_value() {
    let fx = fixture(Config::default());
    fx.service.process_chunk(&bag_snapshot());
    fx.service.process_chunk(&scene(REFUGE, MAP));
    assert!(fx.service.with_engine(|e| e.set_investment(20.0)));
    fx.service.process_chunk(&modify(0, FLAME_ELEMENTIUM_ID, 600));
    fx.service.process_chunk(&scene(MAP, REFUGE));

    let session = fx.service.with_engine(|e| e.current_session().cloned()).unwrap();
    assert_eq!(session.maps[0].total_value(), 100.0);
    assert_eq!(session.maps[0].net_value(), 80.0);
    assert_eq!(session.net_value(), 80.0);
}

#[test]
fn test_response_without_request_is_ignored() {
    let fx = fixture(Config::default());
    let stats = fx.service.process_chunk(&search_response(77, &[5.0, 5.0]));
    assert_eq!(stats.price_updates, 0);
    assert!(fx.service.with_engine(|e| e.prices().get_price(EMBER)).is_none());
}

#[test]
fn test_uninitialized_inventory_records_maps_only() {
    let fx = fixture(Config::default());
    fx.service.process_chunk(&scene(REFUGE, MAP));
    fx.service.process_chunk(&modify(3, COMPASS, 2));
    fx.service.process_chunk(&scene(MAP, REFUGE));

    let snapshot = fx.service.snapshot();
    assert!(!snapshot.initialized);
    let session = snapshot.session.unwrap();
    assert_eq!(session.map_count, 1);
    assert!(session.drops.is_empty());
}

#[test]
fn test_line_chunking_does_not_change_totals() {
    let play = scene(REFUGE, MAP)
        + &modify(3, EMBER, 4)
        + &modify(4, COMPASS, 1)
        + &modify(3, EMBER, 9)
        + &scene(MAP, REFUGE)
        + &scene(REFUGE, MAP)
        + &modify(5, COMPASS, 3)
        + &scene(MAP, REFUGE);

    let totals: Vec<(usize, i64)> = [0usize, 1, 3, 7]
        .iter()
        .map(|&lines| {
            let fx = fixture(Config::default());
            fx.service.process_chunk(&bag_snapshot());
            for chunk in split_lines(&play, lines) {
                fx.service.process_chunk(chunk);
            }
            let session = fx.service.snapshot().session.unwrap();
            (session.map_count, session.items)
        })
        .collect();

    assert_eq!(totals[0], (2, 13));
    assert!(totals.iter().all(|t| *t == totals[0]), "{:?}", totals);
}

#[test]
fn test_reset_session_starts_fresh_history_entry() {
    let fx = fixture(Config::default());
    fx.service.process_chunk(&bag_snapshot());
    fx.service.process_chunk(&scene(REFUGE, MAP));
    fx.service.process_chunk(&scene(MAP, REFUGE));
    fx.service.with_engine(|e| e.reset_session());
    fx.service.process_chunk(&scene(REFUGE, MAP));
    fx.service.process_chunk(&scene(MAP, REFUGE));

    let store = fx.service.store();
    let sessions = store.recent(10).unwrap();
    assert_eq!(sessions.len(), 2);
    // Most recent first; the closed one carries an end time.
    assert!(sessions[0].ended_at.is_none());
    assert!(sessions[1].ended_at.is_some());
    assert!(fx.service.snapshot().initialized);
}
