//! Drop and profit tracker for Torchlight: Infinite, driven by the game's
//! `UE_game.log`.

pub mod bag;
pub mod catalog;
pub mod config;
pub mod events;
pub mod log_parser;
pub mod models;
pub mod prices;
pub mod service;
pub mod storage;
pub mod tracker;
pub mod watcher;
pub mod web;

pub use config::Config;
pub use events::{Notification, NotificationSink, TrackerSnapshot};
pub use tracker::{Phase, Tracker};
