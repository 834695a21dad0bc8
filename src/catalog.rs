use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::storage::StoreError;

/// ConfigBaseId for Flame Elementium – the currency every value is expressed in.
pub const FLAME_ELEMENTIUM_ID: &str = "100300";

/// Seed database shipped with the binary: ConfigBaseId → name/type.
static SEED_JSON: &str = include_str!("items.json");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemInfo {
    pub name: String,
    #[serde(rename = "type", default = "default_item_type")]
    pub item_type: String,
}

fn default_item_type() -> String {
    "Other".to_string()
}

/// `items.json` either maps ids to full records or, in older dumps, to bare names.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Full(ItemInfo),
    Name(String),
}

impl From<RawEntry> for ItemInfo {
    fn from(raw: RawEntry) -> Self {
        match raw {
            RawEntry::Full(info) => info,
            RawEntry::Name(name) => ItemInfo {
                name,
                item_type: default_item_type(),
            },
        }
    }
}

/// Lookup table of tradeable items. Ids missing here (gear, memories, slates…)
/// are not tracked for value.
#[derive(Debug, Clone, Default)]
pub struct ItemCatalog {
    items: HashMap<String, ItemInfo>,
}

impl ItemCatalog {
    pub fn new(items: HashMap<String, ItemInfo>) -> Self {
        Self { items }
    }

    /// Catalog built from the embedded seed only.
    pub fn embedded() -> Self {
        Self::from_json(SEED_JSON).unwrap_or_default()
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let raw: HashMap<String, RawEntry> = serde_json::from_str(json)?;
        Ok(Self {
            items: raw.into_iter().map(|(id, e)| (id, e.into())).collect(),
        })
    }

    /// Embedded seed overlaid with the user's `items.json`, if present.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let mut catalog = Self::embedded();
        if path.exists() {
            let contents = fs::read_to_string(path)?;
            let user = Self::from_json(&contents)?;
            catalog.items.extend(user.items);
            info!(path = %path.display(), items = catalog.len(), "Loaded item catalog");
        }
        Ok(catalog)
    }

    /// `None` is the unknown-item sentinel.
    pub fn lookup(&self, item_id: &str) -> Option<&ItemInfo> {
        self.items.get(item_id)
    }

    pub fn is_known(&self, item_id: &str) -> bool {
        self.items.contains_key(item_id)
    }

    /// Resolve an id to its display name (or "Unknown (<id>)").
    pub fn name(&self, item_id: &str) -> String {
        self.lookup(item_id)
            .map(|i| i.name.clone())
            .unwrap_or_else(|| format!("Unknown ({})", item_id))
    }

    pub fn item_type(&self, item_id: &str) -> String {
        self.lookup(item_id)
            .map(|i| i.item_type.clone())
            .unwrap_or_else(|| "Unknown".to_string())
    }

    pub fn insert(&mut self, item_id: impl Into<String>, info: ItemInfo) {
        self.items.insert(item_id.into(), info);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
