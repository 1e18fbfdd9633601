//! Flattening of nested CoinGecko documents into warehouse rows.
//!
//! Nested object keys are joined with a double underscore, so
//! `{"market_data": {"current_price": {"usd": 1.0}}}` becomes the column
//! `market_data__current_price__usd`.

use crate::coin_id::CoinId;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Separator between nesting levels in flattened column names.
pub const SEPARATOR: &str = "__";

/// Flattens nested objects into a single level keyed by joined paths.
///
/// Arrays and scalars are leaves and are copied as-is. An empty nested object
/// produces no columns.
pub fn flatten_json(value: &Value, separator: &str) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    match value {
        Value::Object(map) => flatten_into(map, None, separator, &mut out),
        other => {
            out.insert(String::new(), other.clone());
        }
    }
    out
}

/// Whether a response body carries nothing at all: `null`, `{}`, `[]` or `""`.
pub fn is_empty_payload(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(text) => text.is_empty(),
        _ => false,
    }
}

fn flatten_into(
    map: &Map<String, Value>,
    prefix: Option<&str>,
    separator: &str,
    out: &mut BTreeMap<String, Value>,
) {
    for (key, value) in map {
        let column = match prefix {
            Some(p) => format!("{}{}{}", p, separator, key),
            None => key.clone(),
        };
        match value {
            Value::Object(inner) => flatten_into(inner, Some(&column), separator, out),
            leaf => {
                out.insert(column, leaf.clone());
            }
        }
    }
}

/// Column names of the raw snapshot table, in table order.
pub const SNAPSHOT_COLUMNS: [&str; 12] = [
    "id",
    "symbol",
    "name",
    "image__thumb",
    "image__small",
    "market_data__current_price__usd",
    "market_data__market_cap__usd",
    "market_data__total_volume__usd",
    "community_data__reddit_average_posts_48h",
    "community_data__reddit_average_comments_48h",
    "community_data__reddit_accounts_active_48h",
    "report_date",
];

/// One coin on one day, as stored in the raw table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinSnapshot {
    pub id: String,
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub image_thumb: Option<String>,
    pub image_small: Option<String>,
    pub current_price_usd: Option<f64>,
    pub market_cap_usd: Option<f64>,
    pub total_volume_usd: Option<f64>,
    pub reddit_average_posts_48h: Option<f64>,
    pub reddit_average_comments_48h: Option<f64>,
    pub reddit_accounts_active_48h: Option<f64>,
    pub report_date: NaiveDate,
}

impl CoinSnapshot {
    /// Extracts the tracked columns from a `/coins/{id}/history` document.
    ///
    /// Missing or mistyped fields become `None`. CoinGecko omits
    /// `market_data` entirely for days before a coin was listed, which
    /// yields a row with only identity columns.
    pub fn from_history(raw: &Value, requested: &CoinId, report_date: NaiveDate) -> Self {
        let flat = flatten_json(raw, SEPARATOR);
        let text = |column: &str| flat.get(column).and_then(Value::as_str).map(str::to_string);
        let number = |column: &str| flat.get(column).and_then(Value::as_f64);

        CoinSnapshot {
            id: text("id").unwrap_or_else(|| requested.as_str().to_string()),
            symbol: text("symbol"),
            name: text("name"),
            image_thumb: text("image__thumb"),
            image_small: text("image__small"),
            current_price_usd: number("market_data__current_price__usd"),
            market_cap_usd: number("market_data__market_cap__usd"),
            total_volume_usd: number("market_data__total_volume__usd"),
            reddit_average_posts_48h: number("community_data__reddit_average_posts_48h"),
            reddit_average_comments_48h: number("community_data__reddit_average_comments_48h"),
            reddit_accounts_active_48h: number("community_data__reddit_accounts_active_48h"),
            report_date,
        }
    }

    /// Whether the snapshot carries any market data at all.
    pub fn has_market_data(&self) -> bool {
        self.current_price_usd.is_some()
            || self.market_cap_usd.is_some()
            || self.total_volume_usd.is_some()
    }
}
