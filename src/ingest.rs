//! Extract-and-load step: one API call per coin, flattened and appended.

use crate::coin_id::CoinId;
use crate::coingecko::{CoinGeckoClient, FetchError};
use crate::flatten::{is_empty_payload, CoinSnapshot};
use crate::schedule::target_date;
use crate::warehouse::{LoadInfo, Warehouse};
use crate::PipelineError;
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};

/// Rows fetched for one target date.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedBatch {
    pub target_date: NaiveDate,
    pub rows: Vec<CoinSnapshot>,
    /// Coins the API returned nothing for
    pub skipped: Vec<CoinId>,
}

/// What the load half of the step did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LoadOutcome {
    /// Every coin was skipped; nothing was written
    NoData,
    Loaded(LoadInfo),
}

/// Summary of one ingestion run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub logical_date: NaiveDate,
    pub target_date: NaiveDate,
    pub fetched: usize,
    pub skipped: Vec<CoinId>,
    pub outcome: LoadOutcome,
}

/// Fetches and flattens every coin for `target_date`, in list order.
///
/// Coins the API has no answer for, or answers with an empty body, are
/// skipped and reported; transport
/// failures abort the batch.
pub async fn fetch_snapshots(
    client: &CoinGeckoClient,
    coins: &[CoinId],
    target_date: NaiveDate,
) -> Result<FetchedBatch, FetchError> {
    let mut rows = Vec::with_capacity(coins.len());
    let mut skipped = Vec::new();

    for coin in coins {
        match client.fetch_coin_history(coin, target_date).await? {
            Some(raw) if !is_empty_payload(&raw) => {
                let snapshot = CoinSnapshot::from_history(&raw, coin, target_date);
                if !snapshot.has_market_data() {
                    warn!(coin = %coin, target_date = %target_date, "Ingest: response has no market data");
                }
                rows.push(snapshot);
            }
            _ => {
                warn!(coin = %coin, target_date = %target_date, "Ingest: no data, coin skipped");
                skipped.push(coin.clone());
            }
        }
    }

    Ok(FetchedBatch {
        target_date,
        rows,
        skipped,
    })
}

/// Runs the extract-and-load step for a logical date.
///
/// Loads the day before `logical_date` into `relation`. Rows already present
/// for the same `(coin, date)` are left untouched, so re-running a day is safe.
pub async fn run_ingestion(
    client: &CoinGeckoClient,
    warehouse: &mut Warehouse,
    coins: &[CoinId],
    relation: &str,
    logical_date: NaiveDate,
) -> Result<IngestReport, PipelineError> {
    let target = target_date(logical_date);
    info!(
        logical_date = %logical_date,
        target_date = %target,
        coins = coins.len(),
        "Ingest: fetching coin history"
    );

    let batch = fetch_snapshots(client, coins, target).await?;
    let fetched = batch.rows.len();

    let outcome = if batch.rows.is_empty() {
        info!(target_date = %target, "Ingest: no data to load");
        LoadOutcome::NoData
    } else {
        LoadOutcome::Loaded(warehouse.append_snapshots(relation, target, &batch.rows)?)
    };

    Ok(IngestReport {
        logical_date,
        target_date: target,
        fetched,
        skipped: batch.skipped,
        outcome,
    })
}
