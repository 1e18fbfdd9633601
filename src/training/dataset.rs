//! Feature table loading and chronological splitting.

use super::TrainingError;
use crate::warehouse::{is_valid_identifier, Warehouse};
use std::collections::BTreeSet;
use tracing::info;

/// Model inputs, in column order.
pub const FEATURE_COLUMNS: [&str; 23] = [
    "coin_id",
    "price",
    "lag_price_1d",
    "lag_price_7d",
    "price_moving_avg_7d",
    "cap",
    "lag_cap_1d",
    "lag_cap_7d",
    "cap_moving_avg_7d",
    "volume",
    "lag_volume_1d",
    "lag_volume_7d",
    "volume_moving_avg_7d",
    "price_diff_1d",
    "price_diff_7d",
    "price_diff_avg_7d",
    "cap_diff_1d",
    "cap_diff_7d",
    "cap_diff_avg_7d",
    "volume_diff_1d",
    "volume_diff_7d",
    "volume_diff_avg_7d",
    "rsi_7d",
];

pub const TARGET_COLUMN: &str = "target_direction";

/// One feature-table row before encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRecord {
    pub coin_id: String,
    pub report_date: String,
    /// Numeric features after `coin_id`, `None` for NULL
    pub values: Vec<Option<f64>>,
    pub target: u8,
}

/// Encoded, chronologically ordered training data.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureDataset {
    pub feature_names: Vec<String>,
    pub rows: Vec<Vec<f64>>,
    pub labels: Vec<u8>,
    pub report_dates: Vec<String>,
    /// Sorted coin ids; a coin's position is its category code
    pub categories: Vec<String>,
}

impl FeatureDataset {
    /// Reads every labelled row with a full week of history from `relation`.
    pub fn load(warehouse: &Warehouse, relation: &str) -> Result<Self, TrainingError> {
        if !is_valid_identifier(relation) {
            return Err(TrainingError::InvalidInput(format!(
                "invalid relation name '{}'",
                relation
            )));
        }
        if !warehouse.relation_exists(relation)? {
            return Err(TrainingError::MissingData(format!(
                "feature relation '{}' does not exist",
                relation
            )));
        }

        let numeric = &FEATURE_COLUMNS[1..];
        let sql = format!(
            "SELECT coin_id, report_date, {numeric}, {target} FROM \"{relation}\"
             WHERE {target} IS NOT NULL AND lag_price_7d IS NOT NULL
             ORDER BY report_date, coin_id",
            numeric = numeric.join(", "),
            target = TARGET_COLUMN,
            relation = relation
        );

        let mut stmt = warehouse.connection().prepare(&sql)?;
        let records = stmt
            .query_map([], |row| {
                let mut values = Vec::with_capacity(numeric.len());
                for column in 0..numeric.len() {
                    values.push(row.get::<_, Option<f64>>(column + 2)?);
                }
                let target: i64 = row.get(numeric.len() + 2)?;
                Ok(FeatureRecord {
                    coin_id: row.get(0)?,
                    report_date: row.get(1)?,
                    values,
                    target: u8::from(target > 0),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let dataset = Self::from_records(records);
        info!(
            relation = %relation,
            rows = dataset.len(),
            positives = dataset.positives(),
            coins = dataset.categories.len(),
            "Training: feature table loaded"
        );
        Ok(dataset)
    }

    /// Encodes records; `coin_id` becomes its index among the sorted distinct ids.
    pub fn from_records(records: Vec<FeatureRecord>) -> Self {
        let categories: Vec<String> = records
            .iter()
            .map(|record| record.coin_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut rows = Vec::with_capacity(records.len());
        let mut labels = Vec::with_capacity(records.len());
        let mut report_dates = Vec::with_capacity(records.len());
        for record in records {
            let code = categories
                .binary_search(&record.coin_id)
                .map(|code| code as f64)
                .unwrap_or(f64::NAN);
            let mut row = Vec::with_capacity(FEATURE_COLUMNS.len());
            row.push(code);
            row.extend(record.values.iter().map(|value| value.unwrap_or(f64::NAN)));
            rows.push(row);
            labels.push(record.target);
            report_dates.push(record.report_date);
        }

        FeatureDataset {
            feature_names: FEATURE_COLUMNS.iter().map(|name| name.to_string()).collect(),
            rows,
            labels,
            report_dates,
            categories,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Splits into the first `train_fraction` of rows and the remainder.
    ///
    /// Rows are already in date order, so the test part is strictly the most
    /// recent data.
    pub fn chronological_split(&self, train_fraction: f64) -> (FeatureDataset, FeatureDataset) {
        let cut = ((self.len() as f64) * train_fraction).floor() as usize;
        let cut = cut.min(self.len());
        let part = |range: std::ops::Range<usize>| FeatureDataset {
            feature_names: self.feature_names.clone(),
            rows: self.rows[range.clone()].to_vec(),
            labels: self.labels[range.clone()].to_vec(),
            report_dates: self.report_dates[range].to_vec(),
            categories: self.categories.clone(),
        };
        (part(0..cut), part(cut..self.len()))
    }

    /// Number of rows labelled 1.
    pub fn positives(&self) -> usize {
        self.labels.iter().filter(|&&label| label == 1).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(coin: &str, date: &str, price: Option<f64>, target: u8) -> FeatureRecord {
        let mut values = vec![Some(1.0); FEATURE_COLUMNS.len() - 1];
        values[0] = price;
        FeatureRecord {
            coin_id: coin.to_string(),
            report_date: date.to_string(),
            values,
            target,
        }
    }

    #[test]
    fn test_categories_sorted_and_nulls_become_nan() {
        let dataset = FeatureDataset::from_records(vec![
            record("solana", "2025-02-01", Some(10.0), 1),
            record("bitcoin", "2025-02-01", None, 0),
        ]);

        assert_eq!(dataset.categories, vec!["bitcoin", "solana"]);
        assert_eq!(dataset.rows[0][0], 1.0);
        assert_eq!(dataset.rows[1][0], 0.0);
        assert_eq!(dataset.rows[0][1], 10.0);
        assert!(dataset.rows[1][1].is_nan());
        assert_eq!(dataset.feature_names.len(), 23);
        assert_eq!(dataset.rows[0].len(), 23);
        assert_eq!(dataset.positives(), 1);
    }

    #[test]
    fn test_chronological_split_floors_training_share() {
        let records = (0..9)
            .map(|i| record("bitcoin", &format!("2025-02-0{}", i + 1), Some(i as f64), (i % 2) as u8))
            .collect();
        let dataset = FeatureDataset::from_records(records);

        let (train, test) = dataset.chronological_split(0.8);
        assert_eq!(train.len(), 7);
        assert_eq!(test.len(), 2);
        assert_eq!(test.report_dates, vec!["2025-02-08", "2025-02-09"]);
    }

    #[test]
    fn test_load_filters_and_orders_rows() {
        let warehouse = Warehouse::open_in_memory().unwrap();
        let columns: Vec<String> = FEATURE_COLUMNS[1..]
            .iter()
            .map(|c| format!("{} REAL", c))
            .collect();
        warehouse
            .connection()
            .execute_batch(&format!(
                "CREATE TABLE features (coin_id TEXT, report_date TEXT, {}, target_direction INTEGER)",
                columns.join(", ")
            ))
            .unwrap();

        let insert = |coin: &str, date: &str, lag7: Option<f64>, target: Option<i64>| {
            warehouse
                .connection()
                .execute(
                    "INSERT INTO features (coin_id, report_date, price, lag_price_7d, target_direction)
                     VALUES (?1, ?2, 1.0, ?3, ?4)",
                    rusqlite::params![coin, date, lag7, target],
                )
                .unwrap();
        };
        insert("solana", "2025-02-09", Some(1.0), Some(1));
        insert("bitcoin", "2025-02-09", Some(1.0), Some(0));
        insert("bitcoin", "2025-02-08", Some(1.0), Some(1));
        insert("bitcoin", "2025-02-10", Some(1.0), None);
        insert("bitcoin", "2025-02-01", None, Some(1));

        let dataset = FeatureDataset::load(&warehouse, "features").unwrap();
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.report_dates, vec!["2025-02-08", "2025-02-09", "2025-02-09"]);
        assert_eq!(dataset.labels, vec![1, 0, 1]);
        assert_eq!(dataset.rows[1][0], 0.0);
        assert!(dataset.rows[0][5].is_nan());
    }

    #[test]
    fn test_load_missing_relation() {
        let warehouse = Warehouse::open_in_memory().unwrap();
        let err = FeatureDataset::load(&warehouse, "nope").unwrap_err();
        assert!(matches!(err, TrainingError::MissingData(_)));
    }
}
