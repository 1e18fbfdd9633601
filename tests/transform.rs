use chrono::{Duration, NaiveDate};
use coingecko_pipeline::{CoinSnapshot, TransformProject, TransformRunner, Warehouse};
use std::collections::BTreeMap;
use std::path::PathBuf;

const RAW: &str = "raw_coingecko__coins_history";
const FEATURES: &str = "dev_coingecko_marts__ml_features_price_changes";

fn project_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("coingecko_models")
}

fn load_project() -> TransformProject {
    TransformProject::load(&project_dir(), "dev_coingecko", &["models/example".to_string()]).unwrap()
}

fn snapshot(coin: &str, report_date: NaiveDate, price: f64) -> CoinSnapshot {
    CoinSnapshot {
        id: coin.to_string(),
        symbol: Some(coin[..3].to_string()),
        name: Some(coin.to_string()),
        image_thumb: None,
        image_small: None,
        current_price_usd: Some(price),
        market_cap_usd: Some(price * 100.0),
        total_volume_usd: Some(10.0),
        reddit_average_posts_48h: None,
        reddit_average_comments_48h: None,
        reddit_accounts_active_48h: None,
        report_date,
    }
}

/// Bitcoin rises by 1 every day, ethereum falls by 1, from 2025-02-01 to 2025-02-11.
fn seeded_warehouse() -> Warehouse {
    let mut warehouse = Warehouse::open_in_memory().unwrap();
    let start = NaiveDate::from_ymd_opt(2025, 2, 1).unwrap();
    for offset in 0..11 {
        let day = start + Duration::days(offset);
        let rows = vec![
            snapshot("bitcoin", day, 1.0 + offset as f64),
            snapshot("ethereum", day, 100.0 - offset as f64),
        ];
        warehouse.append_snapshots(RAW, day, &rows).unwrap();
    }
    warehouse
}

fn run_project(warehouse: &mut Warehouse, execution_date: &str) {
    let project = load_project();
    let sources = BTreeMap::from([("coingecko".to_string(), "raw_coingecko".to_string())]);
    TransformRunner::new(&project, sources)
        .with_var("execution_date", execution_date)
        .run_all(warehouse)
        .unwrap();
}

fn feature(warehouse: &Warehouse, coin: &str, day: &str, column: &str) -> Option<f64> {
    warehouse
        .connection()
        .query_row(
            &format!(
                "SELECT {} FROM {} WHERE coin_id = ?1 AND report_date = ?2",
                column, FEATURES
            ),
            [coin, day],
            |row| row.get(0),
        )
        .unwrap()
}

#[test]
fn project_excludes_example_models_and_orders_by_ref() {
    let project = load_project();
    let order: Vec<&str> = project.execution_order().iter().map(|m| m.name.as_str()).collect();
    assert_eq!(order, vec!["stg_coin_history", "ml_features_price_changes"]);

    let mart = project.model("ml_features_price_changes").unwrap();
    assert_eq!(project.relation_name(mart), FEATURES);
    let staging = project.model("stg_coin_history").unwrap();
    assert_eq!(project.relation_name(staging), "dev_coingecko_staging__stg_coin_history");
}

#[test]
fn feature_table_lags_windows_and_target() {
    let mut warehouse = seeded_warehouse();
    run_project(&mut warehouse, "2025-02-10");

    // 2 coins x 10 days up to the execution date
    assert_eq!(warehouse.row_count(FEATURES).unwrap(), 20);

    assert_eq!(feature(&warehouse, "bitcoin", "2025-02-08", "lag_price_1d"), Some(7.0));
    assert_eq!(feature(&warehouse, "bitcoin", "2025-02-08", "lag_price_7d"), Some(1.0));
    assert_eq!(feature(&warehouse, "bitcoin", "2025-02-07", "lag_price_7d"), None);
    assert_eq!(feature(&warehouse, "bitcoin", "2025-02-07", "price_moving_avg_7d"), Some(4.0));
    assert_eq!(feature(&warehouse, "bitcoin", "2025-02-02", "price_moving_avg_7d"), Some(1.5));
    assert_eq!(feature(&warehouse, "bitcoin", "2025-02-08", "price_diff_7d"), Some(7.0));
    assert_eq!(feature(&warehouse, "bitcoin", "2025-02-05", "price_diff_1d"), Some(0.25));

    assert_eq!(feature(&warehouse, "bitcoin", "2025-02-08", "rsi_7d"), Some(100.0));
    assert_eq!(feature(&warehouse, "ethereum", "2025-02-08", "rsi_7d"), Some(0.0));

    assert_eq!(feature(&warehouse, "bitcoin", "2025-02-09", "target_direction"), Some(1.0));
    assert_eq!(feature(&warehouse, "ethereum", "2025-02-09", "target_direction"), Some(0.0));
    // The raw row for 2025-02-11 lies after the execution date
    assert_eq!(feature(&warehouse, "bitcoin", "2025-02-10", "target_direction"), None);
}

#[test]
fn rerun_for_later_date_extends_feature_table() {
    let mut warehouse = seeded_warehouse();
    run_project(&mut warehouse, "2025-02-05");
    assert_eq!(warehouse.row_count(FEATURES).unwrap(), 10);

    run_project(&mut warehouse, "2025-02-11");
    assert_eq!(warehouse.row_count(FEATURES).unwrap(), 22);
    assert_eq!(feature(&warehouse, "bitcoin", "2025-02-10", "target_direction"), Some(1.0));
}
