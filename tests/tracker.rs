mod common;

use coingecko_pipeline::config::TrainingSection;
use coingecko_pipeline::training::{Artifact, TrackedRun, Tracker};
use common::{spawn_mlflow, FakeMlflow};
use std::collections::BTreeMap;
use std::sync::Arc;

fn tracked_run() -> TrackedRun {
    TrackedRun {
        run_name: "price_changes_direction_gbm".to_string(),
        params: BTreeMap::from([
            ("max_depth".to_string(), "3".to_string()),
            ("num_features".to_string(), "23".to_string()),
        ]),
        metrics: BTreeMap::from([("accuracy".to_string(), 0.75), ("f1_score".to_string(), 0.5)]),
        artifacts: vec![Artifact {
            path: "confusion_matrix.csv".to_string(),
            content: b"actual,predicted_0,predicted_1\n0,3,1\n1,0,4\n".to_vec(),
        }],
    }
}

#[tokio::test]
async fn mlflow_tracker_creates_logs_and_finishes_run() {
    let api = Arc::new(FakeMlflow::default());
    let base_url = spawn_mlflow(api.clone()).await;
    let tracker = Tracker::from_config(&TrainingSection::default(), Some(base_url)).unwrap();

    let logged = tracker.log_run(&tracked_run()).await.unwrap();

    assert_eq!(logged.run_id, "run-123");
    assert!(logged.location.ends_with("/#/experiments/0/runs/run-123"));
    assert_eq!(api.endpoints(), vec!["runs/create", "runs/log-batch", "runs/update"]);

    let create = api.body_of("runs/create").unwrap();
    assert_eq!(create["experiment_id"], "0");
    assert_eq!(create["run_name"], "price_changes_direction_gbm");

    let batch = api.body_of("runs/log-batch").unwrap();
    assert_eq!(batch["run_id"], "run-123");
    assert_eq!(batch["params"].as_array().unwrap().len(), 2);
    assert_eq!(batch["metrics"][0]["key"], "accuracy");
    assert_eq!(batch["metrics"][0]["value"], 0.75);

    let update = api.body_of("runs/update").unwrap();
    assert_eq!(update["status"], "FINISHED");

    let artifacts = api.artifacts.lock().unwrap();
    let csv = artifacts.get("0/run-123/artifacts/confusion_matrix.csv").unwrap();
    assert!(csv.starts_with(b"actual,"));
}

#[tokio::test]
async fn mlflow_tracker_marks_run_failed_on_bad_artifact() {
    let api = Arc::new(FakeMlflow::default());
    let base_url = spawn_mlflow(api.clone()).await;
    let tracker = Tracker::from_config(&TrainingSection::default(), Some(base_url)).unwrap();

    let mut run = tracked_run();
    run.artifacts[0].path = "../escape.csv".to_string();
    assert!(tracker.log_run(&run).await.is_err());

    let update = api.body_of("runs/update").unwrap();
    assert_eq!(update["status"], "FAILED");
    assert!(api.artifacts.lock().unwrap().is_empty());
}
