//! Experiment tracking: a local run directory or an MLflow server.

use crate::config::TrainingSection;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// A file attached to a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Relative path inside the run's artifact root
    pub path: String,
    pub content: Vec<u8>,
}

/// Everything logged for one training run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackedRun {
    pub run_name: String,
    pub params: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, f64>,
    pub artifacts: Vec<Artifact>,
}

/// Where a logged run ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoggedRun {
    pub run_id: String,
    /// Run directory or server URL
    pub location: String,
}

#[derive(Debug, Clone)]
pub enum Tracker {
    Local(LocalTracker),
    Mlflow(MlflowTracker),
}

impl Tracker {
    /// MLflow when a tracking URI is known, the local directory otherwise.
    pub fn from_config(section: &TrainingSection, mlflow_uri: Option<String>) -> Result<Self, TrackerError> {
        match mlflow_uri {
            Some(uri) => Ok(Tracker::Mlflow(MlflowTracker::new(&uri, &section.experiment_id)?)),
            None => Ok(Tracker::Local(LocalTracker::new(
                &section.tracking_dir,
                &section.experiment_id,
            ))),
        }
    }

    pub async fn log_run(&self, run: &TrackedRun) -> Result<LoggedRun, TrackerError> {
        let logged = match self {
            Tracker::Local(tracker) => tracker.log_run(run)?,
            Tracker::Mlflow(tracker) => tracker.log_run(run).await?,
        };
        info!(
            run_id = %logged.run_id,
            location = %logged.location,
            params = run.params.len(),
            metrics = run.metrics.len(),
            artifacts = run.artifacts.len(),
            "Tracker: run logged"
        );
        Ok(logged)
    }
}

/// Writes runs to `<root>/<experiment_id>/<run_id>/`.
#[derive(Debug, Clone)]
pub struct LocalTracker {
    root: PathBuf,
    experiment_id: String,
}

impl LocalTracker {
    pub fn new(root: &Path, experiment_id: &str) -> Self {
        LocalTracker {
            root: root.to_path_buf(),
            experiment_id: experiment_id.to_string(),
        }
    }

    fn log_run(&self, run: &TrackedRun) -> Result<LoggedRun, TrackerError> {
        let run_id = Uuid::new_v4().simple().to_string();
        let run_dir = self.root.join(&self.experiment_id).join(&run_id);
        let artifact_dir = run_dir.join("artifacts");
        std::fs::create_dir_all(&artifact_dir).map_err(|e| io_error(&artifact_dir, e))?;

        let meta = json!({
            "run_id": run_id,
            "run_name": run.run_name,
            "experiment_id": self.experiment_id,
            "status": "FINISHED",
            "end_time": Utc::now().to_rfc3339(),
        });
        write_json(&run_dir.join("meta.json"), &meta)?;
        write_json(&run_dir.join("params.json"), &json!(run.params))?;
        write_json(&run_dir.join("metrics.json"), &json!(run.metrics))?;

        for artifact in &run.artifacts {
            let path = artifact_dir.join(safe_relative_path(&artifact.path)?);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
            }
            std::fs::write(&path, &artifact.content).map_err(|e| io_error(&path, e))?;
        }

        Ok(LoggedRun {
            run_id,
            location: run_dir.display().to_string(),
        })
    }
}

fn write_json(path: &Path, value: &Value) -> Result<(), TrackerError> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| TrackerError::Serialization(e.to_string()))?;
    std::fs::write(path, bytes).map_err(|e| io_error(path, e))
}

fn io_error(path: &Path, err: std::io::Error) -> TrackerError {
    TrackerError::Io(format!("{}: {}", path.display(), err))
}

/// Rejects absolute paths and `..` so artifacts stay inside the run.
fn safe_relative_path(path: &str) -> Result<PathBuf, TrackerError> {
    let candidate = Path::new(path);
    let normal = !path.is_empty()
        && candidate
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if normal {
        Ok(candidate.to_path_buf())
    } else {
        Err(TrackerError::InvalidArtifactPath(path.to_string()))
    }
}

/// Logs runs through the MLflow REST API.
#[derive(Debug, Clone)]
pub struct MlflowTracker {
    client: reqwest::Client,
    base_url: String,
    experiment_id: String,
}

impl MlflowTracker {
    pub fn new(base_url: &str, experiment_id: &str) -> Result<Self, TrackerError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| TrackerError::Http(format!("failed to create HTTP client: {}", e)))?;
        Ok(MlflowTracker {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            experiment_id: experiment_id.to_string(),
        })
    }

    async fn post(&self, endpoint: &str, body: &Value) -> Result<Value, TrackerError> {
        let url = format!("{}/api/2.0/mlflow/{}", self.base_url, endpoint);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| TrackerError::Http(format!("{}: {}", endpoint, e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TrackerError::Http(format!("{} returned {}: {}", endpoint, status, text)));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| TrackerError::Serialization(format!("{}: {}", endpoint, e)))
    }

    async fn log_run(&self, run: &TrackedRun) -> Result<LoggedRun, TrackerError> {
        let created = self
            .post(
                "runs/create",
                &json!({
                    "experiment_id": self.experiment_id,
                    "run_name": run.run_name,
                    "start_time": Utc::now().timestamp_millis(),
                    "tags": [{"key": "mlflow.runName", "value": run.run_name}],
                }),
            )
            .await?;
        let run_id = created["run"]["info"]["run_id"]
            .as_str()
            .ok_or_else(|| TrackerError::Serialization("runs/create response has no run_id".to_string()))?
            .to_string();

        match self.log_contents(&run_id, run).await {
            Ok(()) => {
                self.finish(&run_id, "FINISHED").await?;
                Ok(LoggedRun {
                    location: format!("{}/#/experiments/{}/runs/{}", self.base_url, self.experiment_id, run_id),
                    run_id,
                })
            }
            Err(e) => {
                if let Err(update_err) = self.finish(&run_id, "FAILED").await {
                    warn!(run_id = %run_id, error = %update_err, "Tracker: could not mark run failed");
                }
                Err(e)
            }
        }
    }

    async fn log_contents(&self, run_id: &str, run: &TrackedRun) -> Result<(), TrackerError> {
        let timestamp = Utc::now().timestamp_millis();
        let params: Vec<Value> = run
            .params
            .iter()
            .map(|(key, value)| json!({"key": key, "value": value}))
            .collect();
        let metrics: Vec<Value> = run
            .metrics
            .iter()
            .map(|(key, value)| json!({"key": key, "value": value, "timestamp": timestamp, "step": 0}))
            .collect();
        self.post(
            "runs/log-batch",
            &json!({"run_id": run_id, "params": params, "metrics": metrics}),
        )
        .await?;

        for artifact in &run.artifacts {
            safe_relative_path(&artifact.path)?;
            let url = format!(
                "{}/api/2.0/mlflow-artifacts/artifacts/{}/{}/artifacts/{}",
                self.base_url, self.experiment_id, run_id, artifact.path
            );
            let response = self
                .client
                .put(&url)
                .body(artifact.content.clone())
                .send()
                .await
                .map_err(|e| TrackerError::Http(format!("artifact {}: {}", artifact.path, e)))?;
            if !response.status().is_success() {
                return Err(TrackerError::Http(format!(
                    "artifact {} upload returned {}",
                    artifact.path,
                    response.status()
                )));
            }
        }
        Ok(())
    }

    async fn finish(&self, run_id: &str, status: &str) -> Result<(), TrackerError> {
        self.post(
            "runs/update",
            &json!({
                "run_id": run_id,
                "status": status,
                "end_time": Utc::now().timestamp_millis(),
            }),
        )
        .await
        .map(|_| ())
    }
}

/// Errors raised while logging a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    /// The local run directory could not be written
    Io(String),
    /// The tracking server could not be reached or rejected a request
    Http(String),
    /// A payload could not be encoded or decoded
    Serialization(String),
    /// An artifact path escapes the run directory
    InvalidArtifactPath(String),
}

impl std::fmt::Display for TrackerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerError::Io(msg) => write!(f, "Tracker I/O error: {}", msg),
            TrackerError::Http(msg) => write!(f, "Tracker HTTP error: {}", msg),
            TrackerError::Serialization(msg) => write!(f, "Tracker serialization error: {}", msg),
            TrackerError::InvalidArtifactPath(path) => write!(f, "Invalid artifact path: {}", path),
        }
    }
}

impl std::error::Error for TrackerError {}
