//! Daily pipeline orchestration
//!
//! One run per logical date executes `extract_and_load_data` followed by one
//! `transform.<model>` task per SQL model, in dependency order. Every task
//! gets `retries` extra attempts; when a task still fails, everything
//! downstream of it is marked upstream-failed and the run is recorded as
//! failed.

use crate::coingecko::{ClientConfig, CoinGeckoClient};
use crate::config::{ConfigError, Credentials, PipelineConfig, API_KEY_ENV};
use crate::dag::{NodeId, TaskGraph};
use crate::ingest::{run_ingestion, IngestReport};
use crate::schedule::target_date;
use crate::training::{run_training, Tracker, TrainingReport};
use crate::transform::{ModelRun, TransformProject, TransformRunner};
use crate::warehouse::{RunClaim, Warehouse};
use crate::PipelineError;
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{error, info, warn};

pub use crate::warehouse::RunState;

/// Task id of the ingestion step.
pub const INGEST_TASK_ID: &str = "extract_and_load_data";

/// A node of the pipeline graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineTask {
    ExtractAndLoad,
    /// Materialize one SQL model
    Transform(String),
}

impl PipelineTask {
    pub fn task_id(&self) -> String {
        match self {
            PipelineTask::ExtractAndLoad => INGEST_TASK_ID.to_string(),
            PipelineTask::Transform(model) => format!("transform.{}", model),
        }
    }
}

/// Final state of a task within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Success,
    Failed,
    /// Not attempted because a dependency failed
    UpstreamFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskReport {
    pub task_id: String,
    pub state: TaskState,
    pub attempts: u32,
    pub error: Option<String>,
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub logical_date: NaiveDate,
    pub target_date: NaiveDate,
    pub state: RunState,
    /// Run attempt for this logical date, 0 when nothing was executed
    pub attempt: u32,
    /// The date had already succeeded and was not run again
    pub already_succeeded: bool,
    pub tasks: Vec<TaskReport>,
    pub ingest: Option<IngestReport>,
    pub models: Vec<ModelRun>,
}

impl RunReport {
    pub fn failed_tasks(&self) -> Vec<&TaskReport> {
        self.tasks
            .iter()
            .filter(|task| task.state != TaskState::Success)
            .collect()
    }
}

enum TaskOutput {
    Ingest(IngestReport),
    Model(ModelRun),
}

/// Everything a run needs: configuration, warehouse, API client, SQL
/// project and experiment tracker.
pub struct Pipeline {
    config: PipelineConfig,
    warehouse: Warehouse,
    /// Absent without an API key; ingestion then fails, other steps still work
    client: Option<CoinGeckoClient>,
    project: TransformProject,
    graph: TaskGraph<PipelineTask>,
    tracker: Tracker,
}

impl Pipeline {
    /// Opens the warehouse, loads the SQL project and prepares the clients.
    pub fn new(config: PipelineConfig, credentials: &Credentials) -> Result<Self, PipelineError> {
        let warehouse = Warehouse::open(config.warehouse_path(credentials))?;
        let client = match credentials.require_api_key() {
            Ok(key) => Some(CoinGeckoClient::new(ClientConfig::from_section(&config.coingecko), key)?),
            Err(e) => {
                warn!(error = %e, "Pipeline: ingestion disabled");
                None
            }
        };
        let project = TransformProject::load(
            &config.transform.project_dir,
            &config.transform.target_schema,
            &config.transform.exclude,
        )?;
        let tracker = Tracker::from_config(&config.training, config.mlflow_uri(credentials))
            .map_err(|e| PipelineError::Training(e.into()))?;

        Self::from_parts(config, warehouse, client, project, tracker)
    }

    /// Assembles a pipeline from already-built parts.
    pub fn from_parts(
        config: PipelineConfig,
        warehouse: Warehouse,
        client: Option<CoinGeckoClient>,
        project: TransformProject,
        tracker: Tracker,
    ) -> Result<Self, PipelineError> {
        let graph = build_task_graph(&project)?;
        info!(
            tasks = graph.node_count(),
            dependencies = graph.edge_count(),
            "Pipeline: task graph built"
        );
        Ok(Pipeline {
            config,
            warehouse,
            client,
            project,
            graph,
            tracker,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn warehouse(&self) -> &Warehouse {
        &self.warehouse
    }

    pub fn project(&self) -> &TransformProject {
        &self.project
    }

    /// Task ids in execution order.
    pub fn task_ids(&self) -> Vec<String> {
        self.graph
            .execution_order()
            .into_iter()
            .filter_map(|id| self.graph.get_node(id))
            .map(PipelineTask::task_id)
            .collect()
    }

    /// Runs the whole graph for `logical_date` under run bookkeeping.
    ///
    /// A date that already succeeded is reported and skipped unless `force`.
    ///
    /// # Errors
    /// Fails without running anything when another run of the same date is
    /// in progress. Task failures do not make this an error; they are
    /// recorded in the report and in the run state.
    pub async fn run(&mut self, logical_date: NaiveDate, force: bool) -> Result<RunReport, PipelineError> {
        let target = target_date(logical_date);
        let attempt = match self.warehouse.claim_run(logical_date, force)? {
            RunClaim::AlreadySucceeded => {
                info!(logical_date = %logical_date, "Pipeline: run already succeeded, skipping");
                return Ok(RunReport {
                    logical_date,
                    target_date: target,
                    state: RunState::Success,
                    attempt: 0,
                    already_succeeded: true,
                    tasks: Vec::new(),
                    ingest: None,
                    models: Vec::new(),
                });
            }
            RunClaim::Claimed { attempt } => attempt,
        };

        info!(
            logical_date = %logical_date,
            target_date = %target,
            attempt,
            "Pipeline: run started"
        );

        let mut report = RunReport {
            logical_date,
            target_date: target,
            state: RunState::Running,
            attempt,
            already_succeeded: false,
            tasks: Vec::new(),
            ingest: None,
            models: Vec::new(),
        };

        let mut failed: BTreeSet<NodeId> = BTreeSet::new();
        for node_id in self.graph.execution_order() {
            let Some(task) = self.graph.get_node(node_id).cloned() else {
                continue;
            };
            let task_id = task.task_id();

            if self.graph.parents(node_id).iter().any(|parent| failed.contains(parent)) {
                warn!(task = %task_id, "Pipeline: upstream failed, task not run");
                failed.insert(node_id);
                report.tasks.push(TaskReport {
                    task_id,
                    state: TaskState::UpstreamFailed,
                    attempts: 0,
                    error: None,
                });
                continue;
            }

            let (result, attempts) = self.run_with_retries(&task, logical_date).await;
            match result {
                Ok(output) => {
                    match output {
                        TaskOutput::Ingest(ingest) => report.ingest = Some(ingest),
                        TaskOutput::Model(model) => report.models.push(model),
                    }
                    report.tasks.push(TaskReport {
                        task_id,
                        state: TaskState::Success,
                        attempts,
                        error: None,
                    });
                }
                Err(e) => {
                    error!(task = %task_id, attempts, error = %e, "Pipeline: task failed");
                    failed.insert(node_id);
                    report.tasks.push(TaskReport {
                        task_id,
                        state: TaskState::Failed,
                        attempts,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let first_failure = report
            .tasks
            .iter()
            .find(|task| task.state == TaskState::Failed)
            .map(|task| format!("{}: {}", task.task_id, task.error.as_deref().unwrap_or("failed")));
        report.state = if first_failure.is_some() {
            RunState::Failed
        } else {
            RunState::Success
        };
        self.warehouse
            .finish_run(logical_date, report.state, first_failure.as_deref())?;

        info!(
            logical_date = %logical_date,
            state = %report.state,
            tasks = report.tasks.len(),
            failed = report.failed_tasks().len(),
            "Pipeline: run finished"
        );
        Ok(report)
    }

    async fn run_with_retries(
        &mut self,
        task: &PipelineTask,
        logical_date: NaiveDate,
    ) -> (Result<TaskOutput, PipelineError>, u32) {
        let max_attempts = self.config.schedule.retries + 1;
        let delay = Duration::from_secs(self.config.schedule.retry_delay_seconds);
        let mut attempt = 1;
        loop {
            let result = self.run_task(task, logical_date).await;
            match result {
                Err(e) if attempt < max_attempts => {
                    warn!(
                        task = %task.task_id(),
                        attempt,
                        retry_in_secs = delay.as_secs(),
                        error = %e,
                        "Pipeline: task attempt failed, retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                other => return (other, attempt),
            }
        }
    }

    async fn run_task(&mut self, task: &PipelineTask, logical_date: NaiveDate) -> Result<TaskOutput, PipelineError> {
        match task {
            PipelineTask::ExtractAndLoad => self.ingest(logical_date).await.map(TaskOutput::Ingest),
            PipelineTask::Transform(model) => self.transform_model(model, logical_date).map(TaskOutput::Model),
        }
    }

    /// The ingestion step alone, without run bookkeeping.
    pub async fn ingest(&mut self, logical_date: NaiveDate) -> Result<IngestReport, PipelineError> {
        let client = self
            .client
            .as_ref()
            .ok_or(PipelineError::Config(ConfigError::MissingSecret(API_KEY_ENV)))?;
        let relation = self.config.raw_relation();
        run_ingestion(
            client,
            &mut self.warehouse,
            &self.config.coingecko.coins,
            &relation,
            logical_date,
        )
        .await
    }

    fn transform_model(&mut self, model: &str, logical_date: NaiveDate) -> Result<ModelRun, PipelineError> {
        let runner = transform_runner(&self.project, &self.config, logical_date);
        Ok(runner.run_model(&mut self.warehouse, model)?)
    }

    /// Every model for `logical_date` in dependency order, without run
    /// bookkeeping. Stops at the first failing model.
    pub fn transform(&mut self, logical_date: NaiveDate) -> Result<Vec<ModelRun>, PipelineError> {
        let runner = transform_runner(&self.project, &self.config, logical_date);
        Ok(runner.run_all(&mut self.warehouse)?)
    }

    /// Fails runs left in `running` by a process that died mid-run.
    ///
    /// Callers must be the only process executing runs on this warehouse.
    pub fn reclaim_interrupted_runs(&mut self) -> Result<BTreeSet<NaiveDate>, PipelineError> {
        let reclaimed = self.warehouse.reclaim_interrupted_runs()?;
        for logical_date in &reclaimed {
            warn!(logical_date = %logical_date, "Pipeline: interrupted run marked failed");
        }
        Ok(reclaimed)
    }

    /// Runs every logical date in `[from, to]` oldest first, skipping dates
    /// that already succeeded. A failed date does not stop later ones.
    pub async fn backfill(&mut self, from: NaiveDate, to: NaiveDate) -> Result<Vec<RunReport>, PipelineError> {
        if from > to {
            return Err(PipelineError::InvalidArgument(format!(
                "backfill start {} is after end {}",
                from, to
            )));
        }
        let completed = self.warehouse.completed_runs()?;
        let mut reports = Vec::new();
        for date in from.iter_days().take_while(|date| *date <= to) {
            if completed.contains(&date) {
                info!(logical_date = %date, "Pipeline: backfill skipping completed date");
                continue;
            }
            reports.push(self.run(date, false).await?);
        }

        let failed = reports.iter().filter(|r| r.state == RunState::Failed).count();
        info!(from = %from, to = %to, runs = reports.len(), failed, "Pipeline: backfill finished");
        Ok(reports)
    }

    /// Trains and logs the price-direction model on the current feature table.
    pub async fn train(&self) -> Result<TrainingReport, PipelineError> {
        Ok(run_training(&self.warehouse, &self.config.training, &self.tracker).await?)
    }
}

/// Runner with `execution_date` bound to the day the run reports on.
fn transform_runner<'a>(
    project: &'a TransformProject,
    config: &PipelineConfig,
    logical_date: NaiveDate,
) -> TransformRunner<'a> {
    TransformRunner::new(project, config.source_datasets()).with_var(
        "execution_date",
        target_date(logical_date).format("%Y-%m-%d").to_string(),
    )
}

/// `extract_and_load_data` feeds every model without refs; model edges follow refs.
fn build_task_graph(project: &TransformProject) -> Result<TaskGraph<PipelineTask>, PipelineError> {
    let mut graph = TaskGraph::new();
    let ingest = graph.add_node(PipelineTask::ExtractAndLoad);

    let mut node_of: BTreeMap<&str, NodeId> = BTreeMap::new();
    for model in project.models() {
        let node = graph.add_node(PipelineTask::Transform(model.name.clone()));
        node_of.insert(model.name.as_str(), node);
    }
    for root in project.root_models() {
        if let Some(&node) = node_of.get(root.name.as_str()) {
            graph.add_edge(ingest, node)?;
        }
    }
    for model in project.models() {
        let node = node_of[model.name.as_str()];
        for reference in model.refs() {
            if let Some(&parent) = node_of.get(reference) {
                graph.add_edge(parent, node)?;
            }
        }
    }
    Ok(graph)
}
