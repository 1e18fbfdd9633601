//! Rendering and materializing models into the warehouse.

use super::model::{Materialization, Segment, SqlModel};
use super::project::TransformProject;
use super::TransformError;
use crate::warehouse::{qualified_name, Warehouse};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::info;

/// Result of materializing one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelRun {
    pub model: String,
    pub relation: String,
    pub materialization: &'static str,
    pub rows: u64,
    pub elapsed_ms: u128,
}

/// Runs the models of a project against a warehouse.
pub struct TransformRunner<'a> {
    project: &'a TransformProject,
    /// Source name -> dataset
    sources: BTreeMap<String, String>,
    vars: BTreeMap<String, String>,
}

impl<'a> TransformRunner<'a> {
    pub fn new(project: &'a TransformProject, sources: BTreeMap<String, String>) -> Self {
        TransformRunner {
            project,
            sources,
            vars: BTreeMap::new(),
        }
    }

    /// Sets a variable available to models through `var('key')`.
    pub fn with_var(mut self, key: &str, value: impl Into<String>) -> Self {
        self.vars.insert(key.to_string(), value.into());
        self
    }

    /// Resolves every placeholder of a model into plain SQL.
    pub fn render(&self, model: &SqlModel) -> Result<String, TransformError> {
        let mut sql = String::new();
        for segment in &model.segments {
            match segment {
                Segment::Text(text) => sql.push_str(text),
                Segment::Ref(name) => {
                    let target = self.project.model(name).ok_or_else(|| TransformError::UnknownRef {
                        model: model.name.clone(),
                        reference: name.clone(),
                    })?;
                    sql.push('"');
                    sql.push_str(&self.project.relation_name(target));
                    sql.push('"');
                }
                Segment::Source { name, table } => {
                    let dataset = self.sources.get(name).ok_or_else(|| TransformError::UnknownSource {
                        model: model.name.clone(),
                        source: name.clone(),
                    })?;
                    let relation = qualified_name(dataset, table);
                    if !crate::warehouse::is_valid_identifier(&relation) {
                        return Err(TransformError::InvalidIdentifier(relation));
                    }
                    sql.push('"');
                    sql.push_str(&relation);
                    sql.push('"');
                }
                Segment::Var(key) => {
                    let value = self.vars.get(key).ok_or_else(|| TransformError::UnknownVar {
                        model: model.name.clone(),
                        var: key.clone(),
                    })?;
                    sql.push_str(value);
                }
            }
        }

        Ok(sql.trim().trim_end_matches(';').trim_end().to_string())
    }

    /// Materializes a single model by name.
    pub fn run_model(&self, warehouse: &mut Warehouse, name: &str) -> Result<ModelRun, TransformError> {
        let model = self
            .project
            .model(name)
            .ok_or_else(|| TransformError::UnknownModel(name.to_string()))?;
        let sql = self.render(model)?;
        let relation = self.project.relation_name(model);
        let started = Instant::now();

        let sql_error = |e: rusqlite::Error| TransformError::Sql {
            model: model.name.clone(),
            message: e.to_string(),
        };

        let conn = warehouse.connection_mut();
        let tx = conn.transaction().map_err(sql_error)?;
        drop_relation(&tx, &relation).map_err(sql_error)?;
        tx.execute_batch(&format!(
            "CREATE {} \"{}\" AS {}",
            model.materialization.as_sql(),
            relation,
            sql
        ))
        .map_err(sql_error)?;
        let rows: i64 = tx
            .query_row(&format!("SELECT COUNT(*) FROM \"{}\"", relation), [], |row| row.get(0))
            .map_err(sql_error)?;
        tx.commit().map_err(sql_error)?;

        let run = ModelRun {
            model: model.name.clone(),
            relation,
            materialization: match model.materialization {
                Materialization::View => "view",
                Materialization::Table => "table",
            },
            rows: rows.max(0) as u64,
            elapsed_ms: started.elapsed().as_millis(),
        };
        info!(
            model = %run.model,
            relation = %run.relation,
            materialized = run.materialization,
            rows = run.rows,
            elapsed_ms = run.elapsed_ms as u64,
            "Transform: model built"
        );
        Ok(run)
    }

    /// Materializes every model in dependency order, stopping at the first failure.
    pub fn run_all(&self, warehouse: &mut Warehouse) -> Result<Vec<ModelRun>, TransformError> {
        let mut runs = Vec::with_capacity(self.project.models().len());
        for model in self.project.execution_order() {
            runs.push(self.run_model(warehouse, &model.name)?);
        }
        Ok(runs)
    }
}

/// Drops whatever currently occupies `relation`, view or table.
fn drop_relation(conn: &Connection, relation: &str) -> rusqlite::Result<()> {
    let kind: Option<String> = conn
        .query_row(
            "SELECT type FROM sqlite_master WHERE name = ?1 AND type IN ('table', 'view')",
            [relation],
            |row| row.get(0),
        )
        .optional()?;
    match kind.as_deref() {
        Some("view") => conn.execute_batch(&format!("DROP VIEW \"{}\"", relation)),
        Some(_) => conn.execute_batch(&format!("DROP TABLE \"{}\"", relation)),
        None => Ok(()),
    }
}
