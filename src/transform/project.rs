//! Loading a model project from disk and ordering its models.

use super::model::SqlModel;
use super::TransformError;
use crate::dag::{DagError, NodeId, TaskGraph};
use crate::warehouse::{is_valid_identifier, qualified_name};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A set of SQL models with their dependency graph.
#[derive(Debug)]
pub struct TransformProject {
    target_schema: String,
    /// Models sorted by name
    models: Vec<SqlModel>,
    graph: TaskGraph<usize>,
    node_of: BTreeMap<String, NodeId>,
}

impl TransformProject {
    /// Reads every `models/**/*.sql` file under `project_dir`.
    ///
    /// `exclude` holds path prefixes relative to the project dir, optionally
    /// written as `path:models/example`; matching files are ignored entirely.
    pub fn load(
        project_dir: &Path,
        target_schema: &str,
        exclude: &[String],
    ) -> Result<Self, TransformError> {
        let models_dir = project_dir.join("models");
        let mut files = Vec::new();
        collect_sql_files(&models_dir, &mut files)?;
        files.sort();

        let mut models = Vec::new();
        for file in files {
            let relative = relative_path(project_dir, &file);
            if is_excluded(&relative, exclude) {
                debug!(path = %relative, "Transform: model excluded");
                continue;
            }
            let name = file
                .file_stem()
                .and_then(|stem| stem.to_str())
                .ok_or_else(|| TransformError::Io(format!("bad model file name {}", file.display())))?
                .to_string();
            let sql = std::fs::read_to_string(&file)
                .map_err(|e| TransformError::Io(format!("{}: {}", file.display(), e)))?;
            models.push(SqlModel::parse(&name, &relative, &sql)?);
        }

        Self::from_models(models, target_schema)
    }

    /// Builds a project from already-parsed models.
    ///
    /// Fails on duplicate names, unknown refs, invalid identifiers or cycles.
    pub fn from_models(mut models: Vec<SqlModel>, target_schema: &str) -> Result<Self, TransformError> {
        if !is_valid_identifier(target_schema) {
            return Err(TransformError::InvalidIdentifier(target_schema.to_string()));
        }
        models.sort_by(|a, b| a.name.cmp(&b.name));

        let mut graph = TaskGraph::new();
        let mut node_of = BTreeMap::new();
        for (position, model) in models.iter().enumerate() {
            if !is_valid_identifier(&model.name) {
                return Err(TransformError::InvalidIdentifier(model.name.clone()));
            }
            if let Some(schema) = &model.schema {
                if !is_valid_identifier(schema) {
                    return Err(TransformError::InvalidIdentifier(schema.clone()));
                }
            }
            if node_of.contains_key(&model.name) {
                return Err(TransformError::DuplicateModel(model.name.clone()));
            }
            node_of.insert(model.name.clone(), graph.add_node(position));
        }

        for model in &models {
            let child = node_of[&model.name];
            for reference in model.refs() {
                let parent = *node_of.get(reference).ok_or_else(|| TransformError::UnknownRef {
                    model: model.name.clone(),
                    reference: reference.to_string(),
                })?;
                graph.add_edge(parent, child).map_err(|e| match e {
                    DagError::CycleDetected(_) => TransformError::Cycle(format!(
                        "'{}' -> '{}' closes a cycle",
                        reference, model.name
                    )),
                    DagError::NodeNotFound(msg) => TransformError::UnknownModel(msg),
                })?;
            }
        }

        Ok(TransformProject {
            target_schema: target_schema.to_string(),
            models,
            graph,
            node_of,
        })
    }

    /// Models sorted by name.
    pub fn models(&self) -> &[SqlModel] {
        &self.models
    }

    pub fn model(&self, name: &str) -> Option<&SqlModel> {
        self.node_of
            .get(name)
            .and_then(|&id| self.graph.get_node(id))
            .map(|&position| &self.models[position])
    }

    /// Warehouse relation a model materializes into.
    ///
    /// The schema is the target schema, suffixed with the model's custom
    /// schema when it sets one: `dev_coingecko` + `marts` gives
    /// `dev_coingecko_marts__<model>`.
    pub fn relation_name(&self, model: &SqlModel) -> String {
        let schema = match &model.schema {
            Some(custom) => format!("{}_{}", self.target_schema, custom),
            None => self.target_schema.clone(),
        };
        qualified_name(&schema, &model.name)
    }

    /// Every model after all of the models it references.
    pub fn execution_order(&self) -> Vec<&SqlModel> {
        self.graph
            .execution_order()
            .into_iter()
            .filter_map(|id| self.graph.get_node(id))
            .map(|&position| &self.models[position])
            .collect()
    }

    /// Models with no refs; these read only from sources.
    pub fn root_models(&self) -> Vec<&SqlModel> {
        self.models.iter().filter(|m| m.refs().is_empty()).collect()
    }
}

fn collect_sql_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), TransformError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| TransformError::Io(format!("{}: {}", dir.display(), e)))?;
    for entry in entries {
        let path = entry
            .map_err(|e| TransformError::Io(format!("{}: {}", dir.display(), e)))?
            .path();
        if path.is_dir() {
            collect_sql_files(&path, files)?;
        } else if path.extension().and_then(|ext| ext.to_str()) == Some("sql") {
            files.push(path);
        }
    }
    Ok(())
}

fn relative_path(root: &Path, file: &Path) -> String {
    let relative = file.strip_prefix(root).unwrap_or(file);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn is_excluded(relative: &str, exclude: &[String]) -> bool {
    exclude.iter().any(|pattern| {
        let prefix = pattern
            .strip_prefix("path:")
            .unwrap_or(pattern)
            .trim_end_matches('/');
        relative == prefix || relative.starts_with(&format!("{}/", prefix))
    })
}
