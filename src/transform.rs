//! SQL Modeling Layer
//!
//! A project directory holds `models/**/*.sql`. Each file is one model whose
//! name is the file stem. Models reference each other with `{{ ref('x') }}`,
//! raw tables with `{{ source('name', 'table') }}` and run variables with
//! `{{ var('key') }}`; `{{ config(materialized='table', schema='marts') }}`
//! controls how and where the result is materialized.
//!
//! Models are executed in dependency order, each one replacing its previous
//! materialization inside a single transaction.

pub mod model;
pub mod project;
pub mod runner;

pub use model::{Materialization, Segment, SqlModel};
pub use project::TransformProject;
pub use runner::{ModelRun, TransformRunner};

/// Errors raised while loading or running SQL models.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// The project directory could not be read
    Io(String),
    /// A placeholder could not be parsed
    Parse { model: String, message: String },
    /// Two files share a model name
    DuplicateModel(String),
    /// A model name was requested that does not exist
    UnknownModel(String),
    /// `ref()` names a model that does not exist
    UnknownRef { model: String, reference: String },
    /// `source()` names a source with no configured dataset
    UnknownSource { model: String, source: String },
    /// `var()` names a variable that was not provided
    UnknownVar { model: String, var: String },
    /// Models reference each other in a loop
    Cycle(String),
    /// A model or schema name is not a plain identifier
    InvalidIdentifier(String),
    /// The warehouse rejected the rendered SQL
    Sql { model: String, message: String },
}

impl std::fmt::Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransformError::Io(msg) => write!(f, "Project read error: {}", msg),
            TransformError::Parse { model, message } => {
                write!(f, "Parse error in model '{}': {}", model, message)
            }
            TransformError::DuplicateModel(name) => write!(f, "Duplicate model name: {}", name),
            TransformError::UnknownModel(name) => write!(f, "Unknown model: {}", name),
            TransformError::UnknownRef { model, reference } => {
                write!(f, "Model '{}' references unknown model '{}'", model, reference)
            }
            TransformError::UnknownSource { model, source } => {
                write!(f, "Model '{}' uses unknown source '{}'", model, source)
            }
            TransformError::UnknownVar { model, var } => {
                write!(f, "Model '{}' uses undefined var '{}'", model, var)
            }
            TransformError::Cycle(msg) => write!(f, "Model cycle: {}", msg),
            TransformError::InvalidIdentifier(name) => write!(f, "Invalid identifier: {}", name),
            TransformError::Sql { model, message } => {
                write!(f, "SQL error in model '{}': {}", model, message)
            }
        }
    }
}

impl std::error::Error for TransformError {}
