//! Error types for Conveyor.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Definition errors: fatal at load time, the run never starts.
    #[error("Invalid pipeline definition: {0}")]
    Definition(String),

    #[error("Duplicate job name: {0}")]
    DuplicateJob(String),

    #[error("Job {job} needs unknown job: {missing}")]
    UnknownNeed { job: String, missing: String },

    #[error("Cycle detected in needs graph")]
    CyclicNeeds,

    #[error("Ambiguous matrix include in job {job}: {{{entry}}} matches {count} assignments")]
    AmbiguousInclude {
        job: String,
        entry: String,
        count: usize,
    },

    #[error("Invalid condition `{expr}`: {message}")]
    ConditionSyntax { expr: String, message: String },

    #[error("Unresolved placeholder in key template: {0}")]
    UnresolvedPlaceholder(String),

    // Condition errors: fail the owning step or job at evaluation time.
    #[error("Condition references undefined field: {0}")]
    UndefinedField(String),

    #[error("Condition did not evaluate to a boolean: {0}")]
    ConditionNotBoolean(String),

    // Execution errors. Command failure and timeout are ordinary step
    // and instance outcomes, not errors; only the runner itself failing
    // to execute surfaces here.
    #[error("Command runner error: {0}")]
    Runner(String),

    // Backend errors: non-fatal to a step's primary purpose unless the
    // cache/artifact operation is all the step does.
    #[error("Cache backend error: {0}")]
    CacheBackend(String),

    #[error("Artifact backend error: {0}")]
    ArtifactBackend(String),

    // Infrastructure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors that invalidate the pipeline document itself.
    pub fn is_definition(&self) -> bool {
        matches!(
            self,
            Error::Definition(_)
                | Error::DuplicateJob(_)
                | Error::UnknownNeed { .. }
                | Error::CyclicNeeds
                | Error::AmbiguousInclude { .. }
                | Error::ConditionSyntax { .. }
                | Error::UnresolvedPlaceholder(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
