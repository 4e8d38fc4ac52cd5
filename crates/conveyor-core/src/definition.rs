//! Pipeline definition types.
//!
//! These types represent the user-authored pipeline YAML document. They
//! are immutable after load; a run instantiates them into job instances.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single value of a matrix dimension (string, number or bool).
pub type DimensionValue = serde_json::Value;

/// One concrete binding of dimension names to values.
///
/// A `BTreeMap` keeps iteration independent of declaration order, which
/// makes expansion and display deterministic.
pub type DimensionAssignment = BTreeMap<String, DimensionValue>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub jobs: Vec<JobDefinition>,
}

fn default_version() -> String {
    "1".to_string()
}

impl PipelineDefinition {
    /// Parse a pipeline document from YAML.
    pub fn from_yaml(input: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(input)?)
    }

    /// Look up a job by name.
    pub fn job(&self, name: &str) -> Option<&JobDefinition> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    #[serde(default)]
    pub needs: Vec<String>,
    /// Job-level predicate, evaluated once per run with no matrix context.
    #[serde(default, rename = "if")]
    pub condition: Option<String>,
    #[serde(default)]
    pub strategy: Option<Strategy>,
    #[serde(default = "default_job_timeout")]
    pub timeout_minutes: u32,
    /// Run even when a needed job has a failed instance.
    #[serde(default)]
    pub run_on_upstream_failure: bool,
    pub steps: Vec<StepDefinition>,
}

fn default_job_timeout() -> u32 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    #[serde(default)]
    pub matrix: Option<MatrixDefinition>,
    #[serde(default = "default_true")]
    pub fail_fast: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatrixDefinition {
    #[serde(default)]
    pub dimensions: BTreeMap<String, Vec<DimensionValue>>,
    /// Partial assignments removed from the cross product.
    #[serde(default)]
    pub exclude: Vec<DimensionAssignment>,
    /// Extra assignments merged into matching instances or appended.
    #[serde(default)]
    pub include: Vec<DimensionAssignment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    #[serde(default, rename = "if")]
    pub condition: Option<String>,
    /// Command payload handed to the external runner. A step without a
    /// payload may still carry a cache or artifact block.
    #[serde(default)]
    pub run: Option<String>,
    /// Gating against prior failure within the same instance. Failure
    /// steps never run implicitly; they must be tagged here.
    #[serde(default)]
    pub run_when: RunWhen,
    #[serde(default, rename = "continue-on-error")]
    pub continue_on_failure: bool,
    #[serde(default)]
    pub cache: Option<CacheSpec>,
    #[serde(default)]
    pub artifact: Option<ArtifactSpec>,
}

impl StepDefinition {
    /// True when the step exists only for its cache/artifact side effect,
    /// in which case a backend failure fails the step itself.
    pub fn side_effect_only(&self) -> bool {
        self.run.is_none() && (self.cache.is_some() || self.artifact.is_some())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunWhen {
    /// Run only while no prior step has failed (the default).
    #[default]
    Success,
    /// Run regardless of prior failure.
    Always,
    /// Run only after a prior step has failed.
    OnFailure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSpec {
    /// Path restored into / saved from, relative to the workspace.
    pub path: String,
    /// Exact key template, e.g. `pip-${{ matrix.os }}-${{ hash }}`.
    pub key: String,
    /// Fallback prefixes tried in declared order on an exact miss.
    #[serde(default, rename = "restore-keys")]
    pub restore_keys: Vec<String>,
    /// Files whose contents feed the `${{ hash }}` placeholder.
    #[serde(default, rename = "hash-files")]
    pub hash_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSpec {
    /// Name template, e.g. `wheels-${{ matrix.os }}`.
    pub name: String,
    /// Glob patterns selecting files relative to the workspace.
    pub paths: Vec<String>,
    /// Glob patterns removed from the selection.
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Render a dimension value without JSON quoting for display.
pub fn dimension_value_str(value: &DimensionValue) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render an assignment as `k=v, k=v` in dimension-name order.
pub fn format_assignment(assignment: &DimensionAssignment) -> String {
    assignment
        .iter()
        .map(|(k, v)| format!("{}={}", k, dimension_value_str(v)))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_minimal_pipeline() {
        let yaml = r#"
name: minimal
jobs:
  - name: build
    steps:
      - name: compile
        run: make
"#;
        let def = PipelineDefinition::from_yaml(yaml).unwrap();
        assert_eq!(def.name, "minimal");
        assert_eq!(def.version, "1");
        assert_eq!(def.jobs.len(), 1);
        let job = def.job("build").unwrap();
        assert!(job.needs.is_empty());
        assert_eq!(job.timeout_minutes, 60);
        assert_eq!(job.steps[0].run_when, RunWhen::Success);
        assert!(!job.steps[0].continue_on_failure);
    }

    #[test]
    fn test_parse_matrix_and_cache() {
        let yaml = r#"
name: matrixed
jobs:
  - name: tests
    strategy:
      fail_fast: false
      matrix:
        dimensions:
          os: [ubuntu, macos]
          task: [unit, docs]
        exclude:
          - os: macos
            task: docs
        include:
          - os: windows
            python-version: "3.10"
    steps:
      - name: restore
        cache:
          path: .venv
          key: venv-${{ matrix.os }}-${{ hash }}
          restore-keys: ["venv-${{ matrix.os }}-"]
          hash-files: ["poetry.lock"]
      - name: run
        run: make test
        continue-on-error: true
      - name: diagnose
        run: make report
        run_when: on_failure
"#;
        let def = PipelineDefinition::from_yaml(yaml).unwrap();
        let job = def.job("tests").unwrap();
        let strategy = job.strategy.as_ref().unwrap();
        assert!(!strategy.fail_fast);
        let matrix = strategy.matrix.as_ref().unwrap();
        assert_eq!(matrix.dimensions["os"].len(), 2);
        assert_eq!(matrix.exclude.len(), 1);
        assert_eq!(matrix.include.len(), 1);

        let restore = &job.steps[0];
        assert!(restore.run.is_none());
        assert!(restore.side_effect_only());
        let cache = restore.cache.as_ref().unwrap();
        assert_eq!(cache.restore_keys.len(), 1);

        assert!(job.steps[1].continue_on_failure);
        assert_eq!(job.steps[2].run_when, RunWhen::OnFailure);
    }

    #[test]
    fn test_format_assignment_sorted() {
        let mut a = DimensionAssignment::new();
        a.insert("task".into(), serde_json::json!("docs"));
        a.insert("os".into(), serde_json::json!("ubuntu"));
        a.insert("python-version".into(), serde_json::json!(3.8));
        assert_eq!(format_assignment(&a), "os=ubuntu, python-version=3.8, task=docs");
    }
}
