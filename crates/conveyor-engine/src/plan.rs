//! Load-time validation and the immutable run plan.
//!
//! `Plan::new` turns a parsed pipeline document into everything the
//! scheduler needs: expanded matrix assignments, parsed condition trees,
//! and a validated needs graph. Every definition-level error surfaces
//! here, before any instance exists.

use crate::matrix;
use conveyor_core::condition::Expr;
use conveyor_core::definition::{
    DimensionAssignment, JobDefinition, PipelineDefinition, StepDefinition,
};
use conveyor_core::event::EventContext;
use conveyor_core::run::InstanceKey;
use conveyor_core::{Error, Result};
use conveyor_store::keys::{KeyContext, resolve_key};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use std::collections::HashMap;
use tracing::debug;

/// One job with its expanded assignments and parsed predicates.
#[derive(Debug)]
pub struct JobPlan {
    pub name: String,
    pub needs: Vec<String>,
    pub condition: Option<Expr>,
    pub fail_fast: bool,
    pub timeout_minutes: u32,
    pub run_on_upstream_failure: bool,
    pub assignments: Vec<DimensionAssignment>,
    pub steps: Vec<StepPlan>,
}

#[derive(Debug)]
pub struct StepPlan {
    pub def: StepDefinition,
    pub condition: Option<Expr>,
}

/// The validated, immutable plan for one run.
#[derive(Debug)]
pub struct Plan {
    pub pipeline_name: String,
    pub event: EventContext,
    pub jobs: Vec<JobPlan>,
    index: HashMap<String, usize>,
}

impl Plan {
    pub fn new(definition: &PipelineDefinition, event: EventContext) -> Result<Self> {
        let mut index = HashMap::new();
        for (i, job) in definition.jobs.iter().enumerate() {
            if index.insert(job.name.clone(), i).is_some() {
                return Err(Error::DuplicateJob(job.name.clone()));
            }
        }

        validate_needs(&definition.jobs, &index)?;

        let mut jobs = Vec::with_capacity(definition.jobs.len());
        for job in &definition.jobs {
            jobs.push(plan_job(job)?);
        }

        debug!(
            pipeline = %definition.name,
            jobs = jobs.len(),
            instances = jobs.iter().map(|j| j.assignments.len()).sum::<usize>(),
            "plan built"
        );

        Ok(Self {
            pipeline_name: definition.name.clone(),
            event,
            jobs,
            index,
        })
    }

    pub fn job(&self, name: &str) -> Option<&JobPlan> {
        self.index.get(name).map(|&i| &self.jobs[i])
    }

    /// Every concrete instance of the plan, in job declaration order.
    pub fn instance_keys(&self) -> Vec<InstanceKey> {
        self.jobs
            .iter()
            .flat_map(|job| {
                job.assignments
                    .iter()
                    .map(|a| InstanceKey::new(job.name.clone(), a.clone()))
            })
            .collect()
    }
}

fn plan_job(job: &JobDefinition) -> Result<JobPlan> {
    let condition = parse_condition(job.condition.as_deref())?;

    let (assignments, fail_fast) = match &job.strategy {
        Some(strategy) => {
            let assignments = match &strategy.matrix {
                Some(matrix) => matrix::expand(&job.name, matrix)?,
                None => vec![DimensionAssignment::new()],
            };
            (assignments, strategy.fail_fast)
        }
        None => (vec![DimensionAssignment::new()], true),
    };

    let mut steps = Vec::with_capacity(job.steps.len());
    for step in &job.steps {
        if step.run.is_none() && step.cache.is_none() && step.artifact.is_none() {
            return Err(Error::Definition(format!(
                "step `{}` in job `{}` has no run command, cache or artifact",
                step.name, job.name
            )));
        }
        validate_templates(&job.name, step, &assignments)?;
        steps.push(StepPlan {
            condition: parse_condition(step.condition.as_deref())?,
            def: step.clone(),
        });
    }

    Ok(JobPlan {
        name: job.name.clone(),
        needs: job.needs.clone(),
        condition,
        fail_fast,
        timeout_minutes: job.timeout_minutes,
        run_on_upstream_failure: job.run_on_upstream_failure,
        assignments,
        steps,
    })
}

fn parse_condition(source: Option<&str>) -> Result<Option<Expr>> {
    source.map(Expr::parse).transpose()
}

/// Resolve every cache/artifact template against every assignment with a
/// placeholder hash, so a template typo fails the load rather than a
/// step mid-run.
fn validate_templates(
    job: &str,
    step: &StepDefinition,
    assignments: &[DimensionAssignment],
) -> Result<()> {
    if let Some(spec) = &step.cache {
        for assignment in assignments {
            let ctx = KeyContext {
                job,
                assignment,
                content_hash: (!spec.hash_files.is_empty()).then_some("0"),
            };
            resolve_key(&spec.key, &ctx)?;
            for template in &spec.restore_keys {
                resolve_key(template, &ctx)?;
            }
        }
    }
    if let Some(spec) = &step.artifact {
        for assignment in assignments {
            let ctx = KeyContext {
                job,
                assignment,
                content_hash: None,
            };
            resolve_key(&spec.name, &ctx)?;
        }
    }
    Ok(())
}

fn validate_needs(jobs: &[JobDefinition], index: &HashMap<String, usize>) -> Result<()> {
    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: Vec<_> = jobs.iter().map(|j| graph.add_node(j.name.as_str())).collect();

    for (i, job) in jobs.iter().enumerate() {
        for need in &job.needs {
            let Some(&target) = index.get(need) else {
                return Err(Error::UnknownNeed {
                    job: job.name.clone(),
                    missing: need.clone(),
                });
            };
            graph.add_edge(nodes[target], nodes[i], ());
        }
    }

    toposort(&graph, None).map_err(|_| Error::CyclicNeeds)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::event::Trigger;

    fn plan(yaml: &str) -> Result<Plan> {
        let def = PipelineDefinition::from_yaml(yaml).unwrap();
        Plan::new(&def, EventContext::new(Trigger::Push))
    }

    #[test]
    fn test_plan_expands_instances() {
        let p = plan(
            r#"
name: demo
jobs:
  - name: tests
    strategy:
      matrix:
        dimensions:
          os: [ubuntu, macos]
    steps:
      - name: run
        run: make test
  - name: docs
    needs: [tests]
    steps:
      - name: build
        run: make docs
"#,
        )
        .unwrap();
        assert_eq!(p.job("tests").unwrap().assignments.len(), 2);
        assert_eq!(p.job("docs").unwrap().assignments.len(), 1);
        assert_eq!(p.instance_keys().len(), 3);
    }

    #[test]
    fn test_duplicate_job_rejected() {
        let err = plan(
            r#"
name: demo
jobs:
  - name: build
    steps: [{name: a, run: "true"}]
  - name: build
    steps: [{name: b, run: "true"}]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::DuplicateJob(name) if name == "build"));
    }

    #[test]
    fn test_unknown_need_rejected() {
        let err = plan(
            r#"
name: demo
jobs:
  - name: deploy
    needs: [build]
    steps: [{name: a, run: "true"}]
"#,
        )
        .unwrap_err();
        assert!(
            matches!(err, Error::UnknownNeed { job, missing } if job == "deploy" && missing == "build")
        );
    }

    #[test]
    fn test_needs_cycle_rejected() {
        let err = plan(
            r#"
name: demo
jobs:
  - name: a
    needs: [b]
    steps: [{name: s, run: "true"}]
  - name: b
    needs: [a]
    steps: [{name: s, run: "true"}]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::CyclicNeeds));
    }

    #[test]
    fn test_bad_predicate_fails_at_load() {
        let err = plan(
            r#"
name: demo
jobs:
  - name: build
    steps:
      - name: a
        run: "true"
        if: "matrix.os =="
"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::ConditionSyntax { .. }));
    }

    #[test]
    fn test_bad_key_template_fails_at_load() {
        let err = plan(
            r#"
name: demo
jobs:
  - name: build
    strategy:
      matrix:
        dimensions:
          os: [ubuntu]
    steps:
      - name: deps
        run: install
        cache:
          path: .deps
          key: deps-${{ matrix.oss }}
"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnresolvedPlaceholder(_)));
    }

    #[test]
    fn test_hash_placeholder_requires_hash_files() {
        let err = plan(
            r#"
name: demo
jobs:
  - name: build
    steps:
      - name: deps
        run: install
        cache:
          path: .deps
          key: deps-${{ hash }}
"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnresolvedPlaceholder(_)));
    }

    #[test]
    fn test_step_without_payload_or_side_effect_rejected() {
        let err = plan(
            r#"
name: demo
jobs:
  - name: build
    steps:
      - name: empty
"#,
        )
        .unwrap_err();
        assert!(err.is_definition());
    }
}
