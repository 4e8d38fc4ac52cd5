//! Step execution for one job instance.
//!
//! Steps run strictly in order. Each step is gated by its `run_when` tag
//! and its predicate, then its command payload goes through the
//! `CommandRunner` port. Cache restore happens before the command;
//! saves and artifact uploads follow success, with saves deferred until
//! the whole instance has succeeded. Backend trouble is a logged
//! warning treated as a miss or a lost upload, unless the step has no
//! payload and the storage operation is its entire purpose.

use crate::plan::{JobPlan, StepPlan};
use chrono::Utc;
use conveyor_core::condition::EvalContext;
use conveyor_core::definition::{
    ArtifactSpec, CacheSpec, DimensionAssignment, RunWhen, dimension_value_str,
};
use conveyor_core::event::EventContext;
use conveyor_core::ports::{
    ArtifactBackend, CacheBackend, CommandRequest, CommandRunner,
};
use conveyor_core::run::{
    InstanceKey, InstanceResult, InstanceStatus, SkipReason, StepOutcome, StepStatus,
};
use conveyor_core::{Error, Result};
use conveyor_store::archive;
use conveyor_store::keys::{KeyContext, hash_files, resolve_key};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, warn};

/// Cooperative cancellation signal shared by a job's sibling instances.
///
/// Once raised it never clears. Instances check it before starting and
/// between steps; `run_when: always` cleanup still runs after it trips.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A cache save registered by a successful cache-bearing step, flushed
/// only once the instance itself succeeds.
struct PendingSave {
    step_index: usize,
    key: String,
    path: String,
    // Set when the cache operation is the step's whole purpose; a
    // flush failure then fails the step rather than just warning.
    required: bool,
}

/// Executes instances against the external ports.
#[derive(Clone)]
pub struct Executor {
    runner: Arc<dyn CommandRunner>,
    cache: Arc<dyn CacheBackend>,
    artifacts: Arc<dyn ArtifactBackend>,
    workspace: PathBuf,
}

impl Executor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        cache: Arc<dyn CacheBackend>,
        artifacts: Arc<dyn ArtifactBackend>,
        workspace: PathBuf,
    ) -> Self {
        Self {
            runner,
            cache,
            artifacts,
            workspace,
        }
    }

    /// Run every step of one instance and report its terminal result.
    pub async fn run_instance(
        &self,
        job: &JobPlan,
        assignment: DimensionAssignment,
        event: &EventContext,
        cancel: &CancelFlag,
    ) -> InstanceResult {
        let key = InstanceKey::new(job.name.clone(), assignment);
        if cancel.is_set() {
            return InstanceResult::skipped(key, SkipReason::FailFast);
        }
        let started_at = Utc::now();
        let mut steps = Vec::with_capacity(job.steps.len());
        let mut pending_saves: Vec<PendingSave> = Vec::new();
        let mut failed = false;
        let mut cancelled = false;

        for step in &job.steps {
            cancelled = cancelled || cancel.is_set();
            let due = if cancelled {
                // Only cleanup runs once a sibling failure cancels us.
                match step.def.run_when {
                    RunWhen::Always => true,
                    RunWhen::OnFailure => failed,
                    RunWhen::Success => false,
                }
            } else {
                match step.def.run_when {
                    RunWhen::Success => !failed,
                    RunWhen::Always => true,
                    RunWhen::OnFailure => failed,
                }
            };
            if !due {
                steps.push(StepOutcome::skipped(&step.def.name));
                continue;
            }

            if let Some(expr) = &step.condition {
                let ctx = EvalContext {
                    job_name: &job.name,
                    matrix: &key.assignment,
                    event,
                };
                match expr.evaluate(&ctx) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(instance = %key, step = %step.def.name, "condition false, skipping");
                        steps.push(StepOutcome::skipped(&step.def.name));
                        continue;
                    }
                    Err(e) => {
                        warn!(instance = %key, step = %step.def.name, error = %e, "condition failed to evaluate");
                        if !step.def.continue_on_failure {
                            failed = true;
                        }
                        steps.push(StepOutcome {
                            name: step.def.name.clone(),
                            status: StepStatus::Failed,
                            exit_code: None,
                            duration_ms: 0,
                            cache_restored_key: None,
                        });
                        continue;
                    }
                }
            }

            let outcome = self
                .run_step(job, step, &key, event, steps.len(), &mut pending_saves)
                .await;
            if outcome.status == StepStatus::Failed && !step.def.continue_on_failure {
                failed = true;
            }
            steps.push(outcome);
        }

        // Saves publish only for a succeeded instance. A step after the
        // cache-bearing one may still fail, and the next run must not
        // restore state left behind by a broken build.
        if !failed && !cancelled {
            for save in pending_saves {
                if let Err(e) = self.save_cache(&save.key, &save.path).await {
                    if save.required {
                        warn!(instance = %key, cache_key = %save.key, error = %e, "cache save failed");
                        steps[save.step_index].status = StepStatus::Failed;
                        if !job.steps[save.step_index].def.continue_on_failure {
                            failed = true;
                        }
                    } else {
                        warn!(instance = %key, cache_key = %save.key, error = %e, "cache save failed, entry lost");
                    }
                }
            }
        }

        let status = if failed {
            InstanceStatus::Failed
        } else if cancelled {
            InstanceStatus::Skipped
        } else {
            InstanceStatus::Succeeded
        };
        InstanceResult {
            key,
            status,
            skip_reason: (status == InstanceStatus::Skipped).then_some(SkipReason::FailFast),
            steps,
            timed_out: false,
            started_at: Some(started_at),
            completed_at: Some(Utc::now()),
        }
    }

    async fn run_step(
        &self,
        job: &JobPlan,
        step: &StepPlan,
        key: &InstanceKey,
        event: &EventContext,
        step_index: usize,
        pending_saves: &mut Vec<PendingSave>,
    ) -> StepOutcome {
        let start = Instant::now();
        let side_effect_only = step.def.side_effect_only();
        let mut status = StepStatus::Succeeded;
        let mut exit_code = None;
        let mut cache_restored_key = None;
        // Set when a save should follow a successful instance.
        let mut deferred_save: Option<(String, String)> = None;

        if let Some(spec) = &step.def.cache {
            match self.restore_cache(job, spec, &key.assignment).await {
                Ok((restored, primary, exact)) => {
                    cache_restored_key = restored;
                    if !exact {
                        deferred_save = Some((primary, spec.path.clone()));
                    }
                }
                Err(e) => {
                    if side_effect_only {
                        warn!(instance = %key, step = %step.def.name, error = %e, "cache step failed");
                        status = StepStatus::Failed;
                    } else {
                        warn!(instance = %key, step = %step.def.name, error = %e, "cache restore failed, treating as miss");
                    }
                }
            }
        }

        if status == StepStatus::Succeeded {
            if let Some(payload) = &step.def.run {
                let request = CommandRequest {
                    job: job.name.clone(),
                    step: step.def.name.clone(),
                    payload: payload.clone(),
                    assignment: key.assignment.clone(),
                    env: build_env(job, key, event),
                };
                match self.runner.run(&request).await {
                    Ok(outcome) => {
                        exit_code = Some(outcome.exit_code);
                        if !outcome.success() {
                            status = StepStatus::Failed;
                        }
                    }
                    Err(e) => {
                        warn!(instance = %key, step = %step.def.name, error = %e, "runner error");
                        status = StepStatus::Failed;
                    }
                }
            }
        }

        if status == StepStatus::Succeeded {
            if let Some(spec) = &step.def.artifact {
                if let Err(e) = self.upload_artifact(job, spec, &key.assignment).await {
                    if side_effect_only {
                        warn!(instance = %key, step = %step.def.name, error = %e, "artifact step failed");
                        status = StepStatus::Failed;
                    } else {
                        warn!(instance = %key, step = %step.def.name, error = %e, "artifact upload failed, bundle lost");
                    }
                }
            }
        }

        if status == StepStatus::Succeeded {
            if let Some((save_key, path)) = deferred_save {
                pending_saves.push(PendingSave {
                    step_index,
                    key: save_key,
                    path,
                    required: side_effect_only,
                });
            }
        }

        StepOutcome {
            name: step.def.name.clone(),
            status,
            exit_code,
            duration_ms: start.elapsed().as_millis() as u64,
            cache_restored_key,
        }
    }

    /// Restore a cache into the workspace. Returns the matched key (if
    /// any), the resolved primary key, and whether the hit was exact.
    async fn restore_cache(
        &self,
        job: &JobPlan,
        spec: &CacheSpec,
        assignment: &DimensionAssignment,
    ) -> Result<(Option<String>, String, bool)> {
        let content_hash = if spec.hash_files.is_empty() {
            None
        } else {
            Some(hash_files(&self.workspace, &spec.hash_files))
        };
        let ctx = KeyContext {
            job: &job.name,
            assignment,
            content_hash: content_hash.as_deref(),
        };
        let primary = resolve_key(&spec.key, &ctx)?;
        let prefixes: Vec<String> = spec
            .restore_keys
            .iter()
            .map(|t| resolve_key(t, &ctx))
            .collect::<Result<_>>()?;

        match conveyor_store::restore(self.cache.as_ref(), &primary, &prefixes).await? {
            Some(hit) => {
                let dest = self.workspace.clone();
                let blob = hit.blob;
                tokio::task::spawn_blocking(move || archive::unpack(&blob, &dest))
                    .await
                    .map_err(|e| Error::Internal(format!("unpack task failed: {}", e)))??;
                debug!(key = %hit.key, exact = hit.exact, "cache restored");
                Ok((Some(hit.key), primary, hit.exact))
            }
            None => Ok((None, primary, false)),
        }
    }

    async fn save_cache(&self, key: &str, path: &str) -> Result<()> {
        let base = self.workspace.clone();
        let path = path.to_string();
        let blob = tokio::task::spawn_blocking(move || archive::pack(&base, &path))
            .await
            .map_err(|e| Error::Internal(format!("pack task failed: {}", e)))??;
        self.cache.put(key, blob).await?;
        debug!(key, "cache saved");
        Ok(())
    }

    async fn upload_artifact(
        &self,
        job: &JobPlan,
        spec: &ArtifactSpec,
        assignment: &DimensionAssignment,
    ) -> Result<()> {
        let ctx = KeyContext {
            job: &job.name,
            assignment,
            content_hash: None,
        };
        let name = resolve_key(&spec.name, &ctx)?;
        let files =
            conveyor_store::artifact::collect_files(&self.workspace, &spec.paths, &spec.exclude)?;
        let count = files.len();
        self.artifacts.put(&name, files).await?;
        debug!(name, files = count, "artifact uploaded");
        Ok(())
    }
}

/// Environment handed to the runner: instance identity plus event facts.
fn build_env(job: &JobPlan, key: &InstanceKey, event: &EventContext) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("CONVEYOR_JOB".to_string(), job.name.clone());
    env.insert(
        "CONVEYOR_TRIGGER".to_string(),
        event.trigger.as_str().to_string(),
    );
    if let Some(git_ref) = &event.git_ref {
        env.insert("CONVEYOR_REF".to_string(), git_ref.clone());
    }
    for (dim, value) in &key.assignment {
        let var = format!(
            "MATRIX_{}",
            dim.to_ascii_uppercase().replace(['-', '.'], "_")
        );
        env.insert(var, dimension_value_str(value));
    }
    env
}
