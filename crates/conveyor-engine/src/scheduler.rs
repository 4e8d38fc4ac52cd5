//! The async run scheduler.
//!
//! Ready instances run concurrently under a semaphore limit; a job's
//! instances are spawned only once its dependency gate admits. Fail-fast
//! cancellation is cooperative: a sibling failure raises the job's
//! cancel flag, pending instances skip on their way in, and running
//! instances stop between steps (cleanup steps still run).

use crate::executor::{CancelFlag, Executor};
use crate::gate::{self, Admission, JobProgress};
use crate::plan::Plan;
use chrono::Utc;
use conveyor_core::condition::EvalContext;
use conveyor_core::definition::DimensionAssignment;
use conveyor_core::ids::RunId;
use conveyor_core::run::{
    InstanceKey, InstanceResult, InstanceStatus, JobReport, RunReport, SkipReason,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub struct Scheduler {
    executor: Executor,
    max_concurrency: usize,
}

impl Scheduler {
    pub fn new(executor: Executor, max_concurrency: usize) -> Self {
        Self {
            executor,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Drive the plan to completion and report every instance.
    pub async fn run(&self, plan: Arc<Plan>) -> RunReport {
        let run_id = RunId::new();
        let started = Instant::now();
        info!(%run_id, pipeline = %plan.pipeline_name, "run started");

        let mut results: Vec<Vec<Option<InstanceResult>>> = plan
            .jobs
            .iter()
            .map(|j| vec![None; j.assignments.len()])
            .collect();
        let mut spawned = vec![false; plan.jobs.len()];
        let cancel_flags: Vec<CancelFlag> =
            plan.jobs.iter().map(|_| CancelFlag::default()).collect();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut join_set: JoinSet<(usize, usize, InstanceResult)> = JoinSet::new();
        let mut task_index: HashMap<tokio::task::Id, (usize, usize)> = HashMap::new();

        self.apply_job_conditions(&plan, &mut results, &mut spawned);

        loop {
            self.launch_ready(
                &plan,
                &mut results,
                &mut spawned,
                &cancel_flags,
                &semaphore,
                &mut join_set,
                &mut task_index,
            );

            if results.iter().all(|job| job.iter().all(Option::is_some)) {
                break;
            }

            match join_set.join_next_with_id().await {
                Some(Ok((id, (ji, ii, result)))) => {
                    task_index.remove(&id);
                    results[ji][ii] = Some(result);
                }
                Some(Err(join_error)) => {
                    if let Some(&(ji, ii)) = task_index.get(&join_error.id()) {
                        task_index.remove(&join_error.id());
                        warn!(job = %plan.jobs[ji].name, error = %join_error, "instance task aborted");
                        if plan.jobs[ji].fail_fast {
                            cancel_flags[ji].set();
                        }
                        results[ji][ii] = Some(InstanceResult {
                            key: InstanceKey::new(
                                plan.jobs[ji].name.clone(),
                                plan.jobs[ji].assignments[ii].clone(),
                            ),
                            status: InstanceStatus::Failed,
                            skip_reason: None,
                            steps: Vec::new(),
                            timed_out: false,
                            started_at: None,
                            completed_at: Some(Utc::now()),
                        });
                    }
                }
                // No tasks in flight; a skip cascade is still resolving.
                None => continue,
            }
        }

        let jobs = plan
            .jobs
            .iter()
            .zip(results)
            .map(|(job, instances)| JobReport {
                job: job.name.clone(),
                instances: instances.into_iter().flatten().collect(),
            })
            .collect();

        let report = RunReport {
            run_id,
            pipeline: plan.pipeline_name.clone(),
            jobs,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(%run_id, success = report.success(), duration_ms = report.duration_ms, "run finished");
        report
    }

    /// Evaluate each job-level condition once, with an empty matrix
    /// context. False skips every instance; an evaluation error fails
    /// them, since the job cannot be admitted or safely run.
    fn apply_job_conditions(
        &self,
        plan: &Plan,
        results: &mut [Vec<Option<InstanceResult>>],
        spawned: &mut [bool],
    ) {
        let empty = DimensionAssignment::new();
        for (ji, job) in plan.jobs.iter().enumerate() {
            let Some(expr) = &job.condition else { continue };
            let ctx = EvalContext {
                job_name: &job.name,
                matrix: &empty,
                event: &plan.event,
            };
            match expr.evaluate(&ctx) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(job = %job.name, "job condition false, skipping");
                    for (ii, assignment) in job.assignments.iter().enumerate() {
                        results[ji][ii] = Some(InstanceResult::skipped(
                            InstanceKey::new(job.name.clone(), assignment.clone()),
                            SkipReason::ConditionFalse,
                        ));
                    }
                    spawned[ji] = true;
                }
                Err(e) => {
                    warn!(job = %job.name, error = %e, "job condition failed to evaluate");
                    for (ii, assignment) in job.assignments.iter().enumerate() {
                        results[ji][ii] = Some(InstanceResult {
                            key: InstanceKey::new(job.name.clone(), assignment.clone()),
                            status: InstanceStatus::Failed,
                            skip_reason: None,
                            steps: Vec::new(),
                            timed_out: false,
                            started_at: None,
                            completed_at: Some(Utc::now()),
                        });
                    }
                    spawned[ji] = true;
                }
            }
        }
    }

    /// Repeatedly consult the gate until no more jobs can be admitted or
    /// skipped. Skips cascade within a single pass, so a chain of
    /// dependent jobs behind a failure settles without waiting on tasks.
    #[allow(clippy::too_many_arguments)]
    fn launch_ready(
        &self,
        plan: &Arc<Plan>,
        results: &mut [Vec<Option<InstanceResult>>],
        spawned: &mut [bool],
        cancel_flags: &[CancelFlag],
        semaphore: &Arc<Semaphore>,
        join_set: &mut JoinSet<(usize, usize, InstanceResult)>,
        task_index: &mut HashMap<tokio::task::Id, (usize, usize)>,
    ) {
        loop {
            let mut progressed = false;
            let progress_by_name: HashMap<&str, JobProgress> = plan
                .jobs
                .iter()
                .enumerate()
                .map(|(ji, job)| {
                    let terminal = results[ji].iter().filter(|r| r.is_some()).count();
                    let failed = results[ji]
                        .iter()
                        .flatten()
                        .filter(|r| r.status == InstanceStatus::Failed)
                        .count();
                    (
                        job.name.as_str(),
                        JobProgress {
                            total: job.assignments.len(),
                            terminal,
                            failed,
                        },
                    )
                })
                .collect();

            for (ji, job) in plan.jobs.iter().enumerate() {
                if spawned[ji] {
                    continue;
                }
                match gate::admit(job, |name| {
                    progress_by_name.get(name).copied().unwrap_or_default()
                }) {
                    Admission::Block => {}
                    Admission::Skip(reason) => {
                        debug!(job = %job.name, ?reason, "job skipped by gate");
                        for (ii, assignment) in job.assignments.iter().enumerate() {
                            results[ji][ii] = Some(InstanceResult::skipped(
                                InstanceKey::new(job.name.clone(), assignment.clone()),
                                reason,
                            ));
                        }
                        spawned[ji] = true;
                        progressed = true;
                    }
                    Admission::Admit => {
                        debug!(job = %job.name, instances = job.assignments.len(), "job admitted");
                        for ii in 0..job.assignments.len() {
                            let handle = join_set.spawn(instance_task(
                                self.executor.clone(),
                                plan.clone(),
                                ji,
                                ii,
                                cancel_flags[ji].clone(),
                                semaphore.clone(),
                            ));
                            task_index.insert(handle.id(), (ji, ii));
                        }
                        spawned[ji] = true;
                        progressed = true;
                    }
                }
            }

            if !progressed {
                break;
            }
        }
    }
}

async fn instance_task(
    executor: Executor,
    plan: Arc<Plan>,
    ji: usize,
    ii: usize,
    cancel: CancelFlag,
    semaphore: Arc<Semaphore>,
) -> (usize, usize, InstanceResult) {
    let job = &plan.jobs[ji];
    let assignment = job.assignments[ii].clone();
    let key = InstanceKey::new(job.name.clone(), assignment.clone());

    let _permit = semaphore
        .acquire_owned()
        .await
        .expect("run semaphore closed");

    if cancel.is_set() {
        return (ji, ii, InstanceResult::skipped(key, SkipReason::FailFast));
    }

    let budget = Duration::from_secs(u64::from(job.timeout_minutes) * 60);
    let result = match tokio::time::timeout(
        budget,
        executor.run_instance(job, assignment, &plan.event, &cancel),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => {
            warn!(instance = %key, minutes = job.timeout_minutes, "instance timed out");
            InstanceResult::timed_out(key)
        }
    };

    // Raise fail-fast while the permit is still held, so a sibling
    // waiting on it observes the flag before it can start.
    if result.status == InstanceStatus::Failed && job.fail_fast {
        debug!(job = %job.name, "instance failed, raising fail-fast");
        cancel.set();
    }
    (ji, ii, result)
}
