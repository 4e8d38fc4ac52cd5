//! Command handlers.

use anyhow::Context;
use console::style;
use conveyor_core::definition::PipelineDefinition;
use conveyor_core::event::{EventContext, Trigger};
use conveyor_core::run::{InstanceStatus, RunReport, SkipReason, StepStatus};
use conveyor_engine::{Executor, Plan, Scheduler};
use conveyor_store::{LocalArtifactBackend, LocalCacheBackend};
use std::path::PathBuf;
use std::sync::Arc;

use crate::commands::Commands;
use crate::runner::ShellRunner;

fn load(path: &str, event: EventContext) -> anyhow::Result<(PipelineDefinition, Plan)> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path))?;
    let definition = PipelineDefinition::from_yaml(&content)
        .with_context(|| format!("failed to parse {}", path))?;
    let plan = Plan::new(&definition, event).context("pipeline failed validation")?;
    Ok((definition, plan))
}

/// Validate a pipeline definition.
pub fn validate(path: &str) -> anyhow::Result<()> {
    let (definition, plan) = load(path, EventContext::new(Trigger::Push))?;

    println!(
        "{} Pipeline \"{}\" is valid",
        style("✓").green(),
        definition.name
    );
    println!("  Jobs: {}", plan.jobs.len());
    for job in &plan.jobs {
        println!(
            "    - {} ({} instances, {} steps)",
            job.name,
            job.assignments.len(),
            job.steps.len()
        );
    }
    Ok(())
}

/// Print the concrete instances a pipeline expands to.
pub fn expand(path: &str) -> anyhow::Result<()> {
    let (definition, plan) = load(path, EventContext::new(Trigger::Push))?;

    println!(
        "{} instances for pipeline \"{}\":",
        plan.instance_keys().len(),
        definition.name
    );
    for key in plan.instance_keys() {
        println!("  {}", key);
    }
    Ok(())
}

/// Run a pipeline locally. Returns whether the run succeeded.
pub async fn run(command: Commands) -> anyhow::Result<bool> {
    let Commands::Run {
        path,
        trigger,
        git_ref,
        actor,
        manual,
        workspace,
        concurrency,
        cache_dir,
        artifact_dir,
    } = command
    else {
        unreachable!("dispatched from main with a run command");
    };

    let trigger: Trigger = trigger
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))
        .context("invalid --trigger")?;
    let mut event = EventContext::new(trigger);
    if let Some(git_ref) = git_ref {
        event = event.with_ref(git_ref);
    }
    if let Some(actor) = actor {
        event = event.with_actor(actor);
    }
    if manual {
        event = event.manual();
    }

    let (_, plan) = load(&path, event)?;
    let workspace = PathBuf::from(workspace)
        .canonicalize()
        .context("workspace directory not found")?;

    let executor = Executor::new(
        Arc::new(ShellRunner::new(workspace.clone())),
        Arc::new(LocalCacheBackend::new(PathBuf::from(cache_dir))),
        Arc::new(LocalArtifactBackend::new(PathBuf::from(artifact_dir))),
        workspace,
    );
    let report = Scheduler::new(executor, concurrency)
        .run(Arc::new(plan))
        .await;

    render_report(&report);
    Ok(report.success())
}

fn render_report(report: &RunReport) {
    println!();
    for job in &report.jobs {
        println!("{}", style(&job.job).bold());
        for instance in &job.instances {
            let label = instance.key.to_string();
            match instance.status {
                InstanceStatus::Succeeded => {
                    println!("  {} {}", style("✓").green(), label);
                }
                InstanceStatus::Failed if instance.timed_out => {
                    println!("  {} {} (timed out)", style("✗").red(), label);
                }
                InstanceStatus::Failed => {
                    println!("  {} {}", style("✗").red(), label);
                }
                InstanceStatus::Skipped => {
                    println!(
                        "  {} {} ({})",
                        style("⏭").yellow(),
                        label,
                        skip_reason(instance.skip_reason)
                    );
                }
                InstanceStatus::Pending | InstanceStatus::Running => {}
            }
            for step in &instance.steps {
                match step.status {
                    StepStatus::Succeeded => {
                        let mut line = format!(
                            "      {} {} ({}ms)",
                            style("✓").green().dim(),
                            step.name,
                            step.duration_ms
                        );
                        if let Some(key) = &step.cache_restored_key {
                            line.push_str(&format!(" [cache: {}]", key));
                        }
                        println!("{}", line);
                    }
                    StepStatus::Failed => {
                        let exit = step
                            .exit_code
                            .map(|c| format!("exit {}", c))
                            .unwrap_or_else(|| "error".to_string());
                        println!("      {} {} ({})", style("✗").red(), step.name, exit);
                    }
                    StepStatus::Skipped => {
                        println!("      {} {}", style("⏭").dim(), step.name);
                    }
                }
            }
        }
    }

    println!();
    if report.success() {
        println!(
            "{} Run {} succeeded in {}ms",
            style("✓").green().bold(),
            report.run_id,
            report.duration_ms
        );
    } else {
        println!(
            "{} Run {} failed after {}ms",
            style("✗").red().bold(),
            report.run_id,
            report.duration_ms
        );
    }
}

fn skip_reason(reason: Option<SkipReason>) -> &'static str {
    match reason {
        Some(SkipReason::ConditionFalse) => "condition false",
        Some(SkipReason::UpstreamFailed) => "upstream failed",
        Some(SkipReason::FailFast) => "fail fast",
        None => "skipped",
    }
}
