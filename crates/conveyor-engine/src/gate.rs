//! Dependency gating.
//!
//! A job leaves pending only once every job it needs has finished
//! completely. Partial admission is never allowed: one running upstream
//! instance blocks every downstream instance.

use crate::plan::JobPlan;
use conveyor_core::run::SkipReason;

/// Gate verdict for a job at some point in the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Every need is terminal and none force a skip; instances may start.
    Admit,
    /// At least one needed job still has non-terminal instances.
    Block,
    /// The job will never run; all its instances skip with this reason.
    Skip(SkipReason),
}

/// Aggregate progress of one job's instances.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobProgress {
    pub total: usize,
    pub terminal: usize,
    pub failed: usize,
}

impl JobProgress {
    pub fn done(&self) -> bool {
        self.terminal == self.total
    }
}

/// Decide whether `job` may start, given the progress of its needs.
///
/// A failed upstream instance skips the job (`UpstreamFailed`) unless it
/// opted into `run_on_upstream_failure`. Skipped upstream instances are
/// terminal and carry no failure, so they do not hold downstream back.
pub fn admit(job: &JobPlan, progress: impl Fn(&str) -> JobProgress) -> Admission {
    let mut upstream_failed = false;
    for need in &job.needs {
        let p = progress(need);
        if !p.done() {
            return Admission::Block;
        }
        if p.failed > 0 {
            upstream_failed = true;
        }
    }
    if upstream_failed && !job.run_on_upstream_failure {
        return Admission::Skip(SkipReason::UpstreamFailed);
    }
    Admission::Admit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Plan;
    use conveyor_core::definition::PipelineDefinition;
    use conveyor_core::event::{EventContext, Trigger};

    fn plan() -> Plan {
        let def = PipelineDefinition::from_yaml(
            r#"
name: demo
jobs:
  - name: build
    steps: [{name: s, run: make}]
  - name: deploy
    needs: [build]
    steps: [{name: s, run: make deploy}]
  - name: report
    needs: [build]
    run_on_upstream_failure: true
    steps: [{name: s, run: make report}]
"#,
        )
        .unwrap();
        Plan::new(&def, EventContext::new(Trigger::Push)).unwrap()
    }

    #[test]
    fn test_blocks_while_upstream_running() {
        let p = plan();
        let verdict = admit(p.job("deploy").unwrap(), |_| JobProgress {
            total: 3,
            terminal: 2,
            failed: 0,
        });
        assert_eq!(verdict, Admission::Block);
    }

    #[test]
    fn test_admits_once_upstream_terminal() {
        let p = plan();
        let verdict = admit(p.job("deploy").unwrap(), |_| JobProgress {
            total: 3,
            terminal: 3,
            failed: 0,
        });
        assert_eq!(verdict, Admission::Admit);
    }

    #[test]
    fn test_upstream_failure_skips() {
        let p = plan();
        let verdict = admit(p.job("deploy").unwrap(), |_| JobProgress {
            total: 3,
            terminal: 3,
            failed: 1,
        });
        assert_eq!(verdict, Admission::Skip(SkipReason::UpstreamFailed));
    }

    #[test]
    fn test_run_on_upstream_failure_still_admits() {
        let p = plan();
        let verdict = admit(p.job("report").unwrap(), |_| JobProgress {
            total: 3,
            terminal: 3,
            failed: 3,
        });
        assert_eq!(verdict, Admission::Admit);
    }

    #[test]
    fn test_job_without_needs_admits_immediately() {
        let p = plan();
        let verdict = admit(p.job("build").unwrap(), |_| unreachable!());
        assert_eq!(verdict, Admission::Admit);
    }
}
