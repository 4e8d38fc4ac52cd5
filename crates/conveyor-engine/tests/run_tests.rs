//! End-to-end runs through the scheduler against in-memory ports.

use conveyor_core::definition::PipelineDefinition;
use conveyor_core::event::{EventContext, Trigger};
use conveyor_core::ports::ArtifactBackend;
use conveyor_core::run::{InstanceStatus, JobReport, RunReport, SkipReason};
use conveyor_engine::testing::FakeRunner;
use conveyor_engine::{Executor, Plan, Scheduler};
use conveyor_store::{MemoryArtifactBackend, MemoryCacheBackend};
use std::sync::Arc;

struct Harness {
    runner: FakeRunner,
    cache: Arc<MemoryCacheBackend>,
    artifacts: Arc<MemoryArtifactBackend>,
    workspace: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        Self {
            runner: FakeRunner::default(),
            cache: Arc::new(MemoryCacheBackend::default()),
            artifacts: Arc::new(MemoryArtifactBackend::default()),
            workspace: tempfile::tempdir().unwrap(),
        }
    }

    async fn run(&self, yaml: &str, event: EventContext, limit: usize) -> RunReport {
        let def = PipelineDefinition::from_yaml(yaml).unwrap();
        let plan = Arc::new(Plan::new(&def, event).unwrap());
        let executor = Executor::new(
            Arc::new(self.runner.clone()),
            self.cache.clone(),
            self.artifacts.clone(),
            self.workspace.path().to_path_buf(),
        );
        Scheduler::new(executor, limit).run(plan).await
    }
}

fn job<'a>(report: &'a RunReport, name: &str) -> &'a JobReport {
    report.jobs.iter().find(|j| j.job == name).unwrap()
}

#[tokio::test]
async fn test_matrix_pipeline_succeeds() {
    let h = Harness::new();
    let report = h
        .run(
            r#"
name: demo
jobs:
  - name: tests
    strategy:
      matrix:
        dimensions:
          os: [ubuntu, macos]
          task: [unit, docs]
    steps:
      - {name: run, run: "make test"}
  - name: publish
    needs: [tests]
    steps:
      - {name: run, run: "make publish"}
"#,
            EventContext::new(Trigger::Push),
            4,
        )
        .await;

    assert!(report.success());
    assert_eq!(job(&report, "tests").instances.len(), 4);
    assert_eq!(job(&report, "publish").instances.len(), 1);
    assert!(
        report
            .instances()
            .all(|i| i.status == InstanceStatus::Succeeded)
    );
}

#[tokio::test]
async fn test_needs_waits_for_every_upstream_instance() {
    let h = Harness::new();
    h.runner.delay_payload("upstream work", 30);
    let report = h
        .run(
            r#"
name: demo
jobs:
  - name: build
    strategy:
      matrix:
        dimensions:
          os: [ubuntu, macos, windows]
    steps:
      - {name: run, run: "upstream work"}
  - name: release
    needs: [build]
    steps:
      - {name: run, run: "downstream work"}
"#,
            EventContext::new(Trigger::Push),
            8,
        )
        .await;

    assert!(report.success());
    let calls = h.runner.calls();
    let upstream_done = calls
        .iter()
        .filter(|c| c.job == "build")
        .map(|c| c.finished)
        .max()
        .unwrap();
    let downstream_started = calls
        .iter()
        .filter(|c| c.job == "release")
        .map(|c| c.started)
        .min()
        .unwrap();
    assert!(downstream_started >= upstream_done);
}

#[tokio::test]
async fn test_upstream_failure_skips_dependents() {
    let h = Harness::new();
    h.runner.fail_payload("boom", 1);
    let report = h
        .run(
            r#"
name: demo
jobs:
  - name: build
    steps:
      - {name: run, run: "boom"}
  - name: deploy
    needs: [build]
    steps:
      - {name: run, run: "deploy"}
  - name: report
    needs: [build]
    run_on_upstream_failure: true
    steps:
      - {name: run, run: "collect results"}
"#,
            EventContext::new(Trigger::Push),
            4,
        )
        .await;

    assert!(!report.success());
    let deploy = &job(&report, "deploy").instances[0];
    assert_eq!(deploy.status, InstanceStatus::Skipped);
    assert_eq!(deploy.skip_reason, Some(SkipReason::UpstreamFailed));

    let collect = &job(&report, "report").instances[0];
    assert_eq!(collect.status, InstanceStatus::Succeeded);
    assert!(h.runner.payloads().contains(&"collect results".to_string()));
}

#[tokio::test]
async fn test_job_condition_skip_does_not_block_downstream() {
    let h = Harness::new();
    let report = h
        .run(
            r#"
name: demo
jobs:
  - name: deploy
    if: "event.trigger == 'release'"
    steps:
      - {name: run, run: "deploy"}
  - name: notify
    needs: [deploy]
    steps:
      - {name: run, run: "notify"}
"#,
            EventContext::new(Trigger::Push),
            4,
        )
        .await;

    // A condition skip is terminal without failure; the run still counts
    // as green and dependents of the skipped job proceed.
    assert!(report.success());
    let deploy = &job(&report, "deploy").instances[0];
    assert_eq!(deploy.status, InstanceStatus::Skipped);
    assert_eq!(deploy.skip_reason, Some(SkipReason::ConditionFalse));
    assert_eq!(
        job(&report, "notify").instances[0].status,
        InstanceStatus::Succeeded
    );
    assert_eq!(h.runner.payloads(), vec!["notify"]);
}

#[tokio::test]
async fn test_fail_fast_cancels_sibling_instances() {
    let h = Harness::new();
    h.runner.fail_payload("make test", 2);
    // Single-slot concurrency: the first instance fails before any
    // sibling gets a permit.
    let report = h
        .run(
            r#"
name: demo
jobs:
  - name: tests
    strategy:
      matrix:
        dimensions:
          os: [ubuntu, macos, windows]
    steps:
      - {name: run, run: "make test"}
"#,
            EventContext::new(Trigger::Push),
            1,
        )
        .await;

    assert!(!report.success());
    let instances = &job(&report, "tests").instances;
    let failed = instances
        .iter()
        .filter(|i| i.status == InstanceStatus::Failed)
        .count();
    let cancelled = instances
        .iter()
        .filter(|i| i.skip_reason == Some(SkipReason::FailFast))
        .count();
    assert_eq!(failed, 1);
    assert_eq!(cancelled, 2);
    assert_eq!(h.runner.payloads().len(), 1);
}

#[tokio::test]
async fn test_fail_fast_off_lets_siblings_finish() {
    let h = Harness::new();
    h.runner.fail_payload("make test", 2);
    let report = h
        .run(
            r#"
name: demo
jobs:
  - name: tests
    strategy:
      fail_fast: false
      matrix:
        dimensions:
          os: [ubuntu, macos, windows]
    steps:
      - {name: run, run: "make test"}
"#,
            EventContext::new(Trigger::Push),
            1,
        )
        .await;

    assert!(!report.success());
    assert_eq!(h.runner.payloads().len(), 3);
    assert!(
        job(&report, "tests")
            .instances
            .iter()
            .all(|i| i.status == InstanceStatus::Failed)
    );
}

#[tokio::test(start_paused = true)]
async fn test_instance_timeout_fails_the_instance() {
    let h = Harness::new();
    h.runner.delay_payload("hang forever", 10 * 60 * 1000);
    let report = h
        .run(
            r#"
name: demo
jobs:
  - name: tests
    timeout_minutes: 1
    steps:
      - {name: run, run: "hang forever"}
"#,
            EventContext::new(Trigger::Push),
            4,
        )
        .await;

    assert!(!report.success());
    let instance = &job(&report, "tests").instances[0];
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(instance.timed_out);
}

#[tokio::test]
async fn test_concurrency_limit_is_respected() {
    let h = Harness::new();
    h.runner.delay_payload("make test", 20);
    let report = h
        .run(
            r#"
name: demo
jobs:
  - name: tests
    strategy:
      matrix:
        dimensions:
          os: [ubuntu, macos]
          task: [unit, docs]
    steps:
      - {name: run, run: "make test"}
"#,
            EventContext::new(Trigger::Push),
            2,
        )
        .await;

    assert!(report.success());
    assert_eq!(h.runner.payloads().len(), 4);
    assert!(h.runner.peak_concurrency() <= 2);
}

#[tokio::test]
async fn test_cache_saved_upstream_restores_downstream() {
    let h = Harness::new();
    std::fs::create_dir_all(h.workspace.path().join(".deps")).unwrap();
    std::fs::write(h.workspace.path().join(".deps/marker"), b"x").unwrap();
    let report = h
        .run(
            r#"
name: demo
jobs:
  - name: build
    steps:
      - name: deps
        run: "install"
        cache: {path: .deps, key: deps-v1}
  - name: test
    needs: [build]
    steps:
      - name: deps
        run: "verify"
        cache: {path: .deps, key: deps-v1}
"#,
            EventContext::new(Trigger::Push),
            4,
        )
        .await;

    assert!(report.success());
    let build = &job(&report, "build").instances[0];
    assert!(build.steps[0].cache_restored_key.is_none());
    let test = &job(&report, "test").instances[0];
    assert_eq!(test.steps[0].cache_restored_key.as_deref(), Some("deps-v1"));
}

#[tokio::test]
async fn test_artifacts_collected_per_matrix_instance() {
    let h = Harness::new();
    std::fs::create_dir_all(h.workspace.path().join("dist")).unwrap();
    std::fs::write(h.workspace.path().join("dist/pkg.whl"), b"wheel").unwrap();
    let report = h
        .run(
            r#"
name: demo
jobs:
  - name: wheels
    strategy:
      matrix:
        dimensions:
          os: [ubuntu, macos]
    steps:
      - name: package
        run: "build wheel"
        artifact:
          name: wheels-${{ matrix.os }}
          paths: ["dist/*"]
"#,
            EventContext::new(Trigger::Push),
            4,
        )
        .await;

    assert!(report.success());
    assert_eq!(
        h.artifacts.list().await.unwrap(),
        vec!["wheels-macos", "wheels-ubuntu"]
    );
}
