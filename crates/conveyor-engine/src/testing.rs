//! Test doubles for the engine's ports.

use async_trait::async_trait;
use conveyor_core::ports::{CommandOutcome, CommandRequest, CommandRunner};
use conveyor_core::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One recorded command execution.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub job: String,
    pub payload: String,
    pub env: BTreeMap<String, String>,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Default)]
struct FakeRunnerState {
    failures: HashMap<String, i32>,
    errors: HashMap<String, String>,
    delays: HashMap<String, u64>,
    calls: Vec<CallRecord>,
    active: usize,
    peak_active: usize,
}

/// Scriptable in-memory command runner.
///
/// Payloads succeed with exit code 0 unless scripted otherwise. Every
/// execution is recorded with start/finish instants so tests can assert
/// on ordering and concurrency.
#[derive(Clone, Default)]
pub struct FakeRunner {
    state: Arc<Mutex<FakeRunnerState>>,
}

impl FakeRunner {
    /// Make the given payload exit with a non-zero code.
    pub fn fail_payload(&self, payload: &str, exit_code: i32) {
        let mut state = self.state.lock().unwrap();
        state.failures.insert(payload.to_string(), exit_code);
    }

    /// Make the given payload return a runner error instead of an exit code.
    pub fn error_payload(&self, payload: &str, message: &str) {
        let mut state = self.state.lock().unwrap();
        state.errors.insert(payload.to_string(), message.to_string());
    }

    /// Hold the given payload for a while before it completes.
    pub fn delay_payload(&self, payload: &str, millis: u64) {
        let mut state = self.state.lock().unwrap();
        state.delays.insert(payload.to_string(), millis);
    }

    /// Executed payloads, in start order.
    pub fn payloads(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.calls.iter().map(|c| c.payload.clone()).collect()
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn last_env(&self) -> Option<BTreeMap<String, String>> {
        let state = self.state.lock().unwrap();
        state.calls.last().map(|c| c.env.clone())
    }

    /// Highest number of payloads in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.state.lock().unwrap().peak_active
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, request: &CommandRequest) -> Result<CommandOutcome> {
        let started = Instant::now();
        let (delay, error, exit_code) = {
            let mut state = self.state.lock().unwrap();
            state.active += 1;
            state.peak_active = state.peak_active.max(state.active);
            (
                state.delays.get(&request.payload).copied(),
                state.errors.get(&request.payload).cloned(),
                state.failures.get(&request.payload).copied().unwrap_or(0),
            )
        };

        if let Some(millis) = delay {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }

        let finished = Instant::now();
        {
            let mut state = self.state.lock().unwrap();
            state.active -= 1;
            state.calls.push(CallRecord {
                job: request.job.clone(),
                payload: request.payload.clone(),
                env: request.env.clone(),
                started,
                finished,
            });
        }

        if let Some(message) = error {
            return Err(Error::Runner(message));
        }
        Ok(CommandOutcome {
            exit_code,
            duration_ms: finished.duration_since(started).as_millis() as u64,
        })
    }
}
