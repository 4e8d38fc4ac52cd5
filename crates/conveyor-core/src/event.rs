//! Per-run event context.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Immutable facts about the event that triggered a run.
///
/// Shared read-only across every job instance of the run; never mutated
/// once the run starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventContext {
    pub trigger: Trigger,
    pub git_ref: Option<String>,
    pub actor: Option<String>,
    /// Whether the event was created manually (e.g. a hand-cut release).
    #[serde(default)]
    pub manual: bool,
}

impl EventContext {
    pub fn new(trigger: Trigger) -> Self {
        Self {
            trigger,
            git_ref: None,
            actor: None,
            manual: false,
        }
    }

    pub fn with_ref(mut self, git_ref: impl Into<String>) -> Self {
        self.git_ref = Some(git_ref.into());
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn manual(mut self) -> Self {
        self.manual = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Push,
    PullRequest,
    Release,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Push => "push",
            Trigger::PullRequest => "pull_request",
            Trigger::Release => "release",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(Trigger::Push),
            "pull_request" => Ok(Trigger::PullRequest),
            "release" => Ok(Trigger::Release),
            other => Err(format!("unknown trigger: {}", other)),
        }
    }
}
