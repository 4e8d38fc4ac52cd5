//! CLI command definitions.

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a pipeline definition
    Validate {
        /// Path to pipeline file
        #[arg(default_value = "conveyor.yaml")]
        path: String,
    },

    /// Show the concrete instances a pipeline expands to
    Expand {
        /// Path to pipeline file
        #[arg(default_value = "conveyor.yaml")]
        path: String,
    },

    /// Run a pipeline locally
    Run {
        /// Path to pipeline file
        #[arg(default_value = "conveyor.yaml")]
        path: String,

        /// Event trigger (push, pull_request, release)
        #[arg(short, long, default_value = "push")]
        trigger: String,

        /// Git ref the event carries
        #[arg(long)]
        git_ref: Option<String>,

        /// Actor the event carries
        #[arg(long)]
        actor: Option<String>,

        /// Mark the event as manually created
        #[arg(long)]
        manual: bool,

        /// Workspace directory commands run in
        #[arg(short, long, default_value = ".")]
        workspace: String,

        /// Maximum instances running at once
        #[arg(short, long, default_value_t = 4)]
        concurrency: usize,

        /// Directory for the local cache store
        #[arg(long, default_value = ".conveyor/cache")]
        cache_dir: String,

        /// Directory for the local artifact store
        #[arg(long, default_value = ".conveyor/artifacts")]
        artifact_dir: String,
    },
}
