use serde_json::Value;

/// Options governing one `run` invocation.
#[derive(Debug, Clone)]
pub struct RunOpts {
    /// Parallelism budget; always at least 1.
    pub parallel: usize,
    pub cache_enabled: bool,
    /// Replay cached terminal output on hits, or stay quiet about it.
    pub hide_cached_output: bool,
    pub verbose: bool,
    pub configuration: Option<String>,
    /// Set for run-one invocations: this project's output streams live.
    pub initiating_project: Option<String>,
    /// Limit initiating projects to those affected since this ref's
    /// recorded hashes.
    pub base: Option<String>,
    /// CLI-provided option overrides applied to every task.
    pub overrides: Value,
}

impl Default for RunOpts {
    fn default() -> Self {
        Self {
            parallel: num_cpus::get().max(1),
            cache_enabled: true,
            hide_cached_output: false,
            verbose: false,
            configuration: None,
            initiating_project: None,
            base: None,
            overrides: Value::Null,
        }
    }
}
