use rhai::{Dynamic, Engine, EvalAltResult};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Resource bounds for one script run.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptLimits {
    /// Wall-clock budget; zero disables the deadline.
    pub timeout: Duration,
    /// Operation budget; zero means unlimited.
    pub max_operations: u64,
    pub max_call_levels: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1_000),
            max_operations: 100_000,
            max_call_levels: 64,
            max_string_size: 1_000_000,
            max_array_size: 10_000,
            max_map_size: 10_000,
        }
    }
}

impl ScriptLimits {
    /// Build an engine bounded by these limits.
    ///
    /// The deadline starts now, so build one engine per run. A cancelled
    /// `cancel` token terminates the script at its next operation.
    pub fn engine(&self, cancel: Option<CancellationToken>) -> Engine {
        let mut engine = Engine::new();
        engine.set_max_operations(self.max_operations);
        engine.set_max_call_levels(self.max_call_levels);
        engine.set_max_string_size(self.max_string_size);
        engine.set_max_array_size(self.max_array_size);
        engine.set_max_map_size(self.max_map_size);

        let deadline = (!self.timeout.is_zero()).then(|| Instant::now() + self.timeout);
        engine.on_progress(move |_| {
            if cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                return Some(Dynamic::from("canceled"));
            }
            match deadline {
                Some(deadline) if Instant::now() >= deadline => Some(Dynamic::from("timeout")),
                _ => None,
            }
        });
        engine
    }
}

/// Human-readable reason for a failed script run.
pub fn describe_error(err: &EvalAltResult) -> String {
    match err {
        EvalAltResult::ErrorTerminated(token, _) => {
            if token.clone().into_string().ok().as_deref() == Some("canceled") {
                "script was canceled".to_string()
            } else {
                "script timed out".to_string()
            }
        }
        EvalAltResult::ErrorTooManyOperations(_) => "script exceeded its operation budget".to_string(),
        other => other.to_string(),
    }
}
