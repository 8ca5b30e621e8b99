//! Status reporting from pipeline stages to the user interface.

use tracing::info;

/// Fire-and-forget progress reporting. Implementations must never block the
/// pipeline; anything slow belongs on the receiving side.
pub trait StatusCallback: Send + Sync {
    /// Report progress of a stage. `progress` is a fraction in `[0, 1]`, or
    /// `None` when the stage cannot estimate it.
    fn emit(&self, stage: &str, progress: Option<f32>, message: &str);
}

/// Status callback that discards every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoStatus;

impl StatusCallback for NoStatus {
    fn emit(&self, _stage: &str, _progress: Option<f32>, _message: &str) {}
}

/// Status callback that logs updates through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingStatus;

impl StatusCallback for TracingStatus {
    fn emit(&self, stage: &str, progress: Option<f32>, message: &str) {
        match progress {
            Some(fraction) => {
                info!(stage, progress = format!("{:.0}%", fraction * 100.0), "{message}")
            }
            None => info!(stage, "{message}"),
        }
    }
}
