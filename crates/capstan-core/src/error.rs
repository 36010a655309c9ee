use thiserror::Error;

/// Batch-wide scale-up failures. This is the one error that may escape
/// a control loop: the intake layer turns `Retriable` into partial-batch
/// rejections and swallows everything else so a poison batch cannot
/// loop forever.
#[derive(Debug, Error)]
pub enum ScaleError {
    /// Bulk create returned zero instances but at least one error code
    /// says capacity may free up. The intake layer rejects
    /// `failed_instance_count` messages so the queue re-delivers them.
    #[error("created 0 of {failed_instance_count} instances, retriable fleet errors: {error_codes:?}")]
    Retriable {
        failed_instance_count: usize,
        error_codes: Vec<String>,
    },
    /// Bulk create returned zero instances and nothing retriable.
    /// Re-delivering the same messages would fail the same way.
    #[error("created 0 instances, fatal fleet errors: {error_codes:?}")]
    Fatal { error_codes: Vec<String> },
    /// The cloud adapter itself failed (transport, auth, throttling on
    /// the control call). Treated like `Fatal` by the intake layer.
    #[error(transparent)]
    Cloud(#[from] anyhow::Error),
}

impl ScaleError {
    pub fn failed_instance_count(&self) -> usize {
        match self {
            ScaleError::Retriable {
                failed_instance_count,
                ..
            } => *failed_instance_count,
            _ => 0,
        }
    }
}
