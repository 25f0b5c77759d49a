use crate::sinks::StoreError;

/// Failures while moving readings and rows between the edge and the store.
///
/// Each variant names the stage that failed; callers decide whether the unit
/// of work (a tick, a day, a site) is skipped or the whole run aborts.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("source error: {0}")]
    Source(String),
    #[error("sink error: {0}")]
    Sink(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("integrity violation: {0}")]
    Integrity(String),
}
