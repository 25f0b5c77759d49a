pub mod clock;
pub mod config;
pub mod error;
pub mod metrics_server;
pub mod observability;
pub mod sampler;
pub mod sinks;
pub mod sources;
pub mod sync;
pub mod transform;

pub use error::PipelineError;
