pub mod day_file;
pub mod http_sensor;

use meter_client::domain::{ChannelValues, SourceKind};

pub use day_file::parse_day_file;
pub use http_sensor::HttpSensorReader;

/// Why a single sensor read produced no reading.
#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("malformed body from {url}: {reason}")]
    Body { url: String, reason: String },
    #[error("no answer within {0:?}")]
    Timeout(std::time::Duration),
}

/// One sensor endpoint. Every failure is recoverable from the sampler's view.
#[async_trait::async_trait]
pub trait SourceReader: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn read(&self) -> Result<ChannelValues, SourceError>;
}
