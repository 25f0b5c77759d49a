use std::time::Duration;

use meter_client::domain::{ChannelValues, SourceKind};
use serde_json::{Map, Value};

use super::{SourceError, SourceReader};

/// Polls a meter's local HTTP API (`GET` returning a flat JSON object).
pub struct HttpSensorReader {
    client: reqwest::Client,
    url: String,
    kind: SourceKind,
}

impl HttpSensorReader {
    pub fn new(url: impl Into<String>, kind: SourceKind, timeout: Duration) -> Result<Self, SourceError> {
        let url = url.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|source| SourceError::Transport {
                url: url.clone(),
                source,
            })?;

        Ok(Self { client, url, kind })
    }
}

/// Extracts the retained channels from a sensor payload.
///
/// Unknown and non-numeric fields are ignored; a body without any retained
/// channel is treated as malformed.
pub fn parse_payload(body: &Map<String, Value>) -> Result<ChannelValues, String> {
    let mut values = ChannelValues::empty();
    let mut matched = 0usize;

    for (name, value) in body {
        if let Some(v) = value.as_f64() {
            if values.set(name, v) {
                matched += 1;
            }
        }
    }

    if matched == 0 {
        return Err("payload carries none of the expected channels".to_string());
    }
    Ok(values)
}

#[async_trait::async_trait]
impl SourceReader for HttpSensorReader {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn read(&self) -> Result<ChannelValues, SourceError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|source| SourceError::Transport {
                url: self.url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }

        let body: Map<String, Value> = response.json().await.map_err(|e| SourceError::Body {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;

        parse_payload(&body).map_err(|reason| SourceError::Body {
            url: self.url.clone(),
            reason,
        })
    }
}
