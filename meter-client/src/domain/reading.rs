use chrono::{DateTime, Utc};

use super::channels::ChannelValues;

/// One instant captured from one sensor endpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub ts: DateTime<Utc>,
    pub values: ChannelValues,
}

impl Reading {
    pub fn new(ts: DateTime<Utc>, values: ChannelValues) -> Self {
        Self { ts, values }
    }
}
