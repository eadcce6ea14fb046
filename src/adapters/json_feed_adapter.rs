//! JSON file feed: one refresh cycle object, or an array of them.

use crate::domain::error::ReconError;
use crate::domain::payload::{CycleInput, RawCycle};
use crate::ports::feed_port::FeedPort;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

#[derive(Deserialize)]
#[serde(untagged)]
enum FeedDocument {
    Many(Vec<RawCycle>),
    One(RawCycle),
}

pub struct JsonFeedAdapter {
    path: PathBuf,
}

impl JsonFeedAdapter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn parse(content: &str, ingested_at: DateTime<Utc>) -> Result<Vec<CycleInput>, ReconError> {
        let raw = match serde_json::from_str::<FeedDocument>(content)? {
            FeedDocument::Many(cycles) => cycles,
            FeedDocument::One(cycle) => vec![cycle],
        };
        Ok(raw
            .iter()
            .map(|cycle| CycleInput::from_raw(cycle, ingested_at))
            .collect())
    }
}

impl FeedPort for JsonFeedAdapter {
    fn load_cycles(&self) -> Result<Vec<CycleInput>, ReconError> {
        let content = fs::read_to_string(&self.path)?;
        let cycles = Self::parse(&content, Utc::now())?;
        tracing::debug!(path = %self.path.display(), cycles = cycles.len(), "read feed");
        Ok(cycles)
    }
}
