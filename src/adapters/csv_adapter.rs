//! CSV import of operator-maintained strategy assignments.
//!
//! Expected header:
//! `wallet_id,symbol,strategy_id,strategy_name,description,start_at,end_at,active`.
//! Only `wallet_id`, `symbol`, `strategy_id` and `start_at` are required.

use crate::domain::error::ReconError;
use crate::domain::strategy::{AssignmentImport, Strategy, StrategyAssignment};
use crate::domain::symbol::validate_symbol;
use crate::domain::timeutil::parse_timestamp;
use crate::ports::feed_port::AssignmentSource;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
struct AssignmentRow {
    wallet_id: i64,
    symbol: String,
    strategy_id: i64,
    #[serde(default)]
    strategy_name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    start_at: String,
    #[serde(default)]
    end_at: Option<String>,
    #[serde(default)]
    active: Option<String>,
}

pub struct CsvAssignmentAdapter {
    path: PathBuf,
}

impl CsvAssignmentAdapter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn parse(content: &str) -> Result<AssignmentImport, ReconError> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(content.as_bytes());

        let mut strategies: BTreeMap<i64, Strategy> = BTreeMap::new();
        let mut assignments = Vec::new();

        for (idx, result) in rdr.deserialize::<AssignmentRow>().enumerate() {
            // Header is line 1.
            let line = idx + 2;
            let row = result.map_err(|e| payload(line, format!("CSV parse error: {e}")))?;

            let symbol = validate_symbol(&row.symbol)
                .map_err(|e| payload(line, format!("symbol {:?}: {e}", row.symbol)))?;
            let start_at = parse_timestamp(&row.start_at)
                .ok_or_else(|| payload(line, format!("invalid start_at {:?}", row.start_at)))?;
            let end_at = match row.end_at.as_deref().filter(|s| !s.is_empty()) {
                Some(raw) => Some(
                    parse_timestamp(raw)
                        .ok_or_else(|| payload(line, format!("invalid end_at {raw:?}")))?,
                ),
                None => None,
            };
            if end_at.is_some_and(|end| end < start_at) {
                return Err(payload(line, "end_at precedes start_at".to_string()));
            }
            let active = match row.active.as_deref().filter(|s| !s.is_empty()) {
                Some(raw) => parse_flag(raw)
                    .ok_or_else(|| payload(line, format!("invalid active flag {raw:?}")))?,
                None => true,
            };

            if let Some(name) = row.strategy_name.filter(|n| !n.is_empty()) {
                strategies.insert(
                    row.strategy_id,
                    Strategy {
                        id: row.strategy_id,
                        name,
                        description: row.description.filter(|d| !d.is_empty()),
                    },
                );
            }

            assignments.push(StrategyAssignment {
                id: None,
                wallet_id: row.wallet_id,
                symbol,
                strategy_id: row.strategy_id,
                start_at,
                end_at,
                active,
            });
        }

        Ok(AssignmentImport {
            strategies: strategies.into_values().collect(),
            assignments,
        })
    }
}

impl AssignmentSource for CsvAssignmentAdapter {
    fn load_assignments(&self) -> Result<AssignmentImport, ReconError> {
        let content = fs::read_to_string(&self.path)?;
        let import = Self::parse(&content)?;
        tracing::debug!(
            path = %self.path.display(),
            assignments = import.assignments.len(),
            strategies = import.strategies.len(),
            "read assignment export"
        );
        Ok(import)
    }
}

fn payload(line: usize, reason: String) -> ReconError {
    ReconError::Payload {
        reason: format!("line {line}: {reason}"),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}
