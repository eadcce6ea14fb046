//! Configuration validation.
//!
//! Reads the engine tunables through [`ConfigPort`] and validates them into
//! an [`EngineConfig`] that is passed explicitly to every component.

use crate::domain::error::ReconError;
use crate::domain::leverage::{LeverageConfig, MarginMode};
use crate::domain::matcher::MatchConfig;
use crate::ports::config_port::ConfigPort;
use chrono::Duration;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct EngineConfig {
    pub leverage: LeverageConfig,
    pub matching: MatchConfig,
}

pub fn build_engine_config(config: &dyn ConfigPort) -> Result<EngineConfig, ReconError> {
    Ok(EngineConfig {
        leverage: build_leverage_config(config)?,
        matching: build_match_config(config)?,
    })
}

fn invalid(section: &str, key: &str, reason: impl Into<String>) -> ReconError {
    ReconError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn positive_int(config: &dyn ConfigPort, section: &str, key: &str, default: i64) -> Result<i64, ReconError> {
    let value = config.get_int(section, key, default);
    if value <= 0 {
        return Err(invalid(section, key, format!("{key} must be positive")));
    }
    Ok(value)
}

fn lookback(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: i64,
    to_duration: fn(i64) -> Option<Duration>,
) -> Result<Duration, ReconError> {
    let value = positive_int(config, section, key, default)?;
    to_duration(value).ok_or_else(|| invalid(section, key, format!("{key} is out of range")))
}

/// Connection pool size from `[database] pool_size`.
pub fn database_pool_size(config: &dyn ConfigPort) -> Result<u32, ReconError> {
    let value = positive_int(config, "database", "pool_size", 4)?;
    u32::try_from(value).map_err(|_| invalid("database", "pool_size", "pool_size is out of range"))
}

fn fraction(config: &dyn ConfigPort, section: &str, key: &str, default: f64) -> Result<f64, ReconError> {
    let value = config.get_double(section, key, default);
    if !(value > 0.0 && value < 1.0) {
        return Err(invalid(section, key, format!("{key} must be between 0 and 1")));
    }
    Ok(value)
}

fn parse_mode(section: &str, key: &str, raw: &str) -> Result<MarginMode, ReconError> {
    raw.parse::<MarginMode>().map_err(|reason| invalid(section, key, reason))
}

fn build_leverage_config(config: &dyn ConfigPort) -> Result<LeverageConfig, ReconError> {
    let isolated_lookback =
        lookback(config, "leverage", "isolated_lookback_minutes", 60, Duration::try_minutes)?;
    let cross_lookback = lookback(config, "leverage", "cross_lookback_hours", 24, Duration::try_hours)?;

    let default_margin_mode = match config.get_string("leverage", "default_margin_mode") {
        Some(raw) => parse_mode("leverage", "default_margin_mode", &raw)?,
        None => MarginMode::Isolated,
    };

    let max_leverage = match config.get_string("leverage", "max_leverage") {
        None => None,
        Some(raw) if raw.trim().is_empty() => None,
        Some(raw) => match raw.trim().parse::<f64>() {
            Ok(v) if v.is_finite() && v > 0.0 => Some(v),
            _ => return Err(invalid("leverage", "max_leverage", "max_leverage must be a positive number")),
        },
    };

    let mut wallet_margin_modes = HashMap::new();
    for key in config.section_keys("margin_mode") {
        let wallet_id = key
            .trim()
            .parse::<i64>()
            .map_err(|_| invalid("margin_mode", &key, "key must be a wallet id"))?;
        let raw = config.get_string("margin_mode", &key).unwrap_or_default();
        wallet_margin_modes.insert(wallet_id, parse_mode("margin_mode", &key, &raw)?);
    }

    Ok(LeverageConfig {
        isolated_lookback,
        cross_lookback,
        default_margin_mode,
        wallet_margin_modes,
        max_leverage,
    })
}

fn build_match_config(config: &dyn ConfigPort) -> Result<MatchConfig, ReconError> {
    Ok(MatchConfig {
        size_tolerance: fraction(config, "matching", "size_tolerance", 0.001)?,
        borrow_window: lookback(config, "matching", "borrow_window_minutes", 5, Duration::try_minutes)?,
        borrow_size_tolerance: fraction(config, "matching", "borrow_size_tolerance", 0.10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::file_config_adapter::FileConfigAdapter;

    fn make_config(content: &str) -> FileConfigAdapter {
        FileConfigAdapter::from_string(content).unwrap()
    }

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = build_engine_config(&make_config("")).unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn full_config_parses() {
        let cfg = build_engine_config(&make_config(
            r#"
[leverage]
isolated_lookback_minutes = 30
cross_lookback_hours = 12
default_margin_mode = cross
max_leverage = 50

[margin_mode]
7 = isolated

[matching]
size_tolerance = 0.002
borrow_window_minutes = 10
borrow_size_tolerance = 0.2
"#,
        ))
        .unwrap();

        assert_eq!(cfg.leverage.isolated_lookback, Duration::minutes(30));
        assert_eq!(cfg.leverage.cross_lookback, Duration::hours(12));
        assert_eq!(cfg.leverage.max_leverage, Some(50.0));
        assert_eq!(cfg.leverage.margin_mode_for(7), MarginMode::Isolated);
        assert_eq!(cfg.leverage.margin_mode_for(8), MarginMode::Cross);
        assert_eq!(cfg.matching.borrow_window, Duration::minutes(10));
    }

    #[test]
    fn unknown_margin_mode_fails() {
        let err = build_engine_config(&make_config("[leverage]\ndefault_margin_mode = portfolio\n"))
            .unwrap_err();
        assert!(matches!(err, ReconError::ConfigInvalid { ref key, .. } if key == "default_margin_mode"));
    }

    #[test]
    fn non_numeric_wallet_key_fails() {
        let err = build_engine_config(&make_config("[margin_mode]\nmain = cross\n")).unwrap_err();
        assert!(matches!(err, ReconError::ConfigInvalid { ref section, .. } if section == "margin_mode"));
    }

    #[test]
    fn max_leverage_must_be_positive() {
        let err = build_engine_config(&make_config("[leverage]\nmax_leverage = -3\n")).unwrap_err();
        assert!(matches!(err, ReconError::ConfigInvalid { ref key, .. } if key == "max_leverage"));
    }

    #[test]
    fn tolerance_out_of_range_fails() {
        assert!(build_engine_config(&make_config("[matching]\nsize_tolerance = 1.5\n")).is_err());
        assert!(build_engine_config(&make_config("[matching]\nborrow_window_minutes = 0\n")).is_err());
    }

    #[test]
    fn oversized_durations_are_rejected() {
        let err = build_engine_config(&make_config(
            "[leverage]\nisolated_lookback_minutes = 9223372036854775807\n",
        ))
        .unwrap_err();
        assert!(matches!(err, ReconError::ConfigInvalid { ref key, .. } if key == "isolated_lookback_minutes"));

        let err = build_engine_config(&make_config(
            "[matching]\nborrow_window_minutes = 9223372036854775807\n",
        ))
        .unwrap_err();
        assert!(matches!(err, ReconError::ConfigInvalid { ref key, .. } if key == "borrow_window_minutes"));

        let cfg = build_engine_config(&make_config("[leverage]\ncross_lookback_hours = 3000000000\n"))
            .unwrap();
        assert_eq!(cfg.leverage.cross_lookback, Duration::hours(3_000_000_000));
    }

    #[test]
    fn pool_size_must_fit() {
        assert_eq!(database_pool_size(&make_config("")).unwrap(), 4);
        assert_eq!(database_pool_size(&make_config("[database]\npool_size = 8\n")).unwrap(), 8);
        for bad in ["0", "-2", "5000000000"] {
            let cfg = make_config(&format!("[database]\npool_size = {bad}\n"));
            assert!(matches!(
                database_pool_size(&cfg),
                Err(ReconError::ConfigInvalid { ref key, .. }) if key == "pool_size"
            ));
        }
    }
}
