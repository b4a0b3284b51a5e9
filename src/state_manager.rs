// State Manager for Live Trading
// Single-record JSON persistence of the trading state machine
//
// The snapshot is small and human-readable so an operator can inspect or
// hand-edit it between restarts.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::clock::DailyReset;

// =============================================================================
// Data Models
// =============================================================================

/// Trading phase. The cycle is `buy → confirm_buy → sleep → sell →
/// confirm_sell → buy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Buy,
    ConfirmBuy,
    Sleep,
    Sell,
    ConfirmSell,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Buy => "buy",
            Phase::ConfirmBuy => "confirm_buy",
            Phase::Sleep => "sleep",
            Phase::Sell => "sell",
            Phase::ConfirmSell => "confirm_sell",
        }
    }

    /// Phases in which an order uuid must be held
    pub fn awaits_order(&self) -> bool {
        matches!(self, Phase::ConfirmBuy | Phase::ConfirmSell)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradingState {
    pub phase: Phase,
    pub order_uuid: Option<String>,
    pub acc_yield_rate: f64,
    /// Quote balance at the start of the current cycle
    pub balance: f64,
    pub next_reset: DateTime<Utc>,
}

impl TradingState {
    pub fn fresh(balance: f64, next_reset: DateTime<Utc>) -> Self {
        Self {
            phase: Phase::Buy,
            order_uuid: None,
            acc_yield_rate: 1.0,
            balance,
            next_reset,
        }
    }

    /// `order_uuid` is set exactly in the confirm phases
    pub fn is_consistent(&self) -> bool {
        self.order_uuid.is_some() == self.phase.awaits_order()
    }

    /// Accumulated yield as a percentage gain
    pub fn acc_yield_percent(&self) -> f64 {
        (self.acc_yield_rate - 1.0) * 100.0
    }
}

/// On-disk shape: `next_reset` as an exchange-local datestring
#[derive(Debug, Serialize, Deserialize)]
struct StateRecord {
    phase: Phase,
    order_uuid: Option<String>,
    acc_yield_rate: f64,
    balance: f64,
    next_reset: String,
}

// =============================================================================
// State Store
// =============================================================================

pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<TradingState>;
    fn save(&self, state: &TradingState) -> Result<()>;
}

/// Pretty-printed JSON snapshot, replaced wholesale on every save
pub struct JsonStateStore {
    path: PathBuf,
    reset: DailyReset,
}

impl JsonStateStore {
    pub fn new<P: AsRef<Path>>(path: P, reset: DailyReset) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            reset,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for JsonStateStore {
    fn load(&self) -> Result<TradingState> {
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file: {}", self.path.display()))?;
        let record: StateRecord = serde_json::from_str(&text)
            .with_context(|| format!("Malformed state file: {}", self.path.display()))?;

        let state = TradingState {
            phase: record.phase,
            order_uuid: record.order_uuid,
            acc_yield_rate: record.acc_yield_rate,
            balance: record.balance,
            next_reset: self.reset.parse(&record.next_reset)?,
        };
        debug!(
            "State loaded: phase={}, next_reset={}",
            state.phase, record.next_reset
        );
        Ok(state)
    }

    fn save(&self, state: &TradingState) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let record = StateRecord {
            phase: state.phase,
            order_uuid: state.order_uuid.clone(),
            acc_yield_rate: state.acc_yield_rate,
            balance: state.balance,
            next_reset: self.reset.format(state.next_reset),
        };
        let json = serde_json::to_string_pretty(&record)?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write state file: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace state file: {}", self.path.display()))?;

        debug!("State saved to: {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn test_round_trip() {
        let dir = tempdir().unwrap();
        let store = JsonStateStore::new(dir.path().join("core.json"), DailyReset::default());
        let state = TradingState {
            phase: Phase::ConfirmSell,
            order_uuid: Some("9ca5a1b2-0000".to_string()),
            acc_yield_rate: 1.071,
            balance: 1_050_000.5,
            next_reset: Utc.with_ymd_and_hms(2021, 3, 15, 0, 0, 0).unwrap(),
        };

        store.save(&state).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_file_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("core.json");
        let store = JsonStateStore::new(&path, DailyReset::default());
        let state = TradingState::fresh(
            1_000_000.0,
            Utc.with_ymd_and_hms(2021, 3, 15, 0, 0, 0).unwrap(),
        );
        store.save(&state).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["phase"], "buy");
        assert_eq!(raw["order_uuid"], serde_json::Value::Null);
        assert_eq!(raw["acc_yield_rate"], 1.0);
        assert_eq!(raw["next_reset"], "2021-03-15 09:00:00");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_load_failures() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("core.json");
        let store = JsonStateStore::new(&path, DailyReset::default());
        assert!(store.load().is_err());

        std::fs::write(&path, "{\"phase\": \"dance\"}").unwrap();
        assert!(store.load().is_err());
    }

    #[test]
    fn test_phase_invariant() {
        let mut state = TradingState::fresh(0.0, Utc::now());
        assert!(state.is_consistent());
        state.phase = Phase::ConfirmBuy;
        assert!(!state.is_consistent());
        state.order_uuid = Some("x".into());
        assert!(state.is_consistent());
        assert_eq!(Phase::ConfirmBuy.to_string(), "confirm_buy");
    }
}
