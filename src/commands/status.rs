//! Persisted state snapshot command

use anyhow::{Context, Result};

use vbs_trader::notify::status_report;
use vbs_trader::state_manager::{JsonStateStore, StateStore};

pub fn run(config_path: String, state_file: Option<String>) -> Result<()> {
    let mut config = super::load_config(&config_path)?;
    if let Some(path) = state_file {
        config.trading.state_file = path;
    }

    let reset = config.daily_reset()?;
    let store = JsonStateStore::new(&config.trading.state_file, reset);
    let state = store
        .load()
        .with_context(|| format!("No trading state at {}", store.path().display()))?;

    println!("{}", status_report(&state, &reset));
    if !state.is_consistent() {
        println!(
            "WARNING: phase {} should {}hold an order",
            state.phase,
            if state.phase.awaits_order() { "" } else { "not " }
        );
    }
    Ok(())
}
