// =============================================================================
// Checkpoint persistence — exactly the state that must survive a restart
// =============================================================================
//
// The engine is stateless across restarts except for open positions (with
// their FSM state), the daily risk counters, and the emitted-signal
// cooldowns. Writes use the tmp + rename pattern so a crash mid-write can
// never corrupt the checkpoint.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::position_fsm::Position;
use crate::risk::RiskDaySnapshot;
use crate::types::Side;

/// One persisted signal cooldown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CooldownEntry {
    pub symbol: String,
    pub level_price: f64,
    pub side: Side,
    pub expires_ms: i64,
}

/// Everything the engine reloads on start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub positions: Vec<Position>,
    pub risk_day: RiskDaySnapshot,
    pub cooldowns: Vec<CooldownEntry>,
}

impl Checkpoint {
    /// Persist atomically: write a tmp sibling, then rename over the
    /// target.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialise checkpoint")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp checkpoint to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp checkpoint to {}", path.display()))?;

        info!(path = %path.display(), positions = self.positions.len(), "checkpoint saved");
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read checkpoint from {}", path.display()))?;
        let checkpoint: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse checkpoint at {}", path.display()))?;
        info!(
            path = %path.display(),
            positions = checkpoint.positions.len(),
            "checkpoint loaded"
        );
        Ok(checkpoint)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position_fsm::{FsmState, TpRung};
    use crate::preset::PlacementMode;
    use std::collections::VecDeque;

    fn sample_position() -> Position {
        Position {
            id: "pos-1".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            entry_price: 50_000.0,
            qty_open: 0.4,
            qty_initial: 1.0,
            stop_price: 50_100.0,
            initial_stop: 49_400.0,
            tp_ladder: vec![TpRung {
                reward_multiple: 1.5,
                size_pct: 0.6,
                placement_mode: PlacementMode::Smart,
                price: 50_900.0,
                filled: true,
            }],
            level_price: 49_950.0,
            opened_ms: 1_700_000_000_000,
            bars_since_entry: 12,
            realized_r: 0.9,
            realized_pnl: 540.0,
            mfe: 1.8,
            mae: -0.2,
            state: FsmState::PartialClosed,
            history: VecDeque::from([
                FsmState::Entry,
                FsmState::Running,
                FsmState::Breakeven,
                FsmState::PartialClosed,
            ]),
            exit_attempts: 0,
            exit_reason: None,
            closed_ms: None,
        }
    }

    fn sample_checkpoint() -> Checkpoint {
        Checkpoint {
            positions: vec![sample_position()],
            risk_day: RiskDaySnapshot {
                date: "2023-11-14".to_string(),
                realized_r_today: -1.2,
                realized_pnl_today: -120.0,
                consecutive_losses: 2,
                trades_today: 5,
                kill_switch: false,
            },
            cooldowns: vec![CooldownEntry {
                symbol: "BTCUSDT".to_string(),
                level_price: 50_000.0,
                side: Side::Long,
                expires_ms: 1_700_000_900_000,
            }],
        }
    }

    #[test]
    fn checkpoint_round_trips_exactly() {
        let checkpoint = sample_checkpoint();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");

        checkpoint.save(&path).unwrap();
        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(checkpoint, loaded);

        // Position and FSM state survive byte-exactly through a second
        // cycle as well.
        loaded.save(&path).unwrap();
        let again = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded, again);
    }

    #[test]
    fn missing_checkpoint_is_an_error() {
        assert!(Checkpoint::load("/nonexistent/checkpoint.json").is_err());
    }

    #[test]
    fn save_overwrites_previous_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");

        let mut checkpoint = sample_checkpoint();
        checkpoint.save(&path).unwrap();

        checkpoint.positions.clear();
        checkpoint.risk_day.kill_switch = true;
        checkpoint.save(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert!(loaded.positions.is_empty());
        assert!(loaded.risk_day.kill_switch);
    }
}
