//! Trade Settings
//!
//! Mutable sizing configuration, kept in its own small file separate from
//! the ledger so the dashboard can patch it without touching account state.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// How replicated trades are sized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SizingMode {
    /// Scale the source's share count by a fixed fraction.
    #[default]
    Percentage,
    /// Spend a fixed USD amount per copied buy.
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeSettings {
    pub mode: SizingMode,
    /// Fraction of the source's size copied in percentage mode.
    pub percentage: f64,
    /// USD notional per copy in fixed mode.
    pub fixed_amount_usd: f64,
}

impl Default for TradeSettings {
    fn default() -> Self {
        Self {
            mode: SizingMode::Percentage,
            percentage: 0.10,
            fixed_amount_usd: 10.0,
        }
    }
}

/// Partial update from the dashboard; absent fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeSettingsPatch {
    pub mode: Option<SizingMode>,
    pub percentage: Option<f64>,
    pub fixed_amount_usd: Option<f64>,
}

impl TradeSettings {
    /// Load settings, falling back to defaults when the file is missing or
    /// unreadable.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Trade settings unreadable, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).context("create settings directory")?;
            }
        }
        let json = serde_json::to_string_pretty(self).context("serialize trade settings")?;
        let tmp: PathBuf = path.with_extension("json.tmp");
        fs::write(&tmp, json).context("write settings temp file")?;
        fs::rename(&tmp, path).context("rename settings into place")?;
        Ok(())
    }

    /// Apply a patch, rejecting values that make no sense. Returns whether
    /// anything changed.
    pub fn apply(&mut self, patch: &TradeSettingsPatch) -> bool {
        let mut changed = false;
        if let Some(mode) = patch.mode {
            if self.mode != mode {
                self.mode = mode;
                changed = true;
            }
        }
        if let Some(pct) = patch.percentage {
            if pct.is_finite() && pct > 0.0 && pct <= 1.0 && pct != self.percentage {
                self.percentage = pct;
                changed = true;
            }
        }
        if let Some(usd) = patch.fixed_amount_usd {
            if usd.is_finite() && usd > 0.0 && usd != self.fixed_amount_usd {
                self.fixed_amount_usd = usd;
                changed = true;
            }
        }
        if changed {
            info!(
                mode = ?self.mode,
                percentage = self.percentage,
                fixed_amount_usd = self.fixed_amount_usd,
                "Trade settings updated"
            );
        }
        changed
    }
}
