//! Position Filter
//!
//! Blacklist of market ids the engine must not copy because the real
//! account already holds a position there. Persisted as a plain JSON string
//! list so it survives restarts and can be inspected by hand.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{info, warn};

pub struct PositionFilter {
    path: PathBuf,
    markets: RwLock<HashSet<String>>,
}

impl PositionFilter {
    /// Load the persisted blacklist, or start empty when the file is
    /// missing or unreadable.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let markets = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(list) => list.into_iter().collect(),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Blacklist unreadable, starting empty");
                    HashSet::new()
                }
            },
            Err(_) => HashSet::new(),
        };
        Self {
            path,
            markets: RwLock::new(markets),
        }
    }

    /// Replace the blacklist with the markets the source account currently
    /// holds, and persist.
    pub fn initialize(&self, existing_market_ids: Vec<String>) -> Result<()> {
        let count = existing_market_ids.len();
        {
            let mut set = self.markets.write().unwrap();
            *set = existing_market_ids.into_iter().collect();
        }
        self.save()?;
        info!(markets = count, "Position blacklist initialized");
        Ok(())
    }

    pub fn is_blacklisted(&self, market_id: &str) -> bool {
        self.markets.read().unwrap().contains(market_id)
    }

    pub fn len(&self) -> usize {
        self.markets.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.read().unwrap().is_empty()
    }

    fn save(&self) -> Result<()> {
        let list: Vec<String> = {
            let set = self.markets.read().unwrap();
            let mut v: Vec<String> = set.iter().cloned().collect();
            v.sort();
            v
        };
        let json = serde_json::to_string_pretty(&list).context("serialize blacklist")?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).context("create blacklist directory")?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).context("write blacklist temp file")?;
        fs::rename(&tmp, &self.path).context("rename blacklist into place")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn blacklist_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("positions_log.json");
        {
            let f = PositionFilter::open(&path);
            assert!(f.is_empty());
            f.initialize(vec!["m1".to_string(), "m2".to_string()]).unwrap();
            assert!(f.is_blacklisted("m1"));
            assert!(!f.is_blacklisted("m3"));
        }
        let f = PositionFilter::open(&path);
        assert_eq!(f.len(), 2);
        assert!(f.is_blacklisted("m2"));
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("positions_log.json");
        fs::write(&path, "{{not json").unwrap();
        let f = PositionFilter::open(&path);
        assert!(f.is_empty());
    }
}
