//! Confirmation-deadline bookkeeping.
//!
//! Deadlines persist in sled keyed by big-endian nanoseconds, so the due
//! set is a prefix walk and survives a restart. Firing is idempotent by
//! construction: `due` only reads; an entry is consumed via `cancel` after
//! the guarded transition has committed (or turned out to be a no-op), so a
//! crash between fire and consume merely re-fires against a state that no
//! longer matches.

use chrono::Utc;

use crate::error::{EngineError, Result};
use crate::utils::TimeStamp;

pub struct DeadlineScheduler {
    /// nanos(be) ++ trade_id -> trade_id
    deadlines: sled::Tree,
    /// trade_id -> full deadline key, for O(1) cancellation
    by_id: sled::Tree,
}

impl DeadlineScheduler {
    pub fn open(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            deadlines: db.open_tree("deadlines")?,
            by_id: db.open_tree("deadlines_by_id")?,
        })
    }

    fn key_for(at: &TimeStamp<Utc>, trade_id: &str) -> Result<Vec<u8>> {
        let nanos = at
            .nanos()
            .ok_or_else(|| EngineError::Codec("deadline out of timestamp range".into()))?;
        let mut key = nanos.to_be_bytes().to_vec();
        key.extend_from_slice(trade_id.as_bytes());
        Ok(key)
    }

    /// One deadline per trade; scheduling again replaces the old entry.
    pub fn schedule(&self, trade_id: &str, at: &TimeStamp<Utc>) -> Result<()> {
        self.cancel(trade_id)?;
        let key = Self::key_for(at, trade_id)?;
        self.deadlines.insert(&key, trade_id.as_bytes())?;
        self.by_id.insert(trade_id.as_bytes(), key)?;
        Ok(())
    }

    pub fn cancel(&self, trade_id: &str) -> Result<()> {
        if let Some(key) = self.by_id.remove(trade_id.as_bytes())? {
            self.deadlines.remove(&key)?;
        }
        Ok(())
    }

    /// Every trade whose deadline is at or before `now`, oldest first.
    /// Read-only; entries stay until `cancel`.
    pub fn due(&self, now: &TimeStamp<Utc>) -> Result<Vec<String>> {
        let horizon = now
            .nanos()
            .ok_or_else(|| EngineError::Codec("deadline out of timestamp range".into()))?;
        let mut out = Vec::new();
        for item in self.deadlines.iter() {
            let (key, value) = item?;
            let stamp: [u8; 8] = key
                .get(..8)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| EngineError::Corrupt("malformed deadline key".into()))?;
            if i64::from_be_bytes(stamp) > horizon {
                break;
            }
            out.push(String::from_utf8_lossy(&value).to_string());
        }
        Ok(out)
    }
}
