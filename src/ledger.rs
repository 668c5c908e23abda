//! Append-only ledger of wallet debits and credits.
//!
//! A user's balance is the sum of their entries and is never negative by
//! construction: debits are validated against the materialized balance
//! before the entry is recorded. Callers serialize per-user mutations; the
//! engine takes a per-user lock around every debit/credit pair.

use chrono::Utc;

use crate::error::{EngineError, Result};
use crate::money::Money;
use crate::utils::{TimeStamp, short_ref};

/// Account credited with consumed platform fees, so the entries referencing
/// any settled aggregate sum to zero.
pub const PLATFORM_ACCOUNT: &str = "platform";

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryReason {
    #[n(0)]
    Deposit,
    #[n(1)]
    FeeDebit,
    #[n(2)]
    FeeCredit,
    #[n(3)]
    SaleCredit,
    #[n(4)]
    SaleDebit,
    #[n(5)]
    Refund,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    #[n(0)]
    pub entry_id: String,
    #[n(1)]
    pub user: String,
    /// Signed cents. Positive for credits, negative for debits.
    #[n(2)]
    pub delta: i64,
    #[n(3)]
    pub reason: EntryReason,
    /// The trade or sale that caused this entry, or a caller-chosen tag.
    #[n(4)]
    pub reference: String,
    #[n(5)]
    pub created_at: TimeStamp<Utc>,
}

pub struct Ledger {
    /// Entries keyed `reference/entry_id` so an aggregate's history is one
    /// prefix scan.
    entries: sled::Tree,
    /// Materialized balance per user, big-endian u64 cents.
    balances: sled::Tree,
}

impl Ledger {
    pub fn open(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            entries: db.open_tree("ledger_entries")?,
            balances: db.open_tree("ledger_balances")?,
        })
    }

    pub fn balance(&self, user: &str) -> Result<Money> {
        match self.balances.get(user.as_bytes())? {
            Some(raw) => {
                let bytes: [u8; 8] = raw
                    .as_ref()
                    .try_into()
                    .map_err(|_| EngineError::Corrupt(format!("balance record for {user}")))?;
                Ok(Money::from_cents(u64::from_be_bytes(bytes)))
            }
            None => Ok(Money::ZERO),
        }
    }

    pub fn credit(
        &self,
        user: &str,
        amount: Money,
        reason: EntryReason,
        reference: &str,
    ) -> Result<LedgerEntry> {
        let balance = self.balance(user)?;
        let updated = balance
            .checked_add(amount)
            .ok_or_else(|| EngineError::Corrupt(format!("balance overflow for {user}")))?;
        self.record(user, amount.as_delta(), updated, reason, reference)
    }

    /// Fails with `InsufficientFunds` before anything is written.
    pub fn debit(
        &self,
        user: &str,
        amount: Money,
        reason: EntryReason,
        reference: &str,
    ) -> Result<LedgerEntry> {
        let balance = self.balance(user)?;
        let updated = balance
            .checked_sub(amount)
            .ok_or(EngineError::InsufficientFunds {
                needed: amount,
                available: balance,
            })?;
        self.record(user, -amount.as_delta(), updated, reason, reference)
    }

    fn record(
        &self,
        user: &str,
        delta: i64,
        updated: Money,
        reason: EntryReason,
        reference: &str,
    ) -> Result<LedgerEntry> {
        let entry = LedgerEntry {
            entry_id: short_ref("ENT"),
            user: user.to_string(),
            delta,
            reason,
            reference: reference.to_string(),
            created_at: TimeStamp::now(),
        };
        let key = format!("{}/{}", reference, entry.entry_id);
        self.entries.insert(key.as_bytes(), minicbor::to_vec(&entry)?)?;
        // balance write follows the entry; a crash in between is detectable
        // by replaying entries, never by a phantom balance
        self.balances
            .insert(user.as_bytes(), &updated.cents().to_be_bytes())?;
        Ok(entry)
    }

    /// Every entry caused by one trade or sale.
    pub fn entries_for(&self, reference: &str) -> Result<Vec<LedgerEntry>> {
        let mut out = Vec::new();
        let prefix = format!("{reference}/");
        for item in self.entries.scan_prefix(prefix.as_bytes()) {
            let (_, raw) = item?;
            out.push(minicbor::decode(&raw)?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_ledger(dir: &tempfile::TempDir) -> Ledger {
        let db = sled::open(dir.path().join("ledger.db")).unwrap();
        Ledger::open(&db).unwrap()
    }

    #[test]
    fn debit_requires_funds() {
        let dir = tempdir().unwrap();
        let ledger = open_ledger(&dir);

        let err = ledger
            .debit("user_a", Money::from_dollars(5), EntryReason::FeeDebit, "TRD-1")
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));
        assert_eq!(ledger.balance("user_a").unwrap(), Money::ZERO);

        ledger
            .credit("user_a", Money::from_dollars(10), EntryReason::Deposit, "deposit")
            .unwrap();
        ledger
            .debit("user_a", Money::from_dollars(5), EntryReason::FeeDebit, "TRD-1")
            .unwrap();
        assert_eq!(ledger.balance("user_a").unwrap(), Money::from_dollars(5));
    }

    #[test]
    fn entries_group_by_reference() {
        let dir = tempdir().unwrap();
        let ledger = open_ledger(&dir);

        ledger
            .credit("user_a", Money::from_dollars(10), EntryReason::Deposit, "deposit")
            .unwrap();
        ledger
            .debit("user_a", Money::from_dollars(5), EntryReason::FeeDebit, "TRD-1")
            .unwrap();
        ledger
            .credit("user_a", Money::from_dollars(5), EntryReason::Refund, "TRD-1")
            .unwrap();

        let entries = ledger.entries_for("TRD-1").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries.iter().map(|e| e.delta).sum::<i64>(), 0);
    }
}
