//! Escrow custody: exclusive holds over cards mid-settlement, with
//! append-only per-side release.
//!
//! A card can sit in at most one open lock at a time, enforced by a
//! card-to-lock index consulted before any lock is written. Release is
//! irreversible per side, which makes "both sides released" a simple
//! conjunction that cannot flicker.

use crate::error::{ConflictError, EngineError, Result};
use crate::utils::short_ref;

/// Which party of a two-sided escrow is acting. Sales use `Initiator` for
/// their single (seller) side.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    #[n(0)]
    Initiator,
    #[n(1)]
    Responder,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Initiator => Side::Responder,
            Side::Responder => Side::Initiator,
        }
    }
}

/// A grant recorded when a side releases: `user` may now view the secret of
/// `card_id`.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Visibility {
    #[n(0)]
    pub user: String,
    #[n(1)]
    pub card_id: String,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct EscrowLock {
    #[n(0)]
    pub lock_id: String,
    /// The trade or sale this lock belongs to.
    #[n(1)]
    pub reference: String,
    /// One card for a sale, two for a trade.
    #[n(2)]
    pub cards: Vec<String>,
    #[n(3)]
    pub initiator_released: bool,
    #[n(4)]
    pub responder_released: bool,
    #[n(5)]
    pub secrets_visible_to: Vec<Visibility>,
}

impl EscrowLock {
    pub fn released(&self, side: Side) -> bool {
        match side {
            Side::Initiator => self.initiator_released,
            Side::Responder => self.responder_released,
        }
    }

    pub fn both_released(&self) -> bool {
        self.initiator_released && self.responder_released
    }

    pub fn grants_view(&self, user: &str, card_id: &str) -> bool {
        self.secrets_visible_to
            .iter()
            .any(|v| v.user == user && v.card_id == card_id)
    }
}

pub struct EscrowCustody {
    locks: sled::Tree,
    /// card_id -> lock_id, the exclusivity index.
    card_index: sled::Tree,
    /// trade/sale reference -> lock_id.
    ref_index: sled::Tree,
}

impl EscrowCustody {
    pub fn open(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            locks: db.open_tree("escrow_locks")?,
            card_index: db.open_tree("escrow_card_index")?,
            ref_index: db.open_tree("escrow_ref_index")?,
        })
    }

    /// Hold the given cards for `reference`. Fails with `AlreadyLocked`
    /// before anything is written if any card sits in an open lock.
    pub fn lock(&self, reference: &str, cards: &[String]) -> Result<EscrowLock> {
        for card_id in cards {
            if self.card_index.contains_key(card_id.as_bytes())? {
                return Err(ConflictError::AlreadyLocked(card_id.clone()).into());
            }
        }

        let lock = EscrowLock {
            lock_id: short_ref("LCK"),
            reference: reference.to_string(),
            cards: cards.to_vec(),
            initiator_released: false,
            responder_released: false,
            secrets_visible_to: Vec::new(),
        };
        // lock record first, then the index entries that point at it
        self.locks
            .insert(lock.lock_id.as_bytes(), minicbor::to_vec(&lock)?)?;
        for card_id in cards {
            self.card_index
                .insert(card_id.as_bytes(), lock.lock_id.as_bytes())?;
        }
        self.ref_index
            .insert(reference.as_bytes(), lock.lock_id.as_bytes())?;
        Ok(lock)
    }

    pub fn get(&self, lock_id: &str) -> Result<EscrowLock> {
        let raw = self
            .locks
            .get(lock_id.as_bytes())?
            .ok_or_else(|| EngineError::not_found("escrow lock", lock_id))?;
        Ok(minicbor::decode(&raw)?)
    }

    pub fn find_by_reference(&self, reference: &str) -> Result<Option<EscrowLock>> {
        match self.ref_index.get(reference.as_bytes())? {
            Some(id) => {
                let lock_id = String::from_utf8_lossy(&id).to_string();
                Ok(Some(self.get(&lock_id)?))
            }
            None => Ok(None),
        }
    }

    pub fn is_card_locked(&self, card_id: &str) -> Result<bool> {
        Ok(self.card_index.contains_key(card_id.as_bytes())?)
    }

    /// Mark `side` released and grant `viewer` sight of `card_id`'s secret.
    ///
    /// Append-only: a released side stays released, and a second release of
    /// the same side fails with `AlreadyReleased` without touching the
    /// record. Callers check this before any vault fetch so a retry never
    /// re-reveals.
    pub fn release(
        &self,
        lock_id: &str,
        side: Side,
        viewer: &str,
        card_id: &str,
    ) -> Result<EscrowLock> {
        let mut lock = self.get(lock_id)?;
        if lock.released(side) {
            return Err(ConflictError::AlreadyReleased.into());
        }
        match side {
            Side::Initiator => lock.initiator_released = true,
            Side::Responder => lock.responder_released = true,
        }
        lock.secrets_visible_to.push(Visibility {
            user: viewer.to_string(),
            card_id: card_id.to_string(),
        });
        self.locks
            .insert(lock.lock_id.as_bytes(), minicbor::to_vec(&lock)?)?;
        Ok(lock)
    }

    /// Destroy the lock and free its cards. Used on cancellation and on
    /// terminal settlement; reveals nothing.
    pub fn unlock(&self, lock_id: &str) -> Result<EscrowLock> {
        let lock = self.get(lock_id)?;
        // index entries first so no card appears free while still indexed
        for card_id in &lock.cards {
            self.card_index.remove(card_id.as_bytes())?;
        }
        self.ref_index.remove(lock.reference.as_bytes())?;
        self.locks.remove(lock.lock_id.as_bytes())?;
        Ok(lock)
    }
}
