//! Settlement engine: the orchestrating API over the trade and sale state
//! machines.
//!
//! Every operation loads the aggregate under its exclusive lock, validates
//! the requested transition through the aggregate's `apply`, performs the
//! associated side effects (ledger moves, escrow custody, deadline
//! scheduling), persists the new state and publishes a domain event.
//! Requests against the same aggregate serialize; different aggregates
//! proceed in parallel. Ledger mutations additionally take a per-user lock,
//! always acquired after the aggregate lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::card::{CardStatus, GiftCard, ListingType};
use crate::config::EngineConfig;
use crate::dispute::{Dispute, DisputeOutcome, DisputeStatus};
use crate::error::{ConflictError, EngineError, Result, ValidationError};
use crate::escrow::{EscrowCustody, EscrowLock, Side};
use crate::event::{DomainEvent, EventSink, NullSink};
use crate::ledger::{EntryReason, Ledger, LedgerEntry, PLATFORM_ACCOUNT};
use crate::money::{Money, platform_fee};
use crate::policy::{AllowAll, ProposalPolicy};
use crate::sale::{Sale, SaleEvent, SaleStatus};
use crate::scheduler::DeadlineScheduler;
use crate::trade::{Trade, TradeEvent, TradeStatus};
use crate::utils::{TimeStamp, short_ref};
use crate::vault::{CardSecret, Vault};

pub struct SettlementEngine {
    cards: sled::Tree,
    trades: sled::Tree,
    sales: sled::Tree,
    disputes: sled::Tree,
    ledger: Ledger,
    custody: EscrowCustody,
    scheduler: DeadlineScheduler,
    vault: Arc<dyn Vault>,
    policy: Arc<dyn ProposalPolicy>,
    sink: Arc<dyn EventSink>,
    config: EngineConfig,
    /// In-process registry of aggregate and per-user locks.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SettlementEngine {
    pub fn new(db: Arc<sled::Db>, vault: Arc<dyn Vault>) -> Result<Self> {
        Self::with_config(db, vault, EngineConfig::default())
    }

    pub fn with_config(
        db: Arc<sled::Db>,
        vault: Arc<dyn Vault>,
        config: EngineConfig,
    ) -> Result<Self> {
        Ok(Self {
            cards: db.open_tree("cards")?,
            trades: db.open_tree("trades")?,
            sales: db.open_tree("sales")?,
            disputes: db.open_tree("disputes")?,
            ledger: Ledger::open(&db)?,
            custody: EscrowCustody::open(&db)?,
            scheduler: DeadlineScheduler::open(&db)?,
            vault,
            policy: Arc::new(AllowAll),
            sink: Arc::new(NullSink),
            config,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Wire in the external trust-tier pre-check.
    pub fn with_policy(mut self, policy: Arc<dyn ProposalPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Wire in the notification/reputation subscriber.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    // ── lock registry ──

    /// Handles whose only owner is the registry itself are idle and safe to
    /// drop; pruning past this size keeps the map bounded by the number of
    /// aggregates actually in flight.
    const LOCK_PRUNE_THRESHOLD: usize = 1024;

    fn lock_handle(&self, key: &str) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if map.len() > Self::LOCK_PRUNE_THRESHOLD {
            map.retain(|_, handle| Arc::strong_count(handle) > 1);
        }
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn held<'a>(handle: &'a Mutex<()>) -> MutexGuard<'a, ()> {
        handle.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── store helpers ──

    fn get_card(&self, card_id: &str) -> Result<GiftCard> {
        let raw = self
            .cards
            .get(card_id.as_bytes())?
            .ok_or_else(|| EngineError::not_found("card", card_id))?;
        Ok(minicbor::decode(&raw)?)
    }

    fn put_card(&self, card: &GiftCard) -> Result<()> {
        self.cards
            .insert(card.card_id.as_bytes(), minicbor::to_vec(card)?)?;
        Ok(())
    }

    fn get_trade(&self, trade_id: &str) -> Result<Trade> {
        let raw = self
            .trades
            .get(trade_id.as_bytes())?
            .ok_or_else(|| EngineError::not_found("trade", trade_id))?;
        Ok(minicbor::decode(&raw)?)
    }

    fn put_trade(&self, trade: &Trade) -> Result<()> {
        self.trades
            .insert(trade.trade_id.as_bytes(), minicbor::to_vec(trade)?)?;
        Ok(())
    }

    fn get_sale(&self, sale_id: &str) -> Result<Sale> {
        let raw = self
            .sales
            .get(sale_id.as_bytes())?
            .ok_or_else(|| EngineError::not_found("sale", sale_id))?;
        Ok(minicbor::decode(&raw)?)
    }

    fn put_sale(&self, sale: &Sale) -> Result<()> {
        self.sales
            .insert(sale.sale_id.as_bytes(), minicbor::to_vec(sale)?)?;
        Ok(())
    }

    fn publish(&self, event: DomainEvent) {
        self.sink.publish(&event);
    }

    // ── read surface ──

    pub fn card(&self, card_id: &str) -> Result<GiftCard> {
        self.get_card(card_id)
    }

    pub fn trade(&self, trade_id: &str) -> Result<Trade> {
        self.get_trade(trade_id)
    }

    pub fn sale(&self, sale_id: &str) -> Result<Sale> {
        self.get_sale(sale_id)
    }

    pub fn dispute_for(&self, trade_id: &str) -> Result<Dispute> {
        let raw = self
            .disputes
            .get(trade_id.as_bytes())?
            .ok_or_else(|| EngineError::not_found("dispute", trade_id))?;
        Ok(minicbor::decode(&raw)?)
    }

    pub fn escrow_for(&self, reference: &str) -> Result<Option<EscrowLock>> {
        self.custody.find_by_reference(reference)
    }

    pub fn balance(&self, user: &str) -> Result<Money> {
        self.ledger.balance(user)
    }

    pub fn ledger_entries_for(&self, reference: &str) -> Result<Vec<LedgerEntry>> {
        self.ledger.entries_for(reference)
    }

    // ── wallet ──

    pub fn deposit(&self, user: &str, amount: Money) -> Result<Money> {
        let handle = self.lock_handle(&format!("user:{user}"));
        let _guard = Self::held(&handle);
        self.ledger
            .credit(user, amount, EntryReason::Deposit, "deposit")?;
        self.ledger.balance(user)
    }

    // ── card listings ──

    pub fn list_card(
        &self,
        owner: &str,
        brand: &str,
        value: Money,
        listing_type: ListingType,
        selling_price: Option<Money>,
        expiry_date: TimeStamp<Utc>,
        secret: &CardSecret,
    ) -> Result<GiftCard> {
        let card_id = short_ref("CRD");
        if matches!(listing_type, ListingType::Sell | ListingType::Both) && selling_price.is_none()
        {
            return Err(ValidationError::NoSellingPrice(card_id).into());
        }
        let handle = self.vault.store(secret)?;
        let now = TimeStamp::now();
        let card = GiftCard {
            card_id,
            owner: owner.to_string(),
            brand: brand.to_string(),
            value,
            listing_type,
            status: CardStatus::Active,
            selling_price,
            expiry_date,
            secret_handle: handle,
            created_at: now.clone(),
            updated_at: now,
        };
        self.put_card(&card)?;
        info!(card_id = %card.card_id, owner = %owner, "card listed");
        Ok(card)
    }

    /// Soft-delete an ACTIVE listing. A LOCKED card belongs to an open
    /// escrow and cannot be touched by its owner.
    pub fn remove_listing(&self, owner: &str, card_id: &str) -> Result<GiftCard> {
        let handle = self.lock_handle(card_id);
        let _guard = Self::held(&handle);

        let mut card = self.get_card(card_id)?;
        card.ensure_owned_by(owner)?;
        if card.status == CardStatus::Locked {
            return Err(ConflictError::invalid("locked", "remove_listing").into());
        }
        card.ensure_active()?;
        card.status = CardStatus::Inactive;
        card.updated_at = TimeStamp::now();
        self.put_card(&card)?;
        Ok(card)
    }

    /// Re-price an ACTIVE listing. Open sales keep the amount frozen at
    /// their creation; only future sales see the new price.
    pub fn set_selling_price(&self, owner: &str, card_id: &str, price: Money) -> Result<GiftCard> {
        let handle = self.lock_handle(card_id);
        let _guard = Self::held(&handle);

        let mut card = self.get_card(card_id)?;
        card.ensure_owned_by(owner)?;
        if card.status == CardStatus::Locked {
            return Err(ConflictError::invalid("locked", "set_selling_price").into());
        }
        card.ensure_active()?;
        card.selling_price = Some(price);
        card.updated_at = TimeStamp::now();
        self.put_card(&card)?;
        Ok(card)
    }

    /// A card owner's view of their own secret, including a card they just
    /// won through a completed swap or purchase.
    pub fn card_secret(&self, caller: &str, card_id: &str) -> Result<CardSecret> {
        let card = self.get_card(card_id)?;
        card.ensure_owned_by(caller)?;
        self.vault.reveal(&card.secret_handle)
    }

    // ── trade lifecycle ──

    pub fn propose_trade(
        &self,
        initiator: &str,
        initiator_card: &str,
        responder_card: &str,
    ) -> Result<Trade> {
        let now = TimeStamp::now();
        if initiator_card == responder_card {
            return Err(ValidationError::SameCard.into());
        }
        let own = self.get_card(initiator_card)?;
        let theirs = self.get_card(responder_card)?;

        own.ensure_owned_by(initiator)?;
        if theirs.owner == initiator {
            return Err(ValidationError::SelfTrade.into());
        }
        if !own.swappable() {
            return Err(ValidationError::WrongListingType(own.card_id).into());
        }
        if !theirs.swappable() {
            return Err(ValidationError::WrongListingType(theirs.card_id).into());
        }
        own.ensure_tradeable(&now)?;
        theirs.ensure_tradeable(&now)?;

        if !self.policy.can_propose(initiator, own.value) {
            return Err(ValidationError::PolicyRejected(initiator.to_string()).into());
        }

        let trade = Trade::new(
            short_ref("TRD"),
            initiator.to_string(),
            theirs.owner.clone(),
            own.card_id.clone(),
            theirs.card_id.clone(),
            platform_fee(own.value, self.config.fee_bps),
            platform_fee(theirs.value, self.config.fee_bps),
        );
        self.put_trade(&trade)?;
        info!(
            trade_id = %trade.trade_id,
            initiator = %trade.initiator,
            responder = %trade.responder,
            "trade proposed"
        );
        self.publish(DomainEvent::TradeProposed {
            trade_id: trade.trade_id.clone(),
            initiator: trade.initiator.clone(),
            responder: trade.responder.clone(),
        });
        Ok(trade)
    }

    /// Debit the caller's side of the platform fee. Both fees must be on
    /// the books before the responder can accept.
    pub fn pay_trade_fee(&self, trade_id: &str, user: &str) -> Result<Trade> {
        let handle = self.lock_handle(trade_id);
        let _guard = Self::held(&handle);

        let mut trade = self.get_trade(trade_id)?;
        let side = trade
            .side_of(user)
            .ok_or_else(|| ValidationError::NotParticipant(user.to_string()))?;
        trade.apply(TradeEvent::PayFee(side))?;
        {
            let user_handle = self.lock_handle(&format!("user:{user}"));
            let _user_guard = Self::held(&user_handle);
            self.ledger
                .debit(user, trade.fee_for(side), EntryReason::FeeDebit, trade_id)?;
        }
        self.put_trade(&trade)?;
        info!(trade_id = %trade_id, user = %user, fee = %trade.fee_for(side), "trade fee paid");
        self.publish(DomainEvent::TradeFeePaid {
            trade_id: trade_id.to_string(),
            user: user.to_string(),
        });
        Ok(trade)
    }

    /// Responder accepts. Escrow entry is automatic: once acceptance and
    /// both fee payments hold, the cards lock in the same operation — there
    /// is no window where two committed parties wait on a third step. Any
    /// failure (a card went inactive, or is held elsewhere) aborts the
    /// whole acceptance and the trade stays PROPOSED.
    pub fn accept_trade(&self, trade_id: &str, caller: &str) -> Result<Trade> {
        let handle = self.lock_handle(trade_id);
        let _guard = Self::held(&handle);

        let mut trade = self.get_trade(trade_id)?;
        if caller != trade.responder {
            return Err(ValidationError::NotResponder.into());
        }
        trade.apply(TradeEvent::Accept)?;

        // both card locks, sorted, held through the whole escrow entry so
        // two acceptances sharing a card cannot both see it free. The two
        // ids are distinct (checked at proposal).
        let mut card_keys = [trade.initiator_card.clone(), trade.responder_card.clone()];
        card_keys.sort();
        let first = self.lock_handle(&card_keys[0]);
        let _first_guard = Self::held(&first);
        let second = self.lock_handle(&card_keys[1]);
        let _second_guard = Self::held(&second);

        let now = TimeStamp::now();
        let mut own = self.get_card(&trade.initiator_card)?;
        let mut theirs = self.get_card(&trade.responder_card)?;
        own.ensure_tradeable(&now)?;
        theirs.ensure_tradeable(&now)?;

        own.status = CardStatus::Locked;
        own.updated_at = now.clone();
        theirs.status = CardStatus::Locked;
        theirs.updated_at = now;
        let own_bytes = minicbor::to_vec(&own)?;
        let theirs_bytes = minicbor::to_vec(&theirs)?;

        // lock record first, then the card rows: a crash can leave an
        // unreferenced lock but never a LOCKED card without its lock
        let lock = self.custody.lock(
            &trade.trade_id,
            &[own.card_id.clone(), theirs.card_id.clone()],
        )?;
        let mut batch = sled::Batch::default();
        batch.insert(own.card_id.as_bytes(), own_bytes);
        batch.insert(theirs.card_id.as_bytes(), theirs_bytes);
        if let Err(err) = self.cards.apply_batch(batch) {
            // undo the custody hold so the cards do not stay unescrowable
            if let Err(unwind) = self.custody.unlock(&lock.lock_id) {
                warn!(trade_id = %trade_id, error = %unwind, "failed to unwind escrow lock");
            }
            return Err(err.into());
        }

        let entered = trade
            .apply(TradeEvent::EnterEscrow {
                lock_id: lock.lock_id.clone(),
            })
            .map_err(EngineError::from)
            .and_then(|()| self.put_trade(&trade));
        if let Err(err) = entered {
            if let Err(unwind) = self.unlock_to_active(&lock.lock_id) {
                warn!(trade_id = %trade_id, error = %unwind, "failed to unwind escrow lock");
            }
            return Err(err);
        }
        info!(trade_id = %trade_id, lock_id = %lock.lock_id, "trade accepted, cards in escrow");
        self.publish(DomainEvent::TradeAccepted {
            trade_id: trade_id.to_string(),
        });
        self.publish(DomainEvent::EscrowLocked {
            reference: trade_id.to_string(),
            lock_id: lock.lock_id,
        });
        Ok(trade)
    }

    pub fn decline_trade(&self, trade_id: &str, caller: &str) -> Result<Trade> {
        let handle = self.lock_handle(trade_id);
        let _guard = Self::held(&handle);

        let mut trade = self.get_trade(trade_id)?;
        if caller != trade.responder {
            return Err(ValidationError::NotResponder.into());
        }
        trade.apply(TradeEvent::Decline)?;
        self.refund_paid_fees(&trade)?;
        self.put_trade(&trade)?;
        info!(trade_id = %trade_id, "trade declined");
        self.publish(DomainEvent::TradeCancelled {
            trade_id: trade_id.to_string(),
        });
        Ok(trade)
    }

    pub fn withdraw_trade(&self, trade_id: &str, caller: &str) -> Result<Trade> {
        let handle = self.lock_handle(trade_id);
        let _guard = Self::held(&handle);

        let mut trade = self.get_trade(trade_id)?;
        if caller != trade.initiator {
            return Err(ValidationError::NotInitiator.into());
        }
        trade.apply(TradeEvent::Withdraw)?;
        self.refund_paid_fees(&trade)?;
        self.put_trade(&trade)?;
        info!(trade_id = %trade_id, "trade withdrawn");
        self.publish(DomainEvent::TradeCancelled {
            trade_id: trade_id.to_string(),
        });
        Ok(trade)
    }

    /// Release the caller's side of the escrow, revealing their card's
    /// secret to the counterparty only. Irreversible per side; repeating
    /// the call is a no-op that never re-fetches the secret. When the
    /// second side releases, the confirmation window opens and its deadline
    /// is scheduled.
    pub fn release_codes(&self, trade_id: &str, caller: &str) -> Result<Trade> {
        let handle = self.lock_handle(trade_id);
        let _guard = Self::held(&handle);

        let mut trade = self.get_trade(trade_id)?;
        let side = trade
            .side_of(caller)
            .ok_or_else(|| ValidationError::NotParticipant(caller.to_string()))?;
        if !matches!(
            trade.status,
            TradeStatus::InEscrow | TradeStatus::CodesReleased | TradeStatus::Confirming
        ) {
            return Err(ConflictError::invalid(trade.status, "release").into());
        }
        let lock_id = trade
            .lock_id
            .clone()
            .ok_or_else(|| EngineError::Corrupt(format!("trade {trade_id} escrowed without lock")))?;

        if self.custody.get(&lock_id)?.released(side) {
            debug!(trade_id = %trade_id, user = %caller, "repeat release ignored");
            return Ok(trade);
        }

        // prove the vault can serve this secret before anything persists;
        // a vault timeout aborts the release with nothing revealed
        let card = self.get_card(trade.card_for(side))?;
        self.vault.reveal(&card.secret_handle)?;

        let counterparty = trade.user_for(side.other()).to_string();
        let lock = self
            .custody
            .release(&lock_id, side, &counterparty, &card.card_id)?;
        trade.apply(TradeEvent::Release {
            both_released: lock.both_released(),
        })?;

        if lock.both_released() {
            let deadline = TimeStamp::now().plus_minutes(self.config.confirmation_window_mins);
            trade.apply(TradeEvent::StartConfirmWindow {
                deadline: deadline.clone(),
            })?;
            self.scheduler.schedule(&trade.trade_id, &deadline)?;
            self.put_trade(&trade)?;
            info!(trade_id = %trade_id, "both sides released, confirmation window open");
            self.publish(DomainEvent::CodesReleased {
                trade_id: trade_id.to_string(),
                deadline,
            });
        } else {
            self.put_trade(&trade)?;
            info!(trade_id = %trade_id, user = %caller, "one side released");
        }
        Ok(trade)
    }

    /// The counterparty's view of a secret released to them while the
    /// escrow is open.
    pub fn escrowed_code(&self, reference: &str, caller: &str) -> Result<CardSecret> {
        let lock = self
            .custody
            .find_by_reference(reference)?
            .ok_or_else(|| EngineError::not_found("escrow lock", reference))?;
        let grant = lock
            .secrets_visible_to
            .iter()
            .find(|v| v.user == caller)
            .ok_or_else(|| ValidationError::NotParticipant(caller.to_string()))?;
        let card = self.get_card(&grant.card_id)?;
        self.vault.reveal(&card.secret_handle)
    }

    pub fn confirm_trade(&self, trade_id: &str, caller: &str) -> Result<Trade> {
        let handle = self.lock_handle(trade_id);
        let _guard = Self::held(&handle);

        let mut trade = self.get_trade(trade_id)?;
        let side = trade
            .side_of(caller)
            .ok_or_else(|| ValidationError::NotParticipant(caller.to_string()))?;
        trade.apply(TradeEvent::Confirm(side))?;

        if trade.status == TradeStatus::Completed {
            self.finalize_swap(&trade)?;
            self.put_trade(&trade)?;
            info!(trade_id = %trade_id, "trade completed, both parties confirmed");
            self.publish(DomainEvent::TradeCompleted {
                trade_id: trade_id.to_string(),
            });
        } else {
            self.put_trade(&trade)?;
            info!(trade_id = %trade_id, user = %caller, "one party confirmed");
        }
        Ok(trade)
    }

    /// File a dispute during the confirmation window. Both cards stay
    /// LOCKED, nothing is refunded, and no timeout will ever resolve the
    /// trade; only an admin's `resolve_dispute` can.
    pub fn dispute_trade(&self, trade_id: &str, caller: &str, reason: &str) -> Result<Trade> {
        let handle = self.lock_handle(trade_id);
        let _guard = Self::held(&handle);

        let mut trade = self.get_trade(trade_id)?;
        if trade.side_of(caller).is_none() {
            return Err(ValidationError::NotParticipant(caller.to_string()).into());
        }
        if reason.trim().is_empty() {
            return Err(ValidationError::EmptyDisputeReason.into());
        }
        trade.apply(TradeEvent::Dispute)?;

        let dispute = Dispute::new(
            short_ref("DSP"),
            trade_id.to_string(),
            caller.to_string(),
            reason.trim().to_string(),
        );
        self.disputes
            .insert(trade_id.as_bytes(), minicbor::to_vec(&dispute)?)?;
        self.scheduler.cancel(trade_id)?;
        self.put_trade(&trade)?;
        warn!(trade_id = %trade_id, raised_by = %caller, "trade disputed, cards frozen");
        self.publish(DomainEvent::TradeDisputed {
            trade_id: trade_id.to_string(),
            raised_by: caller.to_string(),
        });
        Ok(trade)
    }

    /// Manual admin resolution of a disputed trade. `Finalize` settles the
    /// swap as if both parties had confirmed; `Reverse` returns each card
    /// to its owner and refunds the fees.
    pub fn resolve_dispute(
        &self,
        trade_id: &str,
        admin: &str,
        outcome: DisputeOutcome,
        note: &str,
    ) -> Result<Dispute> {
        let handle = self.lock_handle(trade_id);
        let _guard = Self::held(&handle);

        let trade = self.get_trade(trade_id)?;
        if trade.status != TradeStatus::Disputed {
            return Err(ConflictError::invalid(trade.status, "resolve_dispute").into());
        }
        let mut dispute = self.dispute_for(trade_id)?;
        if dispute.status == DisputeStatus::Resolved {
            return Err(ConflictError::invalid("disputed (already resolved)", "resolve_dispute").into());
        }

        match outcome {
            DisputeOutcome::Finalize => self.finalize_swap(&trade)?,
            DisputeOutcome::Reverse => {
                let lock_id = trade.lock_id.clone().ok_or_else(|| {
                    EngineError::Corrupt(format!("disputed trade {trade_id} without lock"))
                })?;
                self.unlock_to_active(&lock_id)?;
                self.refund_paid_fees(&trade)?;
            }
        }

        dispute.status = DisputeStatus::Resolved;
        dispute.resolved_by = Some(admin.to_string());
        dispute.resolution = Some(note.to_string());
        self.disputes
            .insert(trade_id.as_bytes(), minicbor::to_vec(&dispute)?)?;
        info!(trade_id = %trade_id, admin = %admin, ?outcome, "dispute resolved");
        self.publish(DomainEvent::DisputeResolved {
            trade_id: trade_id.to_string(),
            finalized: outcome == DisputeOutcome::Finalize,
        });
        Ok(dispute)
    }

    /// The deadline sweep. Each due trade is re-checked under its own
    /// aggregate lock: if it is still CONFIRMING its silence counts as
    /// mutual confirmation; if a user's confirm/dispute committed first,
    /// the fire observes the changed state and is consumed as a no-op.
    /// Returns the ids that were finalized.
    pub fn finalize_due(&self, now: &TimeStamp<Utc>) -> Result<Vec<String>> {
        let mut finalized = Vec::new();
        for trade_id in self.scheduler.due(now)? {
            let handle = self.lock_handle(&trade_id);
            let _guard = Self::held(&handle);

            let mut trade = match self.get_trade(&trade_id) {
                Ok(trade) => trade,
                Err(EngineError::NotFound { .. }) => {
                    self.scheduler.cancel(&trade_id)?;
                    continue;
                }
                Err(err) => return Err(err),
            };
            if trade.status == TradeStatus::Confirming {
                trade.apply(TradeEvent::DeadlineElapsed)?;
                self.finalize_swap(&trade)?;
                self.put_trade(&trade)?;
                info!(trade_id = %trade_id, "confirmation window elapsed, auto-finalized");
                self.publish(DomainEvent::TradeCompleted {
                    trade_id: trade_id.clone(),
                });
                finalized.push(trade_id);
            } else {
                warn!(trade_id = %trade_id, status = %trade.status, "stale deadline ignored");
                self.scheduler.cancel(&trade_id)?;
            }
        }
        Ok(finalized)
    }

    /// The expiry sweep over the listings: ACTIVE cards past their expiry
    /// date are marked EXPIRED and drop out of the market. Cards held by an
    /// open escrow are left to their trade's own settlement. Returns the
    /// ids that were retired.
    pub fn expire_due(&self, now: &TimeStamp<Utc>) -> Result<Vec<String>> {
        let mut expired = Vec::new();
        for item in self.cards.iter() {
            let (_, raw) = item?;
            let seen: GiftCard = minicbor::decode(&raw)?;
            if seen.status != CardStatus::Active || !seen.is_expired(now) {
                continue;
            }
            // re-check under the card lock; an acceptance may have won
            let handle = self.lock_handle(&seen.card_id);
            let _guard = Self::held(&handle);
            let mut card = self.get_card(&seen.card_id)?;
            if card.status == CardStatus::Active && card.is_expired(now) {
                card.status = CardStatus::Expired;
                card.updated_at = TimeStamp::now();
                self.put_card(&card)?;
                info!(card_id = %card.card_id, "listing expired");
                expired.push(card.card_id);
            }
        }
        Ok(expired)
    }

    /// Completed-trade side effects: each card changes hands and is marked
    /// TRADED, the escrow lock is destroyed, the deadline consumed, and the
    /// collected fees become platform revenue.
    fn finalize_swap(&self, trade: &Trade) -> Result<()> {
        let lock_id = trade.lock_id.as_ref().ok_or_else(|| {
            EngineError::Corrupt(format!("trade {} completed without lock", trade.trade_id))
        })?;
        self.custody.get(lock_id)?;

        let now = TimeStamp::now();
        let mut own = self.get_card(&trade.initiator_card)?;
        let mut theirs = self.get_card(&trade.responder_card)?;
        for card in [&own, &theirs] {
            if card.status != CardStatus::Locked {
                return Err(EngineError::Corrupt(format!(
                    "escrow lock {} held non-locked card {}",
                    lock_id, card.card_id
                )));
            }
        }

        own.owner = trade.responder.clone();
        own.status = CardStatus::Traded;
        own.updated_at = now.clone();
        theirs.owner = trade.initiator.clone();
        theirs.status = CardStatus::Traded;
        theirs.updated_at = now;
        let mut batch = sled::Batch::default();
        batch.insert(own.card_id.as_bytes(), minicbor::to_vec(&own)?);
        batch.insert(theirs.card_id.as_bytes(), minicbor::to_vec(&theirs)?);
        self.cards.apply_batch(batch)?;

        self.custody.unlock(lock_id)?;
        self.scheduler.cancel(&trade.trade_id)?;

        let consumed = trade
            .initiator_fee
            .checked_add(trade.responder_fee)
            .ok_or_else(|| EngineError::Corrupt("fee total overflow".into()))?;
        if consumed > Money::ZERO {
            let platform_handle = self.lock_handle(&format!("user:{PLATFORM_ACCOUNT}"));
            let _platform_guard = Self::held(&platform_handle);
            self.ledger.credit(
                PLATFORM_ACCOUNT,
                consumed,
                EntryReason::FeeCredit,
                &trade.trade_id,
            )?;
        }
        Ok(())
    }

    fn refund_paid_fees(&self, trade: &Trade) -> Result<()> {
        for side in [Side::Initiator, Side::Responder] {
            if trade.paid(side) {
                let user = trade.user_for(side);
                let user_handle = self.lock_handle(&format!("user:{user}"));
                let _user_guard = Self::held(&user_handle);
                self.ledger.credit(
                    user,
                    trade.fee_for(side),
                    EntryReason::Refund,
                    &trade.trade_id,
                )?;
            }
        }
        Ok(())
    }

    /// Cancellation path: destroy the lock and return its cards to ACTIVE
    /// without revealing anything.
    fn unlock_to_active(&self, lock_id: &str) -> Result<()> {
        let lock = self.custody.get(lock_id)?;
        let now = TimeStamp::now();
        let mut cards = Vec::with_capacity(lock.cards.len());
        for card_id in &lock.cards {
            let card = self.get_card(card_id)?;
            if card.status != CardStatus::Locked {
                return Err(EngineError::Corrupt(format!(
                    "escrow lock {} held non-locked card {}",
                    lock_id, card_id
                )));
            }
            cards.push(card);
        }
        self.custody.unlock(lock_id)?;
        let mut batch = sled::Batch::default();
        for mut card in cards {
            card.status = CardStatus::Active;
            card.updated_at = now.clone();
            batch.insert(card.card_id.as_bytes(), minicbor::to_vec(&card)?);
        }
        self.cards.apply_batch(batch)?;
        Ok(())
    }

    // ── sale lifecycle ──

    /// Open a purchase against a Sell/Both listing. The amount and the
    /// platform fee freeze here; later price edits on the card do not
    /// reach an open sale.
    pub fn create_sale(&self, buyer: &str, card_id: &str) -> Result<Sale> {
        let now = TimeStamp::now();
        let card = self.get_card(card_id)?;
        if card.owner == buyer {
            return Err(ValidationError::SelfTrade.into());
        }
        if !card.sellable() {
            return Err(ValidationError::WrongListingType(card.card_id).into());
        }
        card.ensure_tradeable(&now)?;
        let amount = card
            .selling_price
            .ok_or_else(|| ValidationError::NoSellingPrice(card.card_id.clone()))?;

        let sale = Sale::new(
            short_ref("SAL"),
            buyer.to_string(),
            card.owner.clone(),
            card.card_id,
            amount,
            platform_fee(amount, self.config.fee_bps),
        );
        self.put_sale(&sale)?;
        info!(sale_id = %sale.sale_id, buyer = %buyer, seller = %sale.seller, "sale created");
        self.publish(DomainEvent::SaleCreated {
            sale_id: sale.sale_id.clone(),
            buyer: sale.buyer.clone(),
            seller: sale.seller.clone(),
        });
        Ok(sale)
    }

    /// Seller commits: the card enters single-sided escrow awaiting the
    /// buyer's payment.
    pub fn confirm_sale(&self, sale_id: &str, caller: &str) -> Result<Sale> {
        let handle = self.lock_handle(sale_id);
        let _guard = Self::held(&handle);

        let mut sale = self.get_sale(sale_id)?;
        if caller != sale.seller {
            return Err(ValidationError::NotSeller.into());
        }
        if sale.status != SaleStatus::Pending {
            return Err(ConflictError::invalid(sale.status, "confirm").into());
        }

        // card lock held through the escrow entry, serializing against any
        // racing acceptance that wants the same card
        let card_handle = self.lock_handle(&sale.card_id);
        let _card_guard = Self::held(&card_handle);

        let now = TimeStamp::now();
        let mut card = self.get_card(&sale.card_id)?;
        card.ensure_tradeable(&now)?;

        card.status = CardStatus::Locked;
        card.updated_at = now;
        let card_bytes = minicbor::to_vec(&card)?;

        let lock = self.custody.lock(&sale.sale_id, &[card.card_id.clone()])?;
        if let Err(err) = self.cards.insert(card.card_id.as_bytes(), card_bytes) {
            if let Err(unwind) = self.custody.unlock(&lock.lock_id) {
                warn!(sale_id = %sale_id, error = %unwind, "failed to unwind escrow lock");
            }
            return Err(err.into());
        }

        let entered = sale
            .apply(SaleEvent::Confirm {
                lock_id: lock.lock_id.clone(),
            })
            .map_err(EngineError::from)
            .and_then(|()| self.put_sale(&sale));
        if let Err(err) = entered {
            if let Err(unwind) = self.unlock_to_active(&lock.lock_id) {
                warn!(sale_id = %sale_id, error = %unwind, "failed to unwind escrow lock");
            }
            return Err(err);
        }
        info!(sale_id = %sale_id, lock_id = %lock.lock_id, "sale confirmed, card in escrow");
        self.publish(DomainEvent::SaleAccepted {
            sale_id: sale_id.to_string(),
        });
        self.publish(DomainEvent::EscrowLocked {
            reference: sale_id.to_string(),
            lock_id: lock.lock_id,
        });
        Ok(sale)
    }

    /// The payment gateway's capture callback, matched to its sale by id.
    pub fn payment_captured(&self, sale_id: &str) -> Result<Sale> {
        let handle = self.lock_handle(sale_id);
        let _guard = Self::held(&handle);

        let mut sale = self.get_sale(sale_id)?;
        if sale.status != SaleStatus::Accepted {
            return Err(ConflictError::invalid(sale.status, "payment_captured").into());
        }
        self.complete_sale(&mut sale)
    }

    /// Wallet-funded alternative to the gateway: debit the buyer's balance
    /// and settle in the same motion.
    pub fn pay_sale_from_wallet(&self, sale_id: &str, caller: &str) -> Result<Sale> {
        let handle = self.lock_handle(sale_id);
        let _guard = Self::held(&handle);

        let mut sale = self.get_sale(sale_id)?;
        if caller != sale.buyer {
            return Err(ValidationError::NotBuyer.into());
        }
        if sale.status != SaleStatus::Accepted {
            return Err(ConflictError::invalid(sale.status, "pay_from_wallet").into());
        }

        // prove the sale can settle before any money moves; a vault outage
        // here must leave the buyer's balance untouched
        let card = self.get_card(&sale.card_id)?;
        if card.status != CardStatus::Locked {
            return Err(EngineError::Corrupt(format!(
                "sale {} accepted with non-locked card {}",
                sale_id, card.card_id
            )));
        }
        self.vault.reveal(&card.secret_handle)?;

        {
            let user_handle = self.lock_handle(&format!("user:{caller}"));
            let _user_guard = Self::held(&user_handle);
            self.ledger
                .debit(caller, sale.amount, EntryReason::SaleDebit, sale_id)?;
        }
        match self.complete_sale(&mut sale) {
            Ok(done) => Ok(done),
            Err(err) => {
                // hand the money back; the sale stays ACCEPTED for a retry
                let user_handle = self.lock_handle(&format!("user:{caller}"));
                let _user_guard = Self::held(&user_handle);
                if let Err(refund) =
                    self.ledger
                        .credit(caller, sale.amount, EntryReason::Refund, sale_id)
                {
                    warn!(sale_id = %sale_id, error = %refund, "failed to refund wallet debit");
                }
                Err(err)
            }
        }
    }

    fn complete_sale(&self, sale: &mut Sale) -> Result<Sale> {
        let lock_id = sale.lock_id.clone().ok_or_else(|| {
            EngineError::Corrupt(format!("sale {} accepted without lock", sale.sale_id))
        })?;
        let mut card = self.get_card(&sale.card_id)?;
        if card.status != CardStatus::Locked {
            return Err(EngineError::Corrupt(format!(
                "escrow lock {} held non-locked card {}",
                lock_id, card.card_id
            )));
        }
        // abort before any money moves if the vault cannot serve the secret
        self.vault.reveal(&card.secret_handle)?;

        self.custody
            .release(&lock_id, Side::Initiator, &sale.buyer, &card.card_id)?;
        self.custody.unlock(&lock_id)?;

        {
            let seller_handle = self.lock_handle(&format!("user:{}", sale.seller));
            let _seller_guard = Self::held(&seller_handle);
            self.ledger.credit(
                &sale.seller,
                sale.seller_proceeds(),
                EntryReason::SaleCredit,
                &sale.sale_id,
            )?;
        }
        if sale.platform_fee > Money::ZERO {
            let platform_handle = self.lock_handle(&format!("user:{PLATFORM_ACCOUNT}"));
            let _platform_guard = Self::held(&platform_handle);
            self.ledger.credit(
                PLATFORM_ACCOUNT,
                sale.platform_fee,
                EntryReason::FeeCredit,
                &sale.sale_id,
            )?;
        }

        card.owner = sale.buyer.clone();
        card.status = CardStatus::Sold;
        card.updated_at = TimeStamp::now();
        self.put_card(&card)?;

        sale.apply(SaleEvent::PaymentCaptured)?;
        self.put_sale(sale)?;
        info!(sale_id = %sale.sale_id, "sale completed, code released to buyer");
        self.publish(DomainEvent::SaleCompleted {
            sale_id: sale.sale_id.clone(),
        });
        Ok(sale.clone())
    }

    /// The gateway's failure callback; releases the card back to its
    /// listing.
    pub fn payment_failed(&self, sale_id: &str) -> Result<Sale> {
        let handle = self.lock_handle(sale_id);
        let _guard = Self::held(&handle);

        let mut sale = self.get_sale(sale_id)?;
        sale.apply(SaleEvent::PaymentFailed)?;
        if let Some(lock_id) = sale.lock_id.clone() {
            self.unlock_to_active(&lock_id)?;
        }
        self.put_sale(&sale)?;
        warn!(sale_id = %sale_id, "payment failed, sale cancelled");
        self.publish(DomainEvent::SaleCancelled {
            sale_id: sale_id.to_string(),
        });
        Ok(sale)
    }

    /// Buyer or seller backs out before capture. No funds have moved, so
    /// cancellation only frees the card.
    pub fn cancel_sale(&self, sale_id: &str, caller: &str) -> Result<Sale> {
        let handle = self.lock_handle(sale_id);
        let _guard = Self::held(&handle);

        let mut sale = self.get_sale(sale_id)?;
        if !sale.is_party(caller) {
            return Err(ValidationError::NotParticipant(caller.to_string()).into());
        }
        sale.apply(SaleEvent::Cancel)?;
        if let Some(lock_id) = sale.lock_id.clone() {
            self.unlock_to_active(&lock_id)?;
        }
        self.put_sale(&sale)?;
        info!(sale_id = %sale_id, by = %caller, "sale cancelled");
        self.publish(DomainEvent::SaleCancelled {
            sale_id: sale_id.to_string(),
        });
        Ok(sale)
    }
}
