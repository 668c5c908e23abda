//! Two-party swap aggregate and its lifecycle state machine.
//!
//! Every guard from the settlement contract lives in [`Trade::apply`], a
//! single transition function over an explicit event enum. Side effects
//! (ledger moves, escrow custody, timers) stay in the service layer; this
//! module only decides whether a transition is legal and mutates the
//! aggregate's own fields.

use std::fmt;

use chrono::Utc;

use crate::error::ConflictError;
use crate::escrow::Side;
use crate::money::Money;
use crate::utils::TimeStamp;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeStatus {
    #[n(0)]
    Proposed,
    #[n(1)]
    Accepted,
    #[n(2)]
    InEscrow,
    #[n(3)]
    CodesReleased,
    #[n(4)]
    Confirming,
    #[n(5)]
    Completed,
    #[n(6)]
    Cancelled,
    /// Held for manual admin resolution; never auto-resolved.
    #[n(7)]
    Disputed,
}

impl TradeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TradeStatus::Completed | TradeStatus::Cancelled | TradeStatus::Disputed
        )
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TradeStatus::Proposed => "proposed",
            TradeStatus::Accepted => "accepted",
            TradeStatus::InEscrow => "in_escrow",
            TradeStatus::CodesReleased => "codes_released",
            TradeStatus::Confirming => "confirming",
            TradeStatus::Completed => "completed",
            TradeStatus::Cancelled => "cancelled",
            TradeStatus::Disputed => "disputed",
        };
        f.write_str(s)
    }
}

/// The transitions a trade can be asked to make. Payloads carry only what
/// the pure state machine needs to decide and record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TradeEvent {
    PayFee(Side),
    Accept,
    Decline,
    Withdraw,
    EnterEscrow { lock_id: String },
    Release { both_released: bool },
    StartConfirmWindow { deadline: TimeStamp<Utc> },
    Confirm(Side),
    Dispute,
    DeadlineElapsed,
}

impl TradeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TradeEvent::PayFee(_) => "pay_fee",
            TradeEvent::Accept => "accept",
            TradeEvent::Decline => "decline",
            TradeEvent::Withdraw => "withdraw",
            TradeEvent::EnterEscrow { .. } => "enter_escrow",
            TradeEvent::Release { .. } => "release",
            TradeEvent::StartConfirmWindow { .. } => "start_confirm_window",
            TradeEvent::Confirm(_) => "confirm",
            TradeEvent::Dispute => "dispute",
            TradeEvent::DeadlineElapsed => "deadline_elapsed",
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Trade {
    #[n(0)]
    pub trade_id: String,
    #[n(1)]
    pub initiator: String,
    #[n(2)]
    pub responder: String,
    #[n(3)]
    pub initiator_card: String,
    #[n(4)]
    pub responder_card: String,
    #[n(5)]
    pub status: TradeStatus,
    /// Frozen at proposal: 5% (configurable) of each side's own card value.
    #[n(6)]
    pub initiator_fee: Money,
    #[n(7)]
    pub responder_fee: Money,
    #[n(8)]
    pub initiator_paid: bool,
    #[n(9)]
    pub responder_paid: bool,
    #[n(10)]
    pub initiator_confirmed: bool,
    #[n(11)]
    pub responder_confirmed: bool,
    #[n(12)]
    pub lock_id: Option<String>,
    #[n(13)]
    pub confirmation_deadline: Option<TimeStamp<Utc>>,
    #[n(14)]
    pub created_at: TimeStamp<Utc>,
    #[n(15)]
    pub updated_at: TimeStamp<Utc>,
}

impl Trade {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trade_id: String,
        initiator: String,
        responder: String,
        initiator_card: String,
        responder_card: String,
        initiator_fee: Money,
        responder_fee: Money,
    ) -> Self {
        let now = TimeStamp::now();
        Self {
            trade_id,
            initiator,
            responder,
            initiator_card,
            responder_card,
            status: TradeStatus::Proposed,
            initiator_fee,
            responder_fee,
            initiator_paid: false,
            responder_paid: false,
            initiator_confirmed: false,
            responder_confirmed: false,
            lock_id: None,
            confirmation_deadline: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn side_of(&self, user: &str) -> Option<Side> {
        if user == self.initiator {
            Some(Side::Initiator)
        } else if user == self.responder {
            Some(Side::Responder)
        } else {
            None
        }
    }

    pub fn user_for(&self, side: Side) -> &str {
        match side {
            Side::Initiator => &self.initiator,
            Side::Responder => &self.responder,
        }
    }

    pub fn card_for(&self, side: Side) -> &str {
        match side {
            Side::Initiator => &self.initiator_card,
            Side::Responder => &self.responder_card,
        }
    }

    pub fn fee_for(&self, side: Side) -> Money {
        match side {
            Side::Initiator => self.initiator_fee,
            Side::Responder => self.responder_fee,
        }
    }

    pub fn paid(&self, side: Side) -> bool {
        match side {
            Side::Initiator => self.initiator_paid,
            Side::Responder => self.responder_paid,
        }
    }

    pub fn both_paid(&self) -> bool {
        self.initiator_paid && self.responder_paid
    }

    pub fn confirmed(&self, side: Side) -> bool {
        match side {
            Side::Initiator => self.initiator_confirmed,
            Side::Responder => self.responder_confirmed,
        }
    }

    pub fn both_confirmed(&self) -> bool {
        self.initiator_confirmed && self.responder_confirmed
    }

    /// Validate `event` against the current state and apply the pure part
    /// of the transition. Anything that does not match a row of the
    /// transition table is an `InvalidTransition`, and the aggregate is
    /// left untouched.
    pub fn apply(&mut self, event: TradeEvent) -> Result<(), ConflictError> {
        use TradeStatus::*;

        let name = event.name();
        match (self.status, event) {
            (Proposed, TradeEvent::PayFee(side)) => {
                if self.paid(side) {
                    return Err(ConflictError::invalid("proposed (fee already paid)", name));
                }
                match side {
                    Side::Initiator => self.initiator_paid = true,
                    Side::Responder => self.responder_paid = true,
                }
            }
            (Proposed, TradeEvent::Accept) => {
                // both fees must be collected before anything locks
                if !self.both_paid() {
                    return Err(ConflictError::invalid("proposed (fees outstanding)", name));
                }
                self.status = Accepted;
            }
            (Proposed, TradeEvent::Decline) => self.status = Cancelled,
            (Proposed | Accepted, TradeEvent::Withdraw) => self.status = Cancelled,
            (Accepted, TradeEvent::EnterEscrow { lock_id }) => {
                self.lock_id = Some(lock_id);
                self.status = InEscrow;
            }
            (InEscrow, TradeEvent::Release { both_released }) => {
                if both_released {
                    self.status = CodesReleased;
                }
            }
            (CodesReleased, TradeEvent::StartConfirmWindow { deadline }) => {
                self.confirmation_deadline = Some(deadline);
                self.status = Confirming;
            }
            (Confirming, TradeEvent::Confirm(side)) => {
                if self.confirmed(side) {
                    return Err(ConflictError::invalid("confirming (already confirmed)", name));
                }
                match side {
                    Side::Initiator => self.initiator_confirmed = true,
                    Side::Responder => self.responder_confirmed = true,
                }
                if self.both_confirmed() {
                    self.status = Completed;
                }
            }
            (Confirming, TradeEvent::Dispute) => self.status = Disputed,
            (Confirming, TradeEvent::DeadlineElapsed) => {
                // silence during the window counts as mutual confirmation
                self.initiator_confirmed = true;
                self.responder_confirmed = true;
                self.status = Completed;
            }
            (state, _) => return Err(ConflictError::invalid(state, name)),
        }
        self.updated_at = TimeStamp::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposed() -> Trade {
        Trade::new(
            "TRD-TEST0001".into(),
            "user_alice".into(),
            "user_bob".into(),
            "CRD-A".into(),
            "CRD-B".into(),
            Money::from_cents(500),
            Money::from_cents(200),
        )
    }

    fn escrowed() -> Trade {
        let mut t = proposed();
        t.apply(TradeEvent::PayFee(Side::Initiator)).unwrap();
        t.apply(TradeEvent::PayFee(Side::Responder)).unwrap();
        t.apply(TradeEvent::Accept).unwrap();
        t.apply(TradeEvent::EnterEscrow { lock_id: "LCK-1".into() }).unwrap();
        t
    }

    fn confirming() -> Trade {
        let mut t = escrowed();
        t.apply(TradeEvent::Release { both_released: false }).unwrap();
        t.apply(TradeEvent::Release { both_released: true }).unwrap();
        t.apply(TradeEvent::StartConfirmWindow {
            deadline: TimeStamp::now().plus_minutes(45),
        })
        .unwrap();
        t
    }

    #[test]
    fn accept_requires_both_fees() {
        let mut t = proposed();
        let err = t.apply(TradeEvent::Accept).unwrap_err();
        assert!(matches!(err, ConflictError::InvalidTransition { .. }));
        assert_eq!(t.status, TradeStatus::Proposed);

        t.apply(TradeEvent::PayFee(Side::Initiator)).unwrap();
        assert!(t.apply(TradeEvent::Accept).is_err());

        t.apply(TradeEvent::PayFee(Side::Responder)).unwrap();
        t.apply(TradeEvent::Accept).unwrap();
        assert_eq!(t.status, TradeStatus::Accepted);
    }

    #[test]
    fn double_fee_payment_is_a_conflict() {
        let mut t = proposed();
        t.apply(TradeEvent::PayFee(Side::Initiator)).unwrap();
        assert!(t.apply(TradeEvent::PayFee(Side::Initiator)).is_err());
        assert!(t.initiator_paid && !t.responder_paid);
    }

    #[test]
    fn release_advances_only_when_both_sides_released() {
        let mut t = escrowed();
        t.apply(TradeEvent::Release { both_released: false }).unwrap();
        assert_eq!(t.status, TradeStatus::InEscrow);

        t.apply(TradeEvent::Release { both_released: true }).unwrap();
        assert_eq!(t.status, TradeStatus::CodesReleased);
    }

    #[test]
    fn both_confirmations_complete_the_trade() {
        let mut t = confirming();
        t.apply(TradeEvent::Confirm(Side::Initiator)).unwrap();
        assert_eq!(t.status, TradeStatus::Confirming);
        assert!(t.apply(TradeEvent::Confirm(Side::Initiator)).is_err());

        t.apply(TradeEvent::Confirm(Side::Responder)).unwrap();
        assert_eq!(t.status, TradeStatus::Completed);
    }

    #[test]
    fn deadline_elapsed_counts_as_mutual_confirmation() {
        let mut t = confirming();
        t.apply(TradeEvent::DeadlineElapsed).unwrap();
        assert_eq!(t.status, TradeStatus::Completed);
        assert!(t.both_confirmed());
    }

    #[test]
    fn terminal_states_accept_no_further_events() {
        for terminal in [
            {
                let mut t = confirming();
                t.apply(TradeEvent::Dispute).unwrap();
                t
            },
            {
                let mut t = proposed();
                t.apply(TradeEvent::Decline).unwrap();
                t
            },
            {
                let mut t = confirming();
                t.apply(TradeEvent::DeadlineElapsed).unwrap();
                t
            },
        ] {
            assert!(terminal.status.is_terminal());
            for event in [
                TradeEvent::PayFee(Side::Initiator),
                TradeEvent::Accept,
                TradeEvent::Decline,
                TradeEvent::Withdraw,
                TradeEvent::Release { both_released: true },
                TradeEvent::Confirm(Side::Responder),
                TradeEvent::Dispute,
                TradeEvent::DeadlineElapsed,
            ] {
                let mut copy = terminal.clone();
                assert!(copy.apply(event).is_err());
                assert_eq!(copy.status, terminal.status);
            }
        }
    }

    #[test]
    fn withdraw_allowed_from_proposed_and_accepted_only() {
        let mut t = proposed();
        t.apply(TradeEvent::Withdraw).unwrap();
        assert_eq!(t.status, TradeStatus::Cancelled);

        let mut t = escrowed();
        assert!(t.apply(TradeEvent::Withdraw).is_err());
        assert_eq!(t.status, TradeStatus::InEscrow);
    }

    #[test]
    fn dispute_only_during_confirmation_window() {
        let mut t = escrowed();
        assert!(t.apply(TradeEvent::Dispute).is_err());

        let mut t = confirming();
        t.apply(TradeEvent::Dispute).unwrap();
        assert_eq!(t.status, TradeStatus::Disputed);
    }
}
