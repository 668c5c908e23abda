//! One-way purchase aggregate.
//!
//! Deliberately separate from [`crate::trade`]: money flows one way and
//! only one secret is ever revealed, so the buyer's captured payment (not a
//! mutual confirmation window) is the trust anchor that drives completion.

use std::fmt;

use chrono::Utc;

use crate::error::ConflictError;
use crate::money::Money;
use crate::utils::TimeStamp;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaleStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Accepted,
    #[n(2)]
    Completed,
    #[n(3)]
    Cancelled,
}

impl SaleStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SaleStatus::Completed | SaleStatus::Cancelled)
    }
}

impl fmt::Display for SaleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SaleStatus::Pending => "pending",
            SaleStatus::Accepted => "accepted",
            SaleStatus::Completed => "completed",
            SaleStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaleEvent {
    /// Seller confirms; the card enters single-sided escrow.
    Confirm { lock_id: String },
    /// The payment gateway (or wallet debit) captured the buyer's money.
    PaymentCaptured,
    PaymentFailed,
    Cancel,
}

impl SaleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SaleEvent::Confirm { .. } => "confirm",
            SaleEvent::PaymentCaptured => "payment_captured",
            SaleEvent::PaymentFailed => "payment_failed",
            SaleEvent::Cancel => "cancel",
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Sale {
    #[n(0)]
    pub sale_id: String,
    #[n(1)]
    pub buyer: String,
    #[n(2)]
    pub seller: String,
    #[n(3)]
    pub card_id: String,
    /// The card's selling price at purchase time. Frozen: later price edits
    /// on the listing do not touch an open sale.
    #[n(4)]
    pub amount: Money,
    #[n(5)]
    pub platform_fee: Money,
    #[n(6)]
    pub status: SaleStatus,
    #[n(7)]
    pub lock_id: Option<String>,
    #[n(8)]
    pub code_revealed: bool,
    #[n(9)]
    pub created_at: TimeStamp<Utc>,
    #[n(10)]
    pub updated_at: TimeStamp<Utc>,
}

impl Sale {
    pub fn new(
        sale_id: String,
        buyer: String,
        seller: String,
        card_id: String,
        amount: Money,
        platform_fee: Money,
    ) -> Self {
        let now = TimeStamp::now();
        Self {
            sale_id,
            buyer,
            seller,
            card_id,
            amount,
            platform_fee,
            status: SaleStatus::Pending,
            lock_id: None,
            code_revealed: false,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// What the seller receives once payment is captured.
    pub fn seller_proceeds(&self) -> Money {
        self.amount.checked_sub(self.platform_fee).unwrap_or(Money::ZERO)
    }

    pub fn is_party(&self, user: &str) -> bool {
        user == self.buyer || user == self.seller
    }

    /// Single transition function mirroring [`crate::trade::Trade::apply`].
    pub fn apply(&mut self, event: SaleEvent) -> Result<(), ConflictError> {
        use SaleStatus::*;

        let name = event.name();
        match (self.status, event) {
            (Pending, SaleEvent::Confirm { lock_id }) => {
                self.lock_id = Some(lock_id);
                self.status = Accepted;
            }
            (Accepted, SaleEvent::PaymentCaptured) => {
                self.code_revealed = true;
                self.status = Completed;
            }
            (Accepted, SaleEvent::PaymentFailed) => self.status = Cancelled,
            (Pending | Accepted, SaleEvent::Cancel) => self.status = Cancelled,
            (state, _) => return Err(ConflictError::invalid(state, name)),
        }
        self.updated_at = TimeStamp::now();
        Ok(())
    }
}
