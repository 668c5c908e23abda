//! Domain events published after each committed transition.
//!
//! Delivery is entirely the subscriber's concern (notifications, reputation
//! scoring); the engine publishes after the new state has persisted and
//! never waits on a subscriber.

use std::sync::Mutex;

use chrono::Utc;

use crate::utils::TimeStamp;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    TradeProposed {
        trade_id: String,
        initiator: String,
        responder: String,
    },
    TradeFeePaid {
        trade_id: String,
        user: String,
    },
    TradeAccepted {
        trade_id: String,
    },
    EscrowLocked {
        reference: String,
        lock_id: String,
    },
    /// Both sides have released; the confirmation window is open.
    CodesReleased {
        trade_id: String,
        deadline: TimeStamp<Utc>,
    },
    TradeCompleted {
        trade_id: String,
    },
    TradeCancelled {
        trade_id: String,
    },
    TradeDisputed {
        trade_id: String,
        raised_by: String,
    },
    DisputeResolved {
        trade_id: String,
        finalized: bool,
    },
    SaleCreated {
        sale_id: String,
        buyer: String,
        seller: String,
    },
    SaleAccepted {
        sale_id: String,
    },
    SaleCompleted {
        sale_id: String,
    },
    SaleCancelled {
        sale_id: String,
    },
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: &DomainEvent);
}

/// Drops everything on the floor.
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: &DomainEvent) {}
}

/// Buffers events in memory; the test double for a notification dispatcher.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<DomainEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<DomainEvent> {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *events)
    }
}

impl EventSink for MemorySink {
    fn publish(&self, event: &DomainEvent) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.push(event.clone());
    }
}
