//! Dispute records held for manual admin resolution.

use chrono::Utc;

use crate::utils::TimeStamp;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisputeStatus {
    #[n(0)]
    Open,
    #[n(1)]
    Resolved,
}

/// How an admin settled a disputed trade. There is no automatic path; a
/// dispute stays open until a human picks one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisputeOutcome {
    /// The codes were good: settle as if both parties confirmed.
    Finalize,
    /// The codes were bad: return cards to their owners and refund fees.
    Reverse,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Dispute {
    #[n(0)]
    pub dispute_id: String,
    #[n(1)]
    pub trade_id: String,
    #[n(2)]
    pub raised_by: String,
    #[n(3)]
    pub reason: String,
    #[n(4)]
    pub status: DisputeStatus,
    #[n(5)]
    pub resolved_by: Option<String>,
    #[n(6)]
    pub resolution: Option<String>,
    #[n(7)]
    pub created_at: TimeStamp<Utc>,
}

impl Dispute {
    pub fn new(dispute_id: String, trade_id: String, raised_by: String, reason: String) -> Self {
        Self {
            dispute_id,
            trade_id,
            raised_by,
            reason,
            status: DisputeStatus::Open,
            resolved_by: None,
            resolution: None,
            created_at: TimeStamp::now(),
        }
    }
}
