//! Trust-tier pre-check seam.
//!
//! The external reputation service decides whether a user may open another
//! trade at this value; the engine only consults, never enforces limits of
//! its own.

use crate::money::Money;

pub trait ProposalPolicy: Send + Sync {
    fn can_propose(&self, user: &str, amount: Money) -> bool;
}

/// Default policy when no trust-tier service is wired in.
pub struct AllowAll;

impl ProposalPolicy for AllowAll {
    fn can_propose(&self, _user: &str, _amount: Money) -> bool {
        true
    }
}
