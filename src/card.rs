//! Gift card listing model.

use chrono::Utc;

use crate::error::ValidationError;
use crate::money::Money;
use crate::utils::TimeStamp;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingType {
    #[n(0)]
    Swap,
    #[n(1)]
    Sell,
    #[n(2)]
    Both,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardStatus {
    #[n(0)]
    Active,
    /// Held by exactly one open escrow; owner edits are rejected.
    #[n(1)]
    Locked,
    #[n(2)]
    Sold,
    #[n(3)]
    Traded,
    #[n(4)]
    Expired,
    /// Soft-deleted by its owner.
    #[n(5)]
    Inactive,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct GiftCard {
    #[n(0)]
    pub card_id: String,
    #[n(1)]
    pub owner: String,
    #[n(2)]
    pub brand: String,
    /// Face value, fixed-point cents.
    #[n(3)]
    pub value: Money,
    #[n(4)]
    pub listing_type: ListingType,
    #[n(5)]
    pub status: CardStatus,
    /// Required for Sell/Both listings; frozen into a Sale on creation.
    #[n(6)]
    pub selling_price: Option<Money>,
    #[n(7)]
    pub expiry_date: TimeStamp<Utc>,
    /// Opaque handle into the vault; the card record never holds plaintext.
    #[n(8)]
    pub secret_handle: String,
    #[n(9)]
    pub created_at: TimeStamp<Utc>,
    #[n(10)]
    pub updated_at: TimeStamp<Utc>,
}

impl GiftCard {
    pub fn swappable(&self) -> bool {
        matches!(self.listing_type, ListingType::Swap | ListingType::Both)
    }

    pub fn sellable(&self) -> bool {
        matches!(self.listing_type, ListingType::Sell | ListingType::Both)
    }

    pub fn is_expired(&self, now: &TimeStamp<Utc>) -> bool {
        self.expiry_date < *now
    }

    pub fn ensure_owned_by(&self, user: &str) -> Result<(), ValidationError> {
        if self.owner != user {
            return Err(ValidationError::NotCardOwner {
                card: self.card_id.clone(),
                user: user.to_string(),
            });
        }
        Ok(())
    }

    pub fn ensure_active(&self) -> Result<(), ValidationError> {
        if self.status != CardStatus::Active {
            return Err(ValidationError::CardNotActive(self.card_id.clone()));
        }
        Ok(())
    }

    /// Active and not past expiry; the check every escrow entry runs.
    pub fn ensure_tradeable(&self, now: &TimeStamp<Utc>) -> Result<(), ValidationError> {
        self.ensure_active()?;
        if self.is_expired(now) {
            return Err(ValidationError::CardExpired(self.card_id.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::short_ref;

    fn card(listing: ListingType) -> GiftCard {
        GiftCard {
            card_id: short_ref("CRD"),
            owner: "user_alice".into(),
            brand: "Acme".into(),
            value: Money::from_dollars(50),
            listing_type: listing,
            status: CardStatus::Active,
            selling_price: None,
            expiry_date: TimeStamp::new_with(2030, 1, 1, 0, 0, 0),
            secret_handle: "handle".into(),
            created_at: TimeStamp::now(),
            updated_at: TimeStamp::now(),
        }
    }

    #[test]
    fn listing_type_gates_swap_and_sell() {
        assert!(card(ListingType::Swap).swappable());
        assert!(!card(ListingType::Swap).sellable());
        assert!(card(ListingType::Both).swappable());
        assert!(card(ListingType::Both).sellable());
        assert!(!card(ListingType::Sell).swappable());
    }

    #[test]
    fn expired_card_is_not_tradeable() {
        let mut c = card(ListingType::Swap);
        c.expiry_date = TimeStamp::new_with(2020, 1, 1, 0, 0, 0);

        let err = c.ensure_tradeable(&TimeStamp::now()).unwrap_err();
        assert_eq!(err, ValidationError::CardExpired(c.card_id.clone()));
    }

    #[test]
    fn ownership_guard_names_the_offender() {
        let c = card(ListingType::Swap);
        assert!(c.ensure_owned_by("user_alice").is_ok());
        assert!(matches!(
            c.ensure_owned_by("user_mallory"),
            Err(ValidationError::NotCardOwner { .. })
        ));
    }

    #[test]
    fn card_roundtrips_through_cbor() {
        let original = card(ListingType::Both);
        let bytes = minicbor::to_vec(&original).unwrap();
        let decoded: GiftCard = minicbor::decode(&bytes).unwrap();
        assert_eq!(original, decoded);
    }
}
