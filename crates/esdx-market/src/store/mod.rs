//! The persistence seam. The store is an external collaborator ("any
//! transactional relational store suffices"); this module gives that
//! collaborator a trait so the rest of the crate never reasons about SQL
//! directly.

mod mem;
mod sqlite;

pub use mem::MemStore;
pub use sqlite::{SqliteStore, StoreConfig};

use async_trait::async_trait;

use crate::algebra::SoldPredecessor;
use crate::model::{As, Broker, Contract, Offer, PurchaseOrder};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("data was modified during the transaction")]
    Conflict,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("more than one broker row exists")]
    MultipleBrokers,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// The full projection `GetContract` returns: the contract, the purchase
/// order it settles, the offer that was requested, and the seller's `iaid`
/// (needed for the buyer-or-seller check on read).
pub struct ContractProjection {
    pub contract: Contract,
    pub purchase_order: PurchaseOrder,
    pub requested_offer: Offer,
    pub seller_iaid: crate::addr::Ia,
}

/// Everything the purchase coordinator and market service need from
/// persistence. Every method that participates in the purchase critical
/// section (`commit_purchase`) runs inside its own store-level transaction;
/// callers additionally hold the process-wide purchase mutex around the
/// whole pipeline (see `esdx_market::purchase`).
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_as(&self, iaid: &crate::addr::Ia) -> Result<Option<As>, StoreError>;

    async fn get_broker(&self) -> Result<Option<Broker>, StoreError>;

    async fn get_offer(&self, id: i64) -> Result<Option<Offer>, StoreError>;

    /// The unique offer in the lineage containing `member_id` that has no
    /// successor. `member_id` may be any offer in the lineage, not just the
    /// root — the buyer's `PurchaseRequest` names the offer they saw, which
    /// may already have been superseded.
    async fn available_offer_in_lineage(&self, member_id: i64) -> Result<Option<Offer>, StoreError>;

    /// Every offer that is currently the head of its lineage.
    async fn list_available_offers(&self) -> Result<Vec<Offer>, StoreError>;

    /// Walks `deprecates` back from `offer_id` to the nearest ancestor that
    /// has a contract sold against it, for the port walker.
    async fn nearest_sold_predecessor(
        &self,
        offer_id: i64,
    ) -> Result<Option<SoldPredecessor>, StoreError>;

    /// Persists the seller-signed root and its broker-signed successor in
    /// one transaction. Returns the persisted successor (the new available
    /// offer) with its assigned id.
    async fn add_offer(&self, root: Offer, successor: Offer) -> Result<Offer, StoreError>;

    /// The atomic core of `Purchase`: persists the purchase order, the
    /// contract, and the residual successor offer in one transaction, first
    /// re-checking that `available_offer_id` is still the
    /// lineage's available offer and that its signature still matches
    /// `expected_signature` — if either has changed since the caller last
    /// read it, returns `StoreError::Conflict` rather than silently
    /// proceeding against stale state.
    async fn commit_purchase(
        &self,
        available_offer_id: i64,
        expected_signature: &str,
        purchase_order: PurchaseOrder,
        contract: Contract,
        successor: Offer,
    ) -> Result<(PurchaseOrder, Contract, Offer), StoreError>;

    async fn get_contract(&self, contract_id: i64) -> Result<Option<ContractProjection>, StoreError>;
}
