//! The purchase coordinator: a nine-step pipeline, run under a process-wide
//! mutex composed with the store's own transaction boundary.
//!
//! The mutex is an instance field rather than a global; "process-wide" is
//! achieved by constructing exactly one `PurchaseCoordinator` per process and
//! sharing it (e.g. behind an `Arc`) across RPC handlers.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::addr::Ia;
use crate::algebra::{self, AlgebraError};
use crate::cache::{BrokerCache, CacheError};
use crate::model::{BwProfile, Contract, Offer, PurchaseOrder};
use crate::store::{Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum PurchaseError {
    #[error("no available offer in the lineage of {0}")]
    OfferUnavailable(i64),
    #[error("the requested offer has no assigned id")]
    MissingOfferId,
    #[error("the presented offer no longer matches the current available offer")]
    OfferStale,
    #[error("requested bandwidth profile cannot be satisfied: {0}")]
    ProfileUnsatisfiable(#[source] AlgebraError),
    #[error("buyer {0} is not a registered AS")]
    UnknownBuyer(Ia),
    #[error("buyer signature does not verify")]
    SignatureInvalid,
    #[error("no free port remains in the offer's template")]
    ResourceExhausted,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// The buyer's view of the offer they are purchasing against (possibly
/// stale), their identity, their signature, and the desired sub-profile.
pub struct PurchaseRequest {
    pub requested_offer: Offer,
    pub buyer_iaid: Ia,
    pub buyer_signature: String,
    pub bw_profile: BwProfile,
    pub starting_on: chrono::DateTime<Utc>,
}

pub struct PurchaseCoordinator<S: Store> {
    store: Arc<S>,
    broker_cache: BrokerCache,
    mutex: Mutex<()>,
}

impl<S: Store> PurchaseCoordinator<S> {
    pub fn new(store: Arc<S>, broker_cache: BrokerCache) -> Self {
        Self { store, broker_cache, mutex: Mutex::new(()) }
    }

    /// Runs the full critical section. Exactly one call proceeds past the
    /// mutex acquisition at a time across this coordinator's lifetime, so
    /// purchases are globally serialized.
    #[instrument(skip(self, req), fields(requested_offer_id = ?req.requested_offer.id))]
    pub async fn purchase(&self, req: PurchaseRequest) -> Result<Contract, PurchaseError> {
        let _guard = self.mutex.lock().await;
        debug!("purchase mutex acquired");

        let requested_offer_id = req.requested_offer.id.ok_or(PurchaseError::MissingOfferId)?;

        // Step 1: the current head of the lineage.
        let available = self
            .store
            .available_offer_in_lineage(requested_offer_id)
            .await?
            .ok_or(PurchaseError::OfferUnavailable(requested_offer_id))?;

        // Step 2: staleness detection — byte-for-byte against the buyer's view.
        if available.signature != req.requested_offer.signature
            || available.canonical_bytes() != req.requested_offer.canonical_bytes()
        {
            warn!("rejecting purchase: presented offer is stale");
            return Err(PurchaseError::OfferStale);
        }

        // Step 3: profile arithmetic.
        let residual_csv = algebra::purchase(
            &available.bw_profile.to_csv(),
            &req.bw_profile.to_csv(),
            req.starting_on.timestamp(),
            available.notbefore.timestamp(),
        )
        .map_err(PurchaseError::ProfileUnsatisfiable)?;

        // Step 4: buyer signature, bound to the *requested* offer's bytes.
        let buyer = self
            .store
            .get_as(&req.buyer_iaid)
            .await?
            .ok_or_else(|| PurchaseError::UnknownBuyer(req.buyer_iaid.clone()))?;
        let buyer_cert = esdx_crypto::Certificate::from_pem(&buyer.certificate_pem)
            .map_err(|_| PurchaseError::SignatureInvalid)?;
        let po_bytes = PurchaseOrder {
            id: None,
            offer_id: requested_offer_id,
            buyer_iaid: req.buyer_iaid.clone(),
            signature: req.buyer_signature.clone(),
            bw_profile: req.bw_profile.clone(),
            starting_on: req.starting_on,
        }
        .canonical_bytes(&req.requested_offer);
        buyer_cert
            .verify(&req.buyer_signature, &po_bytes)
            .map_err(|_| PurchaseError::SignatureInvalid)?;

        // Step 5: port allocation.
        let nearest_sold = self.store.nearest_sold_predecessor(available.id.unwrap()).await?;
        let br_address =
            algebra::find_available_br_address(&available.br_address_template, nearest_sold.as_ref())
                .map_err(|_| PurchaseError::ResourceExhausted)?;

        // Steps 6-8 assembled here, committed atomically by the store.
        let purchase_order = PurchaseOrder {
            id: None,
            offer_id: available.id.unwrap(),
            buyer_iaid: req.buyer_iaid.clone(),
            signature: req.buyer_signature.clone(),
            bw_profile: req.bw_profile.clone(),
            starting_on: req.starting_on,
        };

        let broker = self.broker_cache.get(self.store.as_ref()).await?;
        let (broker_key, _broker_cert) = broker.as_ref();
        let timestamp = Utc::now();
        let contract_bytes_po = purchase_order.canonical_bytes(&req.requested_offer);
        let contract_signing_bytes = crate::wire::contract_bytes(
            &contract_bytes_po,
            &req.buyer_signature,
            timestamp.timestamp(),
            &br_address,
        );
        let contract = Contract {
            id: None,
            purchase_order_id: 0,
            timestamp,
            br_address,
            signature_broker: broker_key.sign(&contract_signing_bytes),
        };

        let mut successor = available.clone();
        successor.id = None;
        successor.deprecates = None;
        successor.bw_profile = BwProfile::parse(&residual_csv)
            .expect("algebra::purchase always returns a well-formed CSV profile");
        successor.signature = broker_key.sign(&successor.canonical_bytes());

        let (_po, contract, _successor) = self
            .store
            .commit_purchase(available.id.unwrap(), &available.signature, purchase_order, contract, successor)
            .await?;

        debug!(contract_id = ?contract.id, "purchase committed");
        Ok(contract)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Ia;
    use crate::model::{Broker, LinkTo};
    use crate::store::MemStore;
    use chrono::{TimeZone, Utc};

    const TEST_CERT_PEM: &str = include_str!("../../esdx-crypto/testdata/test_cert.pem");
    const TEST_KEY_PEM: &str = include_str!("../../esdx-crypto/testdata/test_key.pem");

    fn seed_store() -> MemStore {
        let store = MemStore::new();
        store.set_broker(Broker {
            certificate_pem: TEST_CERT_PEM.to_string(),
            key_pem: TEST_KEY_PEM.to_string(),
        });
        store.add_as(crate::model::As {
            iaid: Ia::parse("1-ff00:0:112").unwrap(),
            certificate_pem: TEST_CERT_PEM.to_string(),
            name: "buyer".to_string(),
        });
        store
    }

    async fn seed_offer(store: &MemStore) -> Offer {
        let broker_key = esdx_crypto::KeyPair::from_pem(TEST_KEY_PEM).unwrap();
        let mut offer = Offer {
            id: None,
            iaid: Ia::parse("1-ff00:0:110").unwrap(),
            is_core: false,
            signature: String::new(),
            notbefore: Utc.timestamp_opt(0, 0).unwrap(),
            notafter: Utc.timestamp_opt(4 * crate::model::BW_PERIOD_SECS, 0).unwrap(),
            reachable_paths: String::new(),
            qos_class: 0,
            price_per_unit: 1.0,
            bw_profile: BwProfile::parse("2,2,2,2").unwrap(),
            br_address_template: "10.1.1.1:50000-50010".to_string(),
            br_mtu: 1500,
            br_link_to: LinkTo::Parent,
            deprecates: None,
        };
        offer.signature = broker_key.sign(&offer.canonical_bytes());
        let mut root = offer.clone();
        root.signature = broker_key.sign(&root.canonical_bytes());
        store.add_offer(root, offer).await.unwrap()
    }

    #[tokio::test]
    async fn simple_purchase_end_to_end() {
        let store = Arc::new(seed_store());
        let available = seed_offer(&store).await;
        let coordinator = PurchaseCoordinator::new(store.clone(), BrokerCache::new());

        let buyer_key = esdx_crypto::KeyPair::from_pem(TEST_KEY_PEM).unwrap();
        let bw_profile = BwProfile::parse("2").unwrap();
        let starting_on = Utc.timestamp_opt(0, 0).unwrap();
        let po_bytes = PurchaseOrder {
            id: None,
            offer_id: available.id.unwrap(),
            buyer_iaid: Ia::parse("1-ff00:0:112").unwrap(),
            signature: String::new(),
            bw_profile: bw_profile.clone(),
            starting_on,
        }
        .canonical_bytes(&available);
        let buyer_signature = buyer_key.sign(&po_bytes);

        let req = PurchaseRequest {
            requested_offer: available.clone(),
            buyer_iaid: Ia::parse("1-ff00:0:112").unwrap(),
            buyer_signature,
            bw_profile,
            starting_on,
        };

        let contract = coordinator.purchase(req).await.unwrap();
        assert_eq!(contract.br_address, "10.1.1.1:50000");

        let new_available = store.available_offer_in_lineage(available.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(new_available.bw_profile, BwProfile::parse("0,2,2,2").unwrap());
    }

    #[tokio::test]
    async fn stale_offer_is_rejected() {
        let store = Arc::new(seed_store());
        let available = seed_offer(&store).await;
        let coordinator = PurchaseCoordinator::new(store.clone(), BrokerCache::new());

        let mut stale = available.clone();
        stale.signature = "not-the-real-signature".to_string();

        let buyer_key = esdx_crypto::KeyPair::from_pem(TEST_KEY_PEM).unwrap();
        let bw_profile = BwProfile::parse("2").unwrap();
        let starting_on = Utc.timestamp_opt(0, 0).unwrap();
        let po_bytes = PurchaseOrder {
            id: None,
            offer_id: stale.id.unwrap(),
            buyer_iaid: Ia::parse("1-ff00:0:112").unwrap(),
            signature: String::new(),
            bw_profile: bw_profile.clone(),
            starting_on,
        }
        .canonical_bytes(&stale);
        let buyer_signature = buyer_key.sign(&po_bytes);

        let req = PurchaseRequest {
            requested_offer: stale,
            buyer_iaid: Ia::parse("1-ff00:0:112").unwrap(),
            buyer_signature,
            bw_profile,
            starting_on,
        };

        assert!(matches!(coordinator.purchase(req).await, Err(PurchaseError::OfferStale)));
    }
}
