//! The library-level implementation of the four market RPCs (`ListOffers`,
//! `AddOffer`, `Purchase`, `GetContract`), deliberately not wired to
//! tonic/gRPC — that transport is an external collaborator. A thin adapter
//! crate maps [`MarketError`] to status codes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use crate::addr::Ia;
use crate::algebra::AlgebraError;
use crate::cache::{BrokerCache, CacheError};
use crate::model::{As, BwProfile, Contract, LinkTo, ModelError, Offer};
use crate::purchase::{PurchaseCoordinator, PurchaseError, PurchaseRequest};
use crate::store::{ContractProjection, Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum MarketError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("requester is neither the buyer nor the seller")]
    Forbidden,
    #[error("the presented offer is stale")]
    OfferStale,
    #[error("requested bandwidth profile cannot be satisfied")]
    ProfileUnsatisfiable,
    #[error("data was modified during the transaction")]
    Conflict,
    #[error("no free port remains in the offer's template")]
    ResourceExhausted,
    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

impl From<StoreError> for MarketError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict => MarketError::Conflict,
            StoreError::NotFound(what) => MarketError::NotFound(what),
            StoreError::MultipleBrokers => {
                MarketError::Internal(anyhow::anyhow!("more than one broker row exists"))
            }
            StoreError::Internal(err) => MarketError::Internal(err),
        }
    }
}

impl From<CacheError> for MarketError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Store(e) => e.into(),
            CacheError::NoBroker => MarketError::Internal(anyhow::anyhow!("no broker is configured")),
            CacheError::Crypto(e) => MarketError::Internal(e.into()),
        }
    }
}

impl From<PurchaseError> for MarketError {
    fn from(e: PurchaseError) -> Self {
        match e {
            PurchaseError::OfferUnavailable(_) => MarketError::NotFound("offer"),
            PurchaseError::MissingOfferId => MarketError::InvalidArgument(e.to_string()),
            PurchaseError::OfferStale => MarketError::OfferStale,
            PurchaseError::ProfileUnsatisfiable(_) => MarketError::ProfileUnsatisfiable,
            PurchaseError::UnknownBuyer(_) => MarketError::NotFound("AS"),
            PurchaseError::SignatureInvalid => MarketError::SignatureInvalid,
            PurchaseError::ResourceExhausted => MarketError::ResourceExhausted,
            PurchaseError::Store(e) => e.into(),
            PurchaseError::Cache(e) => e.into(),
        }
    }
}

impl From<ModelError> for MarketError {
    fn from(e: ModelError) -> Self {
        MarketError::InvalidArgument(e.to_string())
    }
}

impl From<AlgebraError> for MarketError {
    fn from(e: AlgebraError) -> Self {
        MarketError::InvalidArgument(e.to_string())
    }
}

/// A seller-signed `OfferSpecification` as received over the wire, before
/// any broker-side processing.
pub struct OfferSpecification {
    pub iaid: Ia,
    pub is_core: bool,
    pub notbefore: DateTime<Utc>,
    pub notafter: DateTime<Utc>,
    pub reachable_paths: String,
    pub qos_class: i32,
    pub price_per_unit: f64,
    pub bw_profile: BwProfile,
    pub br_address_template: String,
    pub br_mtu: u32,
    pub br_link_to: LinkTo,
    pub seller_signature: String,
}

pub struct MarketService<S: Store> {
    store: Arc<S>,
    broker_cache: BrokerCache,
    purchase_coordinator: PurchaseCoordinator<S>,
}

impl<S: Store> MarketService<S> {
    pub fn new(store: Arc<S>, broker_cache: BrokerCache) -> Self {
        let purchase_coordinator = PurchaseCoordinator::new(store.clone(), broker_cache.clone());
        Self { store, broker_cache, purchase_coordinator }
    }

    /// Every lineage's current head, no pagination, no ordering guarantee.
    pub async fn list_offers(&self) -> Result<Vec<Offer>, MarketError> {
        Ok(self.store.list_available_offers().await?)
    }

    /// Validates and persists a seller's new offer, appending the
    /// broker-signed successor that becomes the lineage's available head.
    #[instrument(skip(self, spec), fields(seller = %spec.iaid))]
    pub async fn add_offer(&self, spec: OfferSpecification) -> Result<Offer, MarketError> {
        let seller = self
            .store
            .get_as(&spec.iaid)
            .await?
            .ok_or(MarketError::NotFound("AS"))?;

        let root = Offer {
            id: None,
            iaid: spec.iaid.clone(),
            is_core: spec.is_core,
            signature: spec.seller_signature.clone(),
            notbefore: spec.notbefore,
            notafter: spec.notafter,
            reachable_paths: spec.reachable_paths,
            qos_class: spec.qos_class,
            price_per_unit: spec.price_per_unit,
            bw_profile: spec.bw_profile,
            br_address_template: spec.br_address_template,
            br_mtu: spec.br_mtu,
            br_link_to: spec.br_link_to,
            deprecates: None,
        };
        root.validate()?;

        let seller_cert =
            self.verify_as_signature(&seller, &spec.seller_signature, &root.canonical_bytes())?;
        if seller_cert.common_name() != seller.iaid.as_str() {
            return Err(MarketError::InvalidArgument(format!(
                "seller certificate CN {:?} does not match AS iaid {}",
                seller_cert.common_name(),
                seller.iaid
            )));
        }

        let broker = self.broker_cache.get(self.store.as_ref()).await?;
        let mut successor = root.clone();
        successor.signature = broker.0.sign(&successor.canonical_bytes());

        let persisted = self.store.add_offer(root, successor).await?;
        info!(offer_id = ?persisted.id, "offer added");
        Ok(persisted)
    }

    /// Delegates to the purchase coordinator's serialized pipeline.
    pub async fn purchase(&self, req: PurchaseRequest) -> Result<Contract, MarketError> {
        Ok(self.purchase_coordinator.purchase(req).await?)
    }

    /// Returns a contract's full projection after checking that the
    /// requester is either the buyer or the seller and that their signature
    /// verifies against their registered certificate.
    pub async fn get_contract(
        &self,
        contract_id: i64,
        requester_iaid: &Ia,
        requester_signature: &str,
    ) -> Result<ContractProjection, MarketError> {
        let requester = self
            .store
            .get_as(requester_iaid)
            .await?
            .ok_or(MarketError::NotFound("AS"))?;
        let request_bytes = crate::wire::get_contract_request_bytes(contract_id, requester_iaid.as_str());
        self.verify_as_signature(&requester, requester_signature, &request_bytes)?;

        let projection = self
            .store
            .get_contract(contract_id)
            .await?
            .ok_or(MarketError::NotFound("contract"))?;

        if requester_iaid != &projection.seller_iaid && requester_iaid != &projection.purchase_order.buyer_iaid
        {
            return Err(MarketError::Forbidden);
        }
        Ok(projection)
    }

    fn verify_as_signature(
        &self,
        as_entity: &As,
        signature: &str,
        data: &[u8],
    ) -> Result<esdx_crypto::Certificate, MarketError> {
        let cert = esdx_crypto::Certificate::from_pem(&as_entity.certificate_pem)
            .map_err(|_| MarketError::SignatureInvalid)?;
        cert.verify(signature, data).map_err(|_| MarketError::SignatureInvalid)?;
        Ok(cert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Broker, LinkTo, PurchaseOrder};
    use crate::store::MemStore;
    use chrono::TimeZone;

    // CN=1-ff00:0:110, shared by the broker and the single seller/buyer AS
    // fixture these tests register — good enough to exercise both signing
    // roles without a second key pair.
    const TEST_CERT_PEM: &str = include_str!("../../esdx-crypto/testdata/test_cert.pem");
    const TEST_KEY_PEM: &str = include_str!("../../esdx-crypto/testdata/test_key.pem");

    fn seeded_service() -> (Arc<MemStore>, MarketService<MemStore>) {
        let store = Arc::new(MemStore::new());
        store.set_broker(Broker {
            certificate_pem: TEST_CERT_PEM.to_string(),
            key_pem: TEST_KEY_PEM.to_string(),
        });
        store.add_as(As {
            iaid: Ia::parse("1-ff00:0:110").unwrap(),
            certificate_pem: TEST_CERT_PEM.to_string(),
            name: "seller-and-buyer".to_string(),
        });
        let service = MarketService::new(store.clone(), BrokerCache::new());
        (store, service)
    }

    fn signed_offer_spec(key: &esdx_crypto::KeyPair) -> OfferSpecification {
        let mut spec = OfferSpecification {
            iaid: Ia::parse("1-ff00:0:110").unwrap(),
            is_core: false,
            notbefore: Utc.timestamp_opt(0, 0).unwrap(),
            notafter: Utc.timestamp_opt(4 * crate::model::BW_PERIOD_SECS, 0).unwrap(),
            reachable_paths: String::new(),
            qos_class: 0,
            price_per_unit: 1.0,
            bw_profile: BwProfile::parse("2,2,2,2").unwrap(),
            br_address_template: "10.1.1.1:50000-50010".to_string(),
            br_mtu: 1500,
            br_link_to: LinkTo::Parent,
            seller_signature: String::new(),
        };
        let unsigned = Offer {
            id: None,
            iaid: spec.iaid.clone(),
            is_core: spec.is_core,
            signature: String::new(),
            notbefore: spec.notbefore,
            notafter: spec.notafter,
            reachable_paths: spec.reachable_paths.clone(),
            qos_class: spec.qos_class,
            price_per_unit: spec.price_per_unit,
            bw_profile: spec.bw_profile.clone(),
            br_address_template: spec.br_address_template.clone(),
            br_mtu: spec.br_mtu,
            br_link_to: spec.br_link_to,
            deprecates: None,
        };
        spec.seller_signature = key.sign(&unsigned.canonical_bytes());
        spec
    }

    #[tokio::test]
    async fn add_offer_then_list_offers_round_trips() {
        let (_, service) = seeded_service();
        let key = esdx_crypto::KeyPair::from_pem(TEST_KEY_PEM).unwrap();

        let persisted = service.add_offer(signed_offer_spec(&key)).await.unwrap();
        assert!(persisted.id.is_some());

        let listed = service.list_offers().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, persisted.id);
    }

    #[tokio::test]
    async fn add_offer_rejects_unknown_seller() {
        let store = Arc::new(MemStore::new());
        store.set_broker(Broker {
            certificate_pem: TEST_CERT_PEM.to_string(),
            key_pem: TEST_KEY_PEM.to_string(),
        });
        let service = MarketService::new(store, BrokerCache::new());
        let key = esdx_crypto::KeyPair::from_pem(TEST_KEY_PEM).unwrap();

        let err = service.add_offer(signed_offer_spec(&key)).await.unwrap_err();
        assert!(matches!(err, MarketError::NotFound("AS")));
    }

    #[tokio::test]
    async fn add_offer_rejects_cn_mismatch() {
        let store = Arc::new(MemStore::new());
        store.set_broker(Broker {
            certificate_pem: TEST_CERT_PEM.to_string(),
            key_pem: TEST_KEY_PEM.to_string(),
        });
        // Registered under an iaid that does not match the test cert's CN
        // (`1-ff00:0:110`), so AS.iaid == CN should fail even though the
        // signature itself verifies against this AS's own certificate.
        store.add_as(As {
            iaid: Ia::parse("1-ff00:0:999").unwrap(),
            certificate_pem: TEST_CERT_PEM.to_string(),
            name: "mismatched".to_string(),
        });
        let service = MarketService::new(store, BrokerCache::new());
        let key = esdx_crypto::KeyPair::from_pem(TEST_KEY_PEM).unwrap();

        let mut spec = signed_offer_spec(&key);
        spec.iaid = Ia::parse("1-ff00:0:999").unwrap();
        let unsigned_with_new_iaid = Offer {
            id: None,
            iaid: spec.iaid.clone(),
            is_core: spec.is_core,
            signature: String::new(),
            notbefore: spec.notbefore,
            notafter: spec.notafter,
            reachable_paths: spec.reachable_paths.clone(),
            qos_class: spec.qos_class,
            price_per_unit: spec.price_per_unit,
            bw_profile: spec.bw_profile.clone(),
            br_address_template: spec.br_address_template.clone(),
            br_mtu: spec.br_mtu,
            br_link_to: spec.br_link_to,
            deprecates: None,
        };
        spec.seller_signature = key.sign(&unsigned_with_new_iaid.canonical_bytes());

        let err = service.add_offer(spec).await.unwrap_err();
        assert!(matches!(err, MarketError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn get_contract_is_forbidden_for_an_unrelated_as() {
        let (store, service) = seeded_service();
        store.add_as(As {
            iaid: Ia::parse("1-ff00:0:999").unwrap(),
            certificate_pem: TEST_CERT_PEM.to_string(),
            name: "bystander".to_string(),
        });
        let key = esdx_crypto::KeyPair::from_pem(TEST_KEY_PEM).unwrap();
        let available = service.add_offer(signed_offer_spec(&key)).await.unwrap();

        let starting_on = Utc.timestamp_opt(0, 0).unwrap();
        let bw_profile = BwProfile::parse("2").unwrap();
        let po_bytes = PurchaseOrder {
            id: None,
            offer_id: available.id.unwrap(),
            buyer_iaid: Ia::parse("1-ff00:0:110").unwrap(),
            signature: String::new(),
            bw_profile: bw_profile.clone(),
            starting_on,
        }
        .canonical_bytes(&available);
        let contract = service
            .purchase(PurchaseRequest {
                requested_offer: available,
                buyer_iaid: Ia::parse("1-ff00:0:110").unwrap(),
                buyer_signature: key.sign(&po_bytes),
                bw_profile,
                starting_on,
            })
            .await
            .unwrap();

        let bystander_iaid = Ia::parse("1-ff00:0:999").unwrap();
        let request_bytes =
            crate::wire::get_contract_request_bytes(contract.id.unwrap(), bystander_iaid.as_str());
        let err = service
            .get_contract(contract.id.unwrap(), &bystander_iaid, &key.sign(&request_bytes))
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::Forbidden));
    }

    #[tokio::test]
    async fn get_contract_succeeds_for_seller_and_buyer() {
        let (_, service) = seeded_service();
        let key = esdx_crypto::KeyPair::from_pem(TEST_KEY_PEM).unwrap();
        let available = service.add_offer(signed_offer_spec(&key)).await.unwrap();

        let starting_on = Utc.timestamp_opt(0, 0).unwrap();
        let bw_profile = BwProfile::parse("2").unwrap();
        let buyer_iaid = Ia::parse("1-ff00:0:110").unwrap();
        let po_bytes = PurchaseOrder {
            id: None,
            offer_id: available.id.unwrap(),
            buyer_iaid: buyer_iaid.clone(),
            signature: String::new(),
            bw_profile: bw_profile.clone(),
            starting_on,
        }
        .canonical_bytes(&available);
        let contract = service
            .purchase(PurchaseRequest {
                requested_offer: available,
                buyer_iaid: buyer_iaid.clone(),
                buyer_signature: key.sign(&po_bytes),
                bw_profile,
                starting_on,
            })
            .await
            .unwrap();

        let request_bytes =
            crate::wire::get_contract_request_bytes(contract.id.unwrap(), buyer_iaid.as_str());
        let projection = service
            .get_contract(contract.id.unwrap(), &buyer_iaid, &key.sign(&request_bytes))
            .await
            .unwrap();
        assert_eq!(projection.contract.br_address, "10.1.1.1:50000");
    }
}
