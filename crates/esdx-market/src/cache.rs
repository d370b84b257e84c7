//! Process-wide memoization of the broker's key and certificate, invalidated
//! whenever the broker row changes. Passed into
//! [`crate::purchase::PurchaseCoordinator`] and `MarketService` as an
//! ordinary dependency rather than kept as a global, so tests can construct
//! independent instances.

use std::sync::Arc;

use esdx_crypto::{Certificate, CryptoError, KeyPair};
use tokio::sync::RwLock;

use crate::store::{Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no broker is configured")]
    NoBroker,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

type Entry = Arc<(KeyPair, Certificate)>;

#[derive(Clone)]
pub struct BrokerCache {
    inner: Arc<RwLock<Option<Entry>>>,
}

impl BrokerCache {
    pub fn new() -> Self {
        Self { inner: Arc::new(RwLock::new(None)) }
    }

    /// Returns the cached `(key, certificate)` pair, loading it from the
    /// store's singleton broker row on first use.
    pub async fn get(&self, store: &dyn Store) -> Result<Entry, CacheError> {
        if let Some(entry) = self.inner.read().await.as_ref() {
            return Ok(entry.clone());
        }

        let mut write = self.inner.write().await;
        if let Some(entry) = write.as_ref() {
            return Ok(entry.clone());
        }

        let broker = store.get_broker().await?.ok_or(CacheError::NoBroker)?;
        let key = KeyPair::from_pem(&broker.key_pem)?;
        let cert = Certificate::from_pem(&broker.certificate_pem)?;
        let entry: Entry = Arc::new((key, cert));
        *write = Some(entry.clone());
        Ok(entry)
    }

    /// Drops the cached pair; the next `get` reloads from the store. Callers
    /// invoke this whenever the broker row is created, replaced, or removed.
    pub async fn invalidate(&self) {
        *self.inner.write().await = None;
    }
}

impl Default for BrokerCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Broker;
    use crate::store::MemStore;

    #[tokio::test]
    async fn loads_lazily_and_reuses_the_cached_entry() {
        let store = MemStore::new();
        store.set_broker(Broker {
            certificate_pem: include_str!("../../esdx-crypto/testdata/test_cert.pem").to_string(),
            key_pem: include_str!("../../esdx-crypto/testdata/test_key.pem").to_string(),
        });

        let cache = BrokerCache::new();
        let first = cache.get(&store).await.unwrap();
        let second = cache.get(&store).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn invalidate_forces_a_reload() {
        let store = MemStore::new();
        store.set_broker(Broker {
            certificate_pem: include_str!("../../esdx-crypto/testdata/test_cert.pem").to_string(),
            key_pem: include_str!("../../esdx-crypto/testdata/test_key.pem").to_string(),
        });

        let cache = BrokerCache::new();
        let first = cache.get(&store).await.unwrap();
        cache.invalidate().await;
        let second = cache.get(&store).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn missing_broker_row_is_an_error() {
        let store = MemStore::new();
        let cache = BrokerCache::new();
        assert!(matches!(cache.get(&store).await, Err(CacheError::NoBroker)));
    }
}
