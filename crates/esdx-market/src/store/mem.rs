//! An in-process store for unit and integration tests that don't need real
//! persistence — keeps the pure-logic test suite off a real database.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::addr::Ia;
use crate::algebra::SoldPredecessor;
use crate::model::{As, Broker, Contract, Offer, PurchaseOrder};

use super::{ContractProjection, Store, StoreError};

#[derive(Default)]
struct Inner {
    next_offer_id: i64,
    next_po_id: i64,
    next_contract_id: i64,
    offers: HashMap<i64, Offer>,
    purchase_orders: HashMap<i64, PurchaseOrder>,
    contracts: HashMap<i64, Contract>,
    assigns: Vec<As>,
    broker: Option<Broker>,
}

/// A `tokio::sync::Mutex`-free, plain-`std::sync::Mutex`-guarded store: all
/// operations are short and non-blocking on I/O, so a blocking mutex is
/// sufficient and avoids holding a `.await` across a lock guard.
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }

    pub fn set_broker(&self, broker: Broker) {
        self.inner.lock().unwrap().broker = Some(broker);
    }

    pub fn add_as(&self, as_entity: As) {
        self.inner.lock().unwrap().assigns.push(as_entity);
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

fn successor_of(inner: &Inner, id: i64) -> Option<i64> {
    inner
        .offers
        .values()
        .find(|o| o.deprecates == Some(id))
        .and_then(|o| o.id)
}

fn lineage_root(inner: &Inner, mut id: i64) -> i64 {
    loop {
        match inner.offers.get(&id).and_then(|o| o.deprecates) {
            Some(parent) => id = parent,
            None => return id,
        }
    }
}

fn available_offer_from(inner: &Inner, mut id: i64) -> Option<Offer> {
    loop {
        match successor_of(inner, id) {
            Some(next) => id = next,
            None => return inner.offers.get(&id).cloned(),
        }
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get_as(&self, iaid: &Ia) -> Result<Option<As>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.assigns.iter().find(|a| &a.iaid == iaid).cloned())
    }

    async fn get_broker(&self) -> Result<Option<Broker>, StoreError> {
        Ok(self.inner.lock().unwrap().broker.clone())
    }

    async fn get_offer(&self, id: i64) -> Result<Option<Offer>, StoreError> {
        Ok(self.inner.lock().unwrap().offers.get(&id).cloned())
    }

    async fn available_offer_in_lineage(&self, member_id: i64) -> Result<Option<Offer>, StoreError> {
        let inner = self.inner.lock().unwrap();
        if !inner.offers.contains_key(&member_id) {
            return Ok(None);
        }
        let root = lineage_root(&inner, member_id);
        Ok(available_offer_from(&inner, root))
    }

    async fn list_available_offers(&self) -> Result<Vec<Offer>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let roots: Vec<i64> = inner
            .offers
            .values()
            .filter(|o| o.deprecates.is_none())
            .filter_map(|o| o.id)
            .collect();
        Ok(roots
            .into_iter()
            .filter_map(|root| available_offer_from(&inner, root))
            .collect())
    }

    async fn nearest_sold_predecessor(
        &self,
        offer_id: i64,
    ) -> Result<Option<SoldPredecessor>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut cursor = inner.offers.get(&offer_id).and_then(|o| o.deprecates);
        while let Some(id) = cursor {
            if let Some(contract) = inner.contracts.values().find(|c| {
                inner
                    .purchase_orders
                    .get(&c.purchase_order_id)
                    .map(|po| po.offer_id == id)
                    .unwrap_or(false)
            }) {
                return Ok(Some(SoldPredecessor { br_address: contract.br_address.clone() }));
            }
            cursor = inner.offers.get(&id).and_then(|o| o.deprecates);
        }
        Ok(None)
    }

    async fn add_offer(&self, root: Offer, mut successor: Offer) -> Result<Offer, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let root_id = inner.next_offer_id;
        inner.next_offer_id += 1;
        let mut root = root;
        root.id = Some(root_id);
        inner.offers.insert(root_id, root);

        let successor_id = inner.next_offer_id;
        inner.next_offer_id += 1;
        successor.id = Some(successor_id);
        successor.deprecates = Some(root_id);
        inner.offers.insert(successor_id, successor.clone());
        Ok(successor)
    }

    async fn commit_purchase(
        &self,
        available_offer_id: i64,
        expected_signature: &str,
        purchase_order: PurchaseOrder,
        contract: Contract,
        mut successor: Offer,
    ) -> Result<(PurchaseOrder, Contract, Offer), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let current = inner
            .offers
            .get(&available_offer_id)
            .ok_or(StoreError::NotFound("offer"))?;
        if current.signature != expected_signature || successor_of(&inner, available_offer_id).is_some() {
            return Err(StoreError::Conflict);
        }

        let po_id = inner.next_po_id;
        inner.next_po_id += 1;
        let mut po = purchase_order;
        po.id = Some(po_id);
        inner.purchase_orders.insert(po_id, po.clone());

        let contract_id = inner.next_contract_id;
        inner.next_contract_id += 1;
        let mut contract = contract;
        contract.id = Some(contract_id);
        contract.purchase_order_id = po_id;
        inner.contracts.insert(contract_id, contract.clone());

        let successor_id = inner.next_offer_id;
        inner.next_offer_id += 1;
        successor.id = Some(successor_id);
        successor.deprecates = Some(available_offer_id);
        inner.offers.insert(successor_id, successor.clone());

        Ok((po, contract, successor))
    }

    async fn get_contract(&self, contract_id: i64) -> Result<Option<ContractProjection>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let Some(contract) = inner.contracts.get(&contract_id).cloned() else {
            return Ok(None);
        };
        let Some(po) = inner.purchase_orders.get(&contract.purchase_order_id).cloned() else {
            return Ok(None);
        };
        let Some(requested_offer) = inner.offers.get(&po.offer_id).cloned() else {
            return Ok(None);
        };
        let root_id = lineage_root(&inner, po.offer_id);
        let Some(root) = inner.offers.get(&root_id).cloned() else {
            return Ok(None);
        };
        Ok(Some(ContractProjection {
            contract,
            purchase_order: po,
            requested_offer,
            seller_iaid: root.iaid,
        }))
    }
}
