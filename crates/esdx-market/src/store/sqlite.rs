//! A concrete `sqlx::SqlitePool`-backed store, given a real body so the
//! workspace is testable end-to-end.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use clap::Parser;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::addr::Ia;
use crate::algebra::SoldPredecessor;
use crate::model::{As, Broker, BwProfile, Contract, LinkTo, Offer, PurchaseOrder};

use super::{ContractProjection, Store, StoreError};

/// CLI-adjacent configuration for a `SqliteStore` handle, mirroring
/// `order_stream::Args`'s `clap::Parser` + `env` fallback pattern.
#[derive(Debug, Clone, Parser)]
pub struct StoreConfig {
    /// `sqlx` connection string, e.g. `sqlite://esdx.db` or `sqlite::memory:`.
    #[arg(long, env = "ESDX_DATABASE_URL")]
    pub database_url: String,
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| StoreError::Internal(e.into()))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Internal(e.into()))?;
        Ok(Self { pool })
    }

    /// Opens a store from a `StoreConfig` (the CLI-adjacent entry point).
    pub async fn open(config: StoreConfig) -> Result<Self, StoreError> {
        Self::connect(&config.database_url).await
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

fn row_to_offer(row: &sqlx::sqlite::SqliteRow) -> Result<Offer, anyhow::Error> {
    let bw_profile: String = row.try_get("bw_profile")?;
    let br_link_to: String = row.try_get("br_link_to")?;
    Ok(Offer {
        id: row.try_get::<i64, _>("id").ok(),
        iaid: Ia::parse(row.try_get::<String, _>("iaid")?)?,
        is_core: row.try_get::<i64, _>("is_core")? != 0,
        signature: row.try_get("signature")?,
        notbefore: ts(row.try_get("notbefore")?),
        notafter: ts(row.try_get("notafter")?),
        reachable_paths: row.try_get("reachable_paths")?,
        qos_class: row.try_get("qos_class")?,
        price_per_unit: row.try_get("price_per_unit")?,
        bw_profile: BwProfile::parse(&bw_profile)?,
        br_address_template: row.try_get("br_address_template")?,
        br_mtu: row.try_get::<i64, _>("br_mtu")? as u32,
        br_link_to: LinkTo::parse(&br_link_to).map_err(|e| anyhow::anyhow!(e.to_string()))?,
        deprecates: row.try_get::<Option<i64>, _>("deprecates")?,
    })
}

async fn successor_of(tx: &mut Transaction<'_, Sqlite>, id: i64) -> Result<Option<i64>, anyhow::Error> {
    let row = sqlx::query("SELECT id FROM offers WHERE deprecates = ?")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(row.map(|r| r.get::<i64, _>("id")))
}

async fn lineage_root(tx: &mut Transaction<'_, Sqlite>, mut id: i64) -> Result<i64, anyhow::Error> {
    loop {
        let row = sqlx::query("SELECT deprecates FROM offers WHERE id = ?")
            .bind(id)
            .fetch_one(&mut **tx)
            .await?;
        match row.try_get::<Option<i64>, _>("deprecates")? {
            Some(parent) => id = parent,
            None => return Ok(id),
        }
    }
}

async fn fetch_offer(tx: &mut Transaction<'_, Sqlite>, id: i64) -> Result<Option<Offer>, anyhow::Error> {
    let row = sqlx::query("SELECT * FROM offers WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    row.as_ref().map(row_to_offer).transpose()
}

async fn available_offer_from(
    tx: &mut Transaction<'_, Sqlite>,
    mut id: i64,
) -> Result<Option<Offer>, anyhow::Error> {
    loop {
        match successor_of(tx, id).await? {
            Some(next) => id = next,
            None => return fetch_offer(tx, id).await,
        }
    }
}

async fn insert_offer(tx: &mut Transaction<'_, Sqlite>, offer: &Offer) -> Result<i64, anyhow::Error> {
    let result = sqlx::query(
        "INSERT INTO offers
            (iaid, is_core, signature, notbefore, notafter, reachable_paths, qos_class,
             price_per_unit, bw_profile, br_address_template, br_mtu, br_link_to, deprecates)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(offer.iaid.as_str())
    .bind(offer.is_core as i64)
    .bind(&offer.signature)
    .bind(offer.notbefore.timestamp())
    .bind(offer.notafter.timestamp())
    .bind(&offer.reachable_paths)
    .bind(offer.qos_class)
    .bind(offer.price_per_unit)
    .bind(offer.bw_profile.to_csv())
    .bind(&offer.br_address_template)
    .bind(offer.br_mtu as i64)
    .bind(offer.br_link_to.as_str())
    .bind(offer.deprecates)
    .execute(&mut **tx)
    .await?;
    Ok(result.last_insert_rowid())
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_as(&self, iaid: &Ia) -> Result<Option<As>, StoreError> {
        let row = sqlx::query("SELECT * FROM as_entities WHERE iaid = ?")
            .bind(iaid.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(e.into()))?;
        row.map(|r| {
            Ok(As {
                iaid: Ia::parse(r.try_get::<String, _>("iaid").map_err(anyhow::Error::from)?)
                    .map_err(|e| anyhow::anyhow!(e.to_string()))?,
                certificate_pem: r.try_get("certificate_pem").map_err(anyhow::Error::from)?,
                name: r.try_get("name").map_err(anyhow::Error::from)?,
            })
        })
        .transpose()
        .map_err(StoreError::Internal)
    }

    async fn get_broker(&self) -> Result<Option<Broker>, StoreError> {
        let row = sqlx::query("SELECT * FROM broker WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(e.into()))?;
        row.map(|r| {
            Ok(Broker {
                certificate_pem: r.try_get("certificate_pem").map_err(anyhow::Error::from)?,
                key_pem: r.try_get("key_pem").map_err(anyhow::Error::from)?,
            })
        })
        .transpose()
        .map_err(StoreError::Internal)
    }

    async fn get_offer(&self, id: i64) -> Result<Option<Offer>, StoreError> {
        let row = sqlx::query("SELECT * FROM offers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(e.into()))?;
        row.as_ref().map(row_to_offer).transpose().map_err(StoreError::Internal)
    }

    async fn available_offer_in_lineage(&self, member_id: i64) -> Result<Option<Offer>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Internal(e.into()))?;
        if fetch_offer(&mut tx, member_id).await.map_err(StoreError::Internal)?.is_none() {
            return Ok(None);
        }
        let root = lineage_root(&mut tx, member_id).await.map_err(StoreError::Internal)?;
        let available = available_offer_from(&mut tx, root).await.map_err(StoreError::Internal)?;
        tx.commit().await.map_err(|e| StoreError::Internal(e.into()))?;
        Ok(available)
    }

    async fn list_available_offers(&self) -> Result<Vec<Offer>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Internal(e.into()))?;
        let roots = sqlx::query("SELECT id FROM offers WHERE deprecates IS NULL")
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| StoreError::Internal(e.into()))?;
        let mut available = Vec::with_capacity(roots.len());
        for row in roots {
            let root_id: i64 = row.get("id");
            if let Some(offer) = available_offer_from(&mut tx, root_id).await.map_err(StoreError::Internal)? {
                available.push(offer);
            }
        }
        tx.commit().await.map_err(|e| StoreError::Internal(e.into()))?;
        Ok(available)
    }

    async fn nearest_sold_predecessor(
        &self,
        offer_id: i64,
    ) -> Result<Option<SoldPredecessor>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Internal(e.into()))?;
        let mut cursor = fetch_offer(&mut tx, offer_id)
            .await
            .map_err(StoreError::Internal)?
            .and_then(|o| o.deprecates);
        let result = loop {
            let Some(id) = cursor else { break None };
            let row = sqlx::query(
                "SELECT c.br_address AS br_address
                 FROM contracts c
                 JOIN purchase_orders po ON po.id = c.purchase_order_id
                 WHERE po.offer_id = ?",
            )
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Internal(e.into()))?;
            if let Some(row) = row {
                break Some(SoldPredecessor { br_address: row.get("br_address") });
            }
            cursor = fetch_offer(&mut tx, id).await.map_err(StoreError::Internal)?.and_then(|o| o.deprecates);
        };
        tx.commit().await.map_err(|e| StoreError::Internal(e.into()))?;
        Ok(result)
    }

    async fn add_offer(&self, root: Offer, mut successor: Offer) -> Result<Offer, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Internal(e.into()))?;
        let root_id = insert_offer(&mut tx, &root).await.map_err(StoreError::Internal)?;
        successor.deprecates = Some(root_id);
        let successor_id = insert_offer(&mut tx, &successor).await.map_err(StoreError::Internal)?;
        successor.id = Some(successor_id);
        tx.commit().await.map_err(|e| StoreError::Internal(e.into()))?;
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
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Internal(e.into()))?;

        let current = fetch_offer(&mut tx, available_offer_id).await.map_err(StoreError::Internal)?;
        let Some(current) = current else {
            return Err(StoreError::NotFound("offer"));
        };
        if current.signature != expected_signature {
            return Err(StoreError::Conflict);
        }
        if successor_of(&mut tx, available_offer_id).await.map_err(StoreError::Internal)?.is_some() {
            return Err(StoreError::Conflict);
        }

        let mut po = purchase_order;
        let po_result = sqlx::query(
            "INSERT INTO purchase_orders (offer_id, buyer_iaid, signature, bw_profile, starting_on)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(po.offer_id)
        .bind(po.buyer_iaid.as_str())
        .bind(&po.signature)
        .bind(po.bw_profile.to_csv())
        .bind(po.starting_on.timestamp())
        .execute(&mut *tx)
        .await;
        // UNIQUE(deprecates) and the signature re-check above are the two
        // guards against a lost-update race; a unique-constraint violation
        // here means another purchase slipped in between our read and this
        // insert despite the process-wide mutex (e.g. a second process), so
        // it is surfaced the same way as the signature mismatch.
        let po_id = match po_result {
            Ok(r) => r.last_insert_rowid(),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(StoreError::Conflict)
            }
            Err(e) => return Err(StoreError::Internal(e.into())),
        };
        po.id = Some(po_id);

        let mut contract = contract;
        contract.purchase_order_id = po_id;
        let contract_id = sqlx::query(
            "INSERT INTO contracts (purchase_order_id, timestamp, br_address, signature_broker)
             VALUES (?, ?, ?, ?)",
        )
        .bind(po_id)
        .bind(contract.timestamp.timestamp())
        .bind(&contract.br_address)
        .bind(&contract.signature_broker)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Internal(e.into()))?
        .last_insert_rowid();
        contract.id = Some(contract_id);

        successor.deprecates = Some(available_offer_id);
        let successor_result = insert_offer(&mut tx, &successor).await;
        let successor_id = match successor_result {
            Ok(id) => id,
            Err(e) if e.downcast_ref::<sqlx::Error>().map(|e| matches!(e, sqlx::Error::Database(d) if d.is_unique_violation())).unwrap_or(false) => {
                return Err(StoreError::Conflict)
            }
            Err(e) => return Err(StoreError::Internal(e)),
        };
        successor.id = Some(successor_id);

        tx.commit().await.map_err(|e| StoreError::Internal(e.into()))?;
        Ok((po, contract, successor))
    }

    async fn get_contract(&self, contract_id: i64) -> Result<Option<ContractProjection>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Internal(e.into()))?;

        let contract_row = sqlx::query("SELECT * FROM contracts WHERE id = ?")
            .bind(contract_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Internal(e.into()))?;
        let Some(contract_row) = contract_row else { return Ok(None) };
        let po_id: i64 = contract_row.get("purchase_order_id");
        let contract = Contract {
            id: Some(contract_id),
            purchase_order_id: po_id,
            timestamp: ts(contract_row.get("timestamp")),
            br_address: contract_row.get("br_address"),
            signature_broker: contract_row.get("signature_broker"),
        };

        let po_row = sqlx::query("SELECT * FROM purchase_orders WHERE id = ?")
            .bind(po_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Internal(e.into()))?;
        let Some(po_row) = po_row else { return Ok(None) };
        let offer_id: i64 = po_row.get("offer_id");
        let bw_profile: String = po_row.get("bw_profile");
        let purchase_order = PurchaseOrder {
            id: Some(po_id),
            offer_id,
            buyer_iaid: Ia::parse(po_row.get::<String, _>("buyer_iaid"))
                .map_err(|e| StoreError::Internal(anyhow::anyhow!(e.to_string())))?,
            signature: po_row.get("signature"),
            bw_profile: BwProfile::parse(&bw_profile)
                .map_err(|e| StoreError::Internal(anyhow::anyhow!(e.to_string())))?,
            starting_on: ts(po_row.get("starting_on")),
        };

        let Some(requested_offer) = fetch_offer(&mut tx, offer_id).await.map_err(StoreError::Internal)? else {
            return Ok(None);
        };
        let root_id = lineage_root(&mut tx, offer_id).await.map_err(StoreError::Internal)?;
        let Some(root) = fetch_offer(&mut tx, root_id).await.map_err(StoreError::Internal)? else {
            return Ok(None);
        };

        tx.commit().await.map_err(|e| StoreError::Internal(e.into()))?;
        Ok(Some(ContractProjection {
            contract,
            purchase_order,
            requested_offer,
            seller_iaid: root.iaid,
        }))
    }
}
