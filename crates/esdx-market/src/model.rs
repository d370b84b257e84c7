//! Domain entities: `As`, `Broker`, `Offer`, `PurchaseOrder`, `Contract`, and
//! their supporting value types, with the structural invariants each one
//! enforces on construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::addr::{ip_port_range_from_str, Ia};
use crate::wire::{self, OfferFields};

pub const BW_PERIOD_SECS: i64 = 600;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("notafter must be after notbefore")]
    NonPositiveLifespan,
    #[error("offer lifespan is not a multiple of BW_PERIOD ({BW_PERIOD_SECS}s)")]
    LifespanNotMultipleOfPeriod,
    #[error("bw_profile has {actual} entries, expected {expected}")]
    ProfileLengthMismatch { expected: usize, actual: usize },
    #[error("bw_profile entry is malformed: {0}")]
    MalformedProfile(String),
    #[error("br_mtu {0} out of range [100, 65534]")]
    MtuOutOfRange(u32),
    #[error("br_link_to value {0:?} is not one of CORE, PARENT, PEER")]
    InvalidLinkTo(String),
    #[error("malformed br_address_template: {0}")]
    MalformedAddressTemplate(#[from] crate::addr::AddrError),
}

/// `CORE` / `PARENT` / `PEER` — the topology relationship a purchased
/// interface will have to the remote AS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkTo {
    Core,
    Parent,
    Peer,
}

impl LinkTo {
    pub fn parse(s: &str) -> Result<Self, ModelError> {
        match s {
            "CORE" => Ok(LinkTo::Core),
            "PARENT" => Ok(LinkTo::Parent),
            "PEER" => Ok(LinkTo::Peer),
            other => Err(ModelError::InvalidLinkTo(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LinkTo::Core => "CORE",
            LinkTo::Parent => "PARENT",
            LinkTo::Peer => "PEER",
        }
    }
}

/// A comma-separated list of non-negative per-`BW_PERIOD` bandwidth units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BwProfile(Vec<u64>);

impl BwProfile {
    pub fn parse(csv: &str) -> Result<Self, ModelError> {
        let mut values = Vec::new();
        for part in csv.split(',') {
            let v: u64 = part
                .trim()
                .parse()
                .map_err(|_| ModelError::MalformedProfile(csv.to_string()))?;
            values.push(v);
        }
        Ok(Self(values))
    }

    pub fn from_values(values: Vec<u64>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_csv(&self) -> String {
        self.0.iter().map(u64::to_string).collect::<Vec<_>>().join(",")
    }
}

/// A seller or buyer autonomous system.
#[derive(Debug, Clone)]
pub struct As {
    pub iaid: Ia,
    pub certificate_pem: String,
    pub name: String,
}

/// The singleton broker identity. Mutating this invalidates the process-wide
/// [`crate::cache::BrokerCache`].
#[derive(Debug, Clone)]
pub struct Broker {
    pub certificate_pem: String,
    pub key_pem: String,
}

/// A time-sliced bandwidth advertisement.
#[derive(Debug, Clone)]
pub struct Offer {
    pub id: Option<i64>,
    pub iaid: Ia,
    pub is_core: bool,
    pub signature: String,
    pub notbefore: DateTime<Utc>,
    pub notafter: DateTime<Utc>,
    pub reachable_paths: String,
    pub qos_class: i32,
    pub price_per_unit: f64,
    pub bw_profile: BwProfile,
    pub br_address_template: String,
    pub br_mtu: u32,
    pub br_link_to: LinkTo,
    pub deprecates: Option<i64>,
}

impl Offer {
    /// Checks the structural invariants that can be verified from a single
    /// row: lifespan/profile-length agreement,
    /// `br_mtu` range, `br_address_template` well-formedness. Acyclicity and
    /// successor-uniqueness of the `deprecates` chain are store-level
    /// concerns (a new offer's `deprecates` always points at a strictly
    /// lower, already-persisted id, so the chain cannot cycle; the store
    /// enforces "at most one successor" with a uniqueness constraint on
    /// `deprecates`).
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.notafter <= self.notbefore {
            return Err(ModelError::NonPositiveLifespan);
        }
        let lifespan_secs = (self.notafter - self.notbefore).num_seconds();
        if lifespan_secs % BW_PERIOD_SECS != 0 {
            return Err(ModelError::LifespanNotMultipleOfPeriod);
        }
        let expected_len = (lifespan_secs / BW_PERIOD_SECS) as usize;
        if self.bw_profile.len() != expected_len {
            return Err(ModelError::ProfileLengthMismatch {
                expected: expected_len,
                actual: self.bw_profile.len(),
            });
        }
        if !(100..=65534).contains(&self.br_mtu) {
            return Err(ModelError::MtuOutOfRange(self.br_mtu));
        }
        ip_port_range_from_str(&self.br_address_template)?;
        Ok(())
    }

    /// "Available" means having no successor — callers (the store) are
    /// responsible for checking that externally; this helper only reflects
    /// the signature role implied by whether the offer deprecates another.
    pub fn is_root(&self) -> bool {
        self.deprecates.is_none()
    }

    fn wire_fields(&self) -> OfferFields<'_> {
        OfferFields {
            iaid: self.iaid.as_str(),
            notbefore_secs: self.notbefore.timestamp(),
            notafter_secs: self.notafter.timestamp(),
            reachable_paths: &self.reachable_paths,
            qos_class: self.qos_class,
            price_per_unit: self.price_per_unit,
            bw_profile: &self.bw_profile.to_csv(),
            br_address_template: &self.br_address_template,
            br_mtu: self.br_mtu,
            br_link_to: self.br_link_to,
        }
    }

    /// Canonical bytes of this offer (always with an empty signature field).
    pub fn canonical_bytes(&self) -> Vec<u8> {
        wire::offer_bytes(&self.wire_fields())
    }
}

/// A buyer-signed request binding an intent to a specific offer.
#[derive(Debug, Clone)]
pub struct PurchaseOrder {
    pub id: Option<i64>,
    pub offer_id: i64,
    pub buyer_iaid: Ia,
    pub signature: String,
    pub bw_profile: BwProfile,
    pub starting_on: DateTime<Utc>,
}

impl PurchaseOrder {
    pub fn canonical_bytes(&self, requested_offer: &Offer) -> Vec<u8> {
        wire::purchase_order_bytes(
            &requested_offer.wire_fields(),
            self.buyer_iaid.as_str(),
            &self.bw_profile.to_csv(),
            self.starting_on.timestamp(),
        )
    }
}

/// A broker-signed record of a completed purchase.
#[derive(Debug, Clone)]
pub struct Contract {
    pub id: Option<i64>,
    pub purchase_order_id: i64,
    pub timestamp: DateTime<Utc>,
    pub br_address: String,
    pub signature_broker: String,
}

impl Contract {
    pub fn canonical_bytes(&self, purchase_order_bytes: &[u8], buyer_signature_b64: &str) -> Vec<u8> {
        wire::contract_bytes(
            purchase_order_bytes,
            buyer_signature_b64,
            self.timestamp.timestamp(),
            &self.br_address,
        )
    }
}
