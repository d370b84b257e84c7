//! `Topology`: the file-locked read-modify-write mutator that splices a
//! purchased interface into (or removes one from) the ESDX border router.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use tracing::{debug, info, instrument};

use crate::document::{esdx_router_name, BorderRouter, Interface, TopologyDocument, Underlay};
use crate::lock::{LockError, LockGuard};

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("I/O error reading or writing {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("malformed topology document: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("configured internal_addr {0} collides with an existing non-ESDX router")]
    InternalAddrCollision(String),
    #[error("neither the seller nor the buyer IA matches this topology's isd_as")]
    NeitherPartyMatches,
    #[error("malformed underlay address: {0}")]
    MalformedAddress(String),
    #[error("no free interface id remains")]
    InterfaceIdsExhausted,
    #[error("no free port remains in [{min_port}, {max_port}]")]
    PortsExhausted { min_port: u16, max_port: u16 },
    #[error("no interface with remote underlay {0} exists to deactivate")]
    InterfaceNotFound(String),
}

/// Everything `activate`/`deactivate` need from a contract, decoupled from
/// `esdx-market`'s `Contract` type so this crate has no dependency on it —
/// the topology mutator is triggered by a separate admin flow, not inline
/// with the purchase transaction.
pub struct ContractActivation {
    pub seller_iaid: String,
    pub buyer_iaid: String,
    /// The concrete `IP:port` the remote party is reachable at — the
    /// contract's `br_address`.
    pub remote_underlay: String,
    pub link_to: String,
    pub mtu: u32,
}

pub struct ContractDeactivation {
    pub remote_underlay: String,
}

/// Maps a remote peer's IP family to the local interface IP used for the
/// `public` side of the splice. Default: loopback per family.
pub fn default_local_interface(remote: IpAddr) -> IpAddr {
    match remote {
        IpAddr::V4(_) => IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
        IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
    }
}

/// CLI-adjacent configuration for a `Topology` handle.
#[derive(Debug, Clone, Parser)]
pub struct TopologyConfig {
    /// Path to the topology JSON document.
    #[arg(long, env = "ESDX_TOPOLOGY_PATH")]
    pub path: PathBuf,
    /// `internal_addr` used if the ESDX border router does not yet exist.
    #[arg(long, env = "ESDX_TOPOLOGY_INTERNAL_ADDR")]
    pub internal_addr: String,
    #[arg(long, env = "ESDX_TOPOLOGY_MIN_PORT", default_value_t = 50000)]
    pub min_port: u16,
    #[arg(long, env = "ESDX_TOPOLOGY_MAX_PORT", default_value_t = 51000)]
    pub max_port: u16,
    #[arg(long, env = "ESDX_TOPOLOGY_LOCK_ATTEMPTS", default_value_t = 10)]
    pub lock_attempts: u32,
    #[arg(long, env = "ESDX_TOPOLOGY_LOCK_SLEEP_MS", default_value_t = 100)]
    pub lock_sleep_ms: u64,
}

/// A handle onto one topology file. Operations acquire the file lock for
/// their duration; distinct `Topology` handles on distinct files never
/// contend.
pub struct Topology {
    path: PathBuf,
    internal_addr: String,
    min_port: u16,
    max_port: u16,
    lock_attempts: u32,
    lock_sleep: Duration,
    local_interface: fn(IpAddr) -> IpAddr,
}

impl Topology {
    /// Opens the topology file, checking at construction time that
    /// `internal_addr` does not collide with any existing non-ESDX router.
    pub fn open(config: TopologyConfig) -> Result<Self, TopologyError> {
        let topo = Self {
            path: config.path,
            internal_addr: config.internal_addr,
            min_port: config.min_port,
            max_port: config.max_port,
            lock_attempts: config.lock_attempts,
            lock_sleep: Duration::from_millis(config.lock_sleep_ms),
            local_interface: default_local_interface,
        };
        let doc = topo.read_unlocked()?;
        let esdx_name = esdx_router_name(&doc.isd_as);
        for (name, router) in &doc.border_routers {
            if name != &esdx_name && router.internal_addr == topo.internal_addr {
                return Err(TopologyError::InternalAddrCollision(topo.internal_addr.clone()));
            }
        }
        Ok(topo)
    }

    /// Overrides the remote-IP-to-local-interface mapping; used in tests and
    /// by deployments with a non-default local address scheme.
    pub fn with_local_interface_mapper(mut self, f: fn(IpAddr) -> IpAddr) -> Self {
        self.local_interface = f;
        self
    }

    fn read_unlocked(&self) -> Result<TopologyDocument, TopologyError> {
        let bytes = fs::read(&self.path).map_err(|e| TopologyError::Io { path: self.path.clone(), source: e })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write_unlocked(&self, doc: &TopologyDocument) -> Result<(), TopologyError> {
        let pretty = doc.to_pretty_string()?;
        fs::write(&self.path, pretty).map_err(|e| TopologyError::Io { path: self.path.clone(), source: e })
    }

    fn acquire_lock(&self) -> Result<LockGuard, TopologyError> {
        Ok(LockGuard::acquire(&self.path, self.lock_attempts, self.lock_sleep)?)
    }

    /// Splices the purchased interface into the ESDX border router.
    #[instrument(skip(self, contract))]
    pub fn activate(&self, contract: &ContractActivation) -> Result<(), TopologyError> {
        let _lock = self.acquire_lock()?;
        let mut doc = self.read_unlocked()?;

        let remote_ia = if contract.seller_iaid == doc.isd_as {
            &contract.buyer_iaid
        } else if contract.buyer_iaid == doc.isd_as {
            &contract.seller_iaid
        } else {
            return Err(TopologyError::NeitherPartyMatches);
        };

        let (remote_ip, remote_port) = parse_ip_port(&contract.remote_underlay)?;
        let local_ip = (self.local_interface)(remote_ip);

        let esdx_name = esdx_router_name(&doc.isd_as);
        let next_ifid = lowest_free_interface_id(&doc);
        let public_port = self.lowest_free_port(&doc, local_ip)?;

        let router = doc.border_routers.entry(esdx_name.clone()).or_insert_with(|| {
            debug!(router = %esdx_name, "creating ESDX border router");
            BorderRouter { internal_addr: self.internal_addr.clone(), interfaces: Default::default() }
        });

        router.interfaces.insert(
            next_ifid.to_string(),
            Interface {
                underlay: Underlay {
                    public: format!("{local_ip}:{public_port}"),
                    remote: contract.remote_underlay.clone(),
                },
                isd_as: remote_ia.clone(),
                link_to: contract.link_to.clone(),
                mtu: contract.mtu,
            },
        );

        self.write_unlocked(&doc)?;
        info!(router = %esdx_name, ifid = next_ifid, "activated interface");
        Ok(())
    }

    /// Removes the interface whose `underlay.remote` matches, and the ESDX
    /// router entry itself if it becomes empty.
    #[instrument(skip(self, contract))]
    pub fn deactivate(&self, contract: &ContractDeactivation) -> Result<(), TopologyError> {
        let _lock = self.acquire_lock()?;
        let mut doc = self.read_unlocked()?;
        let esdx_name = esdx_router_name(&doc.isd_as);

        let Some(router) = doc.border_routers.get_mut(&esdx_name) else {
            return Err(TopologyError::InterfaceNotFound(contract.remote_underlay.clone()));
        };
        let ifid = router
            .interfaces
            .iter()
            .find(|(_, iface)| iface.underlay.remote == contract.remote_underlay)
            .map(|(id, _)| id.clone())
            .ok_or_else(|| TopologyError::InterfaceNotFound(contract.remote_underlay.clone()))?;
        router.interfaces.remove(&ifid);

        if router.interfaces.is_empty() {
            doc.border_routers.remove(&esdx_name);
            info!(router = %esdx_name, "removed empty ESDX border router");
        } else {
            info!(router = %esdx_name, ifid, "deactivated interface");
        }

        self.write_unlocked(&doc)
    }

    fn lowest_free_port(&self, doc: &TopologyDocument, local_ip: IpAddr) -> Result<u16, TopologyError> {
        let used: std::collections::HashSet<u16> = doc
            .border_routers
            .values()
            .flat_map(|r| r.interfaces.values())
            .filter_map(|iface| parse_ip_port(&iface.underlay.public).ok())
            .filter(|(ip, _)| *ip == local_ip)
            .map(|(_, port)| port)
            .collect();
        (self.min_port..=self.max_port)
            .find(|p| !used.contains(p))
            .ok_or(TopologyError::PortsExhausted { min_port: self.min_port, max_port: self.max_port })
    }
}

/// Lowest free interface id ≥ 1, scanned across *every* router in the
/// document. This scan is global and independent of the ESDX router's own
/// fixed `-1111` name suffix.
fn lowest_free_interface_id(doc: &TopologyDocument) -> u32 {
    let used: std::collections::HashSet<u32> = doc
        .border_routers
        .values()
        .flat_map(|r| r.interfaces.keys())
        .filter_map(|id| id.parse().ok())
        .collect();
    (1u32..).find(|id| !used.contains(id)).expect("u32 range is never exhausted in practice")
}

fn parse_ip_port(s: &str) -> Result<(IpAddr, u16), TopologyError> {
    let err = || TopologyError::MalformedAddress(s.to_string());
    if let Some(rest) = s.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(err)?;
        let ip: IpAddr = rest[..end].parse().map_err(|_| err())?;
        let port: u16 = rest[end + 1..].strip_prefix(':').ok_or_else(err)?.parse().map_err(|_| err())?;
        Ok((ip, port))
    } else {
        let idx = s.rfind(':').ok_or_else(err)?;
        let ip: IpAddr = s[..idx].parse().map_err(|_| err())?;
        let port: u16 = s[idx + 1..].parse().map_err(|_| err())?;
        Ok((ip, port))
    }
}
