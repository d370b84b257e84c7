//! The JSON topology document model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// `isd_as` plus a map of border routers, keyed by router name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyDocument {
    pub isd_as: String,
    #[serde(default)]
    pub border_routers: BTreeMap<String, BorderRouter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BorderRouter {
    pub internal_addr: String,
    #[serde(default)]
    pub interfaces: BTreeMap<String, Interface>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    pub underlay: Underlay,
    pub isd_as: String,
    pub link_to: String,
    pub mtu: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Underlay {
    pub public: String,
    pub remote: String,
}

/// The synthetic router name into which purchased interfaces are spliced:
/// `br<IA with ':'->'_'>-1111`.
pub fn esdx_router_name(isd_as: &str) -> String {
    format!("br{}-1111", isd_as.replace(':', "_"))
}

impl TopologyDocument {
    /// Pretty-prints with a two-space indent and a trailing newline, matching
    /// the router topology loader's expected pretty-printing.
    pub fn to_pretty_string(&self) -> Result<String, serde_json::Error> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"  ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        serde::Serialize::serialize(self, &mut ser)?;
        let mut s = String::from_utf8(buf).expect("serde_json output is valid UTF-8");
        s.push('\n');
        Ok(s)
    }
}
