//! Canonical, deterministic byte encodings of the signed payloads (offer,
//! purchase order, contract, get-contract request). Signatures are computed
//! over exactly these bytes — this module is the wire-compatibility
//! contract. The schema carries `br_address_template`/`br_mtu`/`br_link_to`
//! and formats `price_per_unit` in scientific notation; see `DESIGN.md` for
//! why this schema variant was pinned over an older one that omits those
//! fields.

use crate::model::LinkTo;

/// The fields of an `OfferSpecification` needed to compute its canonical
/// bytes. Decoupled from `crate::model::Offer` so this module has no
/// dependency on how offers are stored.
pub struct OfferFields<'a> {
    pub iaid: &'a str,
    pub notbefore_secs: i64,
    pub notafter_secs: i64,
    pub reachable_paths: &'a str,
    pub qos_class: i32,
    pub price_per_unit: f64,
    pub bw_profile: &'a str,
    pub br_address_template: &'a str,
    pub br_mtu: u32,
    pub br_link_to: LinkTo,
}

/// Canonical offer bytes, always with an empty `signature:` field — this is
/// both what gets signed and what gets embedded (as "offer-without-signature")
/// into a purchase order's canonical bytes.
pub fn offer_bytes(o: &OfferFields<'_>) -> Vec<u8> {
    let mut s = String::new();
    s.push_str("ia:");
    s.push_str(o.iaid);
    s.push_str(&o.notbefore_secs.to_string());
    s.push_str(&o.notafter_secs.to_string());
    s.push_str("reachable:");
    s.push_str(o.reachable_paths);
    s.push_str(&o.qos_class.to_string());
    s.push_str(&format_price_per_unit(o.price_per_unit));
    s.push_str("profile:");
    s.push_str(o.bw_profile);
    s.push_str("br_address_template:");
    s.push_str(o.br_address_template);
    s.push_str("br_mtu:");
    s.push_str(&o.br_mtu.to_string());
    s.push_str("br_link_to:");
    s.push_str(o.br_link_to.as_str());
    s.push_str("signature:");
    s.into_bytes()
}

/// Canonical purchase-order bytes, binding a buyer's intent to the offer
/// bytes *as the buyer saw them* — this may differ from the offer's current
/// available form if an earlier purchase already superseded it.
pub fn purchase_order_bytes(
    requested_offer: &OfferFields<'_>,
    buyer_iaid: &str,
    bw_profile: &str,
    starting_on_secs: i64,
) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"offer:");
    bytes.extend_from_slice(&offer_bytes(requested_offer));
    bytes.extend_from_slice(b"bw_profile:");
    bytes.extend_from_slice(bw_profile.as_bytes());
    bytes.extend_from_slice(b"buyer:");
    bytes.extend_from_slice(buyer_iaid.as_bytes());
    bytes.extend_from_slice(b"starting_on:");
    bytes.extend_from_slice(starting_on_secs.to_string().as_bytes());
    bytes
}

/// Canonical contract bytes. `buyer_signature_b64` is the buyer's signature
/// over the purchase order, base64-encoded; its ASCII bytes are what get
/// folded into the contract's own signed payload (mirrors the
/// `buyer_signature: bytes` parameter in the original serializer, which is
/// documented there as "base64 encoded").
pub fn contract_bytes(
    purchase_order_bytes: &[u8],
    buyer_signature_b64: &str,
    timestamp_secs: i64,
    br_address: &str,
) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"order:");
    bytes.extend_from_slice(purchase_order_bytes);
    bytes.extend_from_slice(b"signature_buyer:");
    bytes.extend_from_slice(buyer_signature_b64.as_bytes());
    bytes.extend_from_slice(b"timestamp:");
    bytes.extend_from_slice(timestamp_secs.to_string().as_bytes());
    bytes.extend_from_slice(b"br_address:");
    bytes.extend_from_slice(br_address.as_bytes());
    bytes
}

/// Canonical get-contract-request bytes. The signature field is always
/// empty — the request signs over its own absence, same as an offer signs
/// over an empty `signature:` field.
pub fn get_contract_request_bytes(contract_id: i64, requester_iaid: &str) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"contract_id:");
    bytes.extend_from_slice(contract_id.to_string().as_bytes());
    bytes.extend_from_slice(b"signature:");
    bytes.extend_from_slice(b"requester_ia:");
    bytes.extend_from_slice(requester_iaid.as_bytes());
    bytes
}

/// Formats a price the same way CPython's `"{:e}".format(x)` does: a
/// six-digit mantissa and a signed, at-least-two-digit exponent. Rust's
/// native `{:e}` formatter elides trailing zeros and omits the exponent
/// sign/padding, so this is implemented by hand rather than relying on it —
/// the exact rendering is part of the signed byte contract and must match
/// byte-for-byte across implementations.
pub fn format_price_per_unit(x: f64) -> String {
    if x == 0.0 {
        let sign = if x.is_sign_negative() { "-" } else { "" };
        return format!("{sign}0.000000e+00");
    }

    let neg = x < 0.0;
    let x_abs = x.abs();
    let mut exp = x_abs.log10().floor() as i32;
    let mut mantissa = x_abs / 10f64.powi(exp);

    // Rounding to 6 decimal places can carry the mantissa up to 10.0.
    let scale = 1_000_000f64;
    let mut rounded = (mantissa * scale).round() / scale;
    if rounded >= 10.0 {
        rounded /= 10.0;
        exp += 1;
    }
    mantissa = rounded;

    let sign = if neg { "-" } else { "" };
    let exp_sign = if exp < 0 { "-" } else { "+" };
    format!("{sign}{mantissa:.6}e{exp_sign}{:02}", exp.abs())
}
