//! Offer profile arithmetic: `purchase` and the border-router port walker.
//! Both operations are pure functions over plain data — no store
//! dependency — kept separate from the transaction-bound service layer.

use crate::addr::{ip_port_range_from_str, ip_port_to_str, AddrError};
use crate::model::BW_PERIOD_SECS;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AlgebraError {
    #[error("malformed bw_profile entry: {0}")]
    MalformedProfile(String),
    #[error("starting_on precedes the offer's notbefore")]
    StartsBeforeOffer,
    #[error("starting_on is not aligned to a BW_PERIOD boundary")]
    Misaligned,
    #[error("requested profile extends past the end of the offer")]
    ProfileTooLong,
    #[error("requested bandwidth at slot {0} is negative or exceeds what's available")]
    Unsatisfiable(usize),
    #[error("a zero-volume purchase is forbidden")]
    ZeroVolume,
    #[error("{0}")]
    MalformedAddress(#[from] AddrError),
    #[error("no free port remains in the template's range")]
    PortsExhausted,
}

fn parse_profile(csv: &str) -> Result<Vec<i64>, AlgebraError> {
    csv.split(',')
        .map(|part| {
            part.trim()
                .parse::<i64>()
                .map_err(|_| AlgebraError::MalformedProfile(csv.to_string()))
        })
        .collect()
}

fn format_profile(values: &[i64]) -> String {
    values.iter().map(i64::to_string).collect::<Vec<_>>().join(",")
}

/// Computes the residual profile after purchasing `want` starting at
/// `starting_on_secs` against an offer whose profile is `orig_csv` and whose
/// window begins at `notbefore_secs`.
pub fn purchase(
    orig_csv: &str,
    want_csv: &str,
    starting_on_secs: i64,
    notbefore_secs: i64,
) -> Result<String, AlgebraError> {
    let mut orig = parse_profile(orig_csv)?;
    let want = parse_profile(want_csv)?;

    let offset_seconds = starting_on_secs - notbefore_secs;
    if offset_seconds < 0 {
        return Err(AlgebraError::StartsBeforeOffer);
    }
    if offset_seconds % BW_PERIOD_SECS != 0 {
        return Err(AlgebraError::Misaligned);
    }
    let k = (offset_seconds / BW_PERIOD_SECS) as usize;
    if want.len() > orig.len().saturating_sub(k) {
        return Err(AlgebraError::ProfileTooLong);
    }

    let mut sum_wanted: i64 = 0;
    for (i, &w) in want.iter().enumerate() {
        sum_wanted += w;
        if w < 0 || w > orig[k + i] {
            return Err(AlgebraError::Unsatisfiable(i));
        }
    }
    if sum_wanted == 0 {
        return Err(AlgebraError::ZeroVolume);
    }

    for (i, &w) in want.iter().enumerate() {
        orig[k + i] -= w;
    }
    Ok(format_profile(&orig))
}

/// An already-sold interface in the lineage, as needed by the port walker.
pub struct SoldPredecessor {
    pub br_address: String,
}

/// Finds the next free `IP:port` out of an offer's `br_address_template`,
/// given the nearest predecessor in the lineage that has a sold contract
/// (`None` if the lineage has never sold anything yet).
pub fn find_available_br_address(
    br_address_template: &str,
    nearest_sold_predecessor: Option<&SoldPredecessor>,
) -> Result<String, AlgebraError> {
    let (ip, min_port, max_port) = ip_port_range_from_str(br_address_template)?;

    let port = match nearest_sold_predecessor {
        None => min_port,
        Some(pred) => {
            let (_, used_port) = crate::addr::ip_port_from_str(&pred.br_address)?;
            used_port
                .checked_add(1)
                .ok_or(AlgebraError::PortsExhausted)?
        }
    };

    if port > max_port {
        return Err(AlgebraError::PortsExhausted);
    }
    Ok(ip_port_to_str(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_purchase_leaves_residual_profile() {
        let residual = purchase("2,2,2,2", "2", 0, 0).unwrap();
        assert_eq!(residual, "0,2,2,2");
    }

    #[test]
    fn second_purchase_on_residual_profile() {
        let residual = purchase("0,2,2,2", "2,2,2", BW_PERIOD_SECS, 0).unwrap();
        assert_eq!(residual, "0,0,0,0");
    }

    #[test]
    fn starting_before_offer_fails() {
        assert_eq!(purchase("2,2", "1", -1, 0), Err(AlgebraError::StartsBeforeOffer));
    }

    #[test]
    fn misaligned_start_fails() {
        assert_eq!(purchase("2,2", "1", 1, 0), Err(AlgebraError::Misaligned));
    }

    #[test]
    fn zero_volume_purchase_fails() {
        assert_eq!(purchase("2,2", "0,0", 0, 0), Err(AlgebraError::ZeroVolume));
    }

    #[test]
    fn oversized_request_fails() {
        assert_eq!(purchase("2,2", "3", 0, 0), Err(AlgebraError::Unsatisfiable(0)));
    }

    #[test]
    fn profile_longer_than_remaining_window_fails() {
        assert_eq!(purchase("2,2", "1,1,1", 0, 0), Err(AlgebraError::ProfileTooLong));
    }

    #[test]
    fn port_walk_starts_at_min_port() {
        let addr = find_available_br_address("10.1.1.1:50000-50010", None).unwrap();
        assert_eq!(addr, "10.1.1.1:50000");
    }

    #[test]
    fn port_walk_advances_past_sold_predecessor() {
        let pred = SoldPredecessor { br_address: "10.1.1.1:50000".to_string() };
        let addr = find_available_br_address("10.1.1.1:50000-50010", Some(&pred)).unwrap();
        assert_eq!(addr, "10.1.1.1:50001");
    }

    #[test]
    fn port_walk_at_max_port_is_exhausted() {
        let pred = SoldPredecessor { br_address: "10.1.1.1:50010".to_string() };
        assert_eq!(
            find_available_br_address("10.1.1.1:50000-50010", Some(&pred)),
            Err(AlgebraError::PortsExhausted)
        );
    }

    #[test]
    fn ipv6_template_round_trips() {
        let addr =
            find_available_br_address("[fd00:f00d:cafe::7f00:9]:31018-31020", None).unwrap();
        assert_eq!(addr, "[fd00:f00d:cafe::7f00:9]:31018");
    }
}
