//! ISD-AS identity parsing and `IP:port` / `IP:port-port` address parsing.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// The largest port usable anywhere in this crate. `65535` itself is always
/// rejected — both as a standalone port and as a range bound — because it
/// collides with the inclusive range-upper-bound check used by offer
/// templates.
const MAX_PORT: u32 = 65534;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddrError {
    #[error("malformed ISD-AS string: {0}")]
    MalformedIa(String),
    #[error("malformed IP:port address: {0}")]
    MalformedAddress(String),
    #[error("port {0} out of range (max {MAX_PORT})")]
    PortOutOfRange(u32),
}

/// A validated `ISD-AS` identity, e.g. `1-ff00:0:110` or the decimal-BGP form
/// `1-1234`. Stored as the original string (never reformatted) since the
/// store persists it verbatim as the primary key of `AS`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ia(String);

impl Ia {
    pub fn parse(s: impl Into<String>) -> Result<Self, AddrError> {
        let s = s.into();
        ia_str_to_int(&s)?;
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Ia {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Parses and validates an ISD-AS string, returning its packed 64-bit
/// representation (16-bit ISD in the high bits, 48-bit AS number in the
/// low bits).
fn ia_str_to_int(ia: &str) -> Result<u64, AddrError> {
    let err = || AddrError::MalformedIa(ia.to_string());

    let parts: Vec<&str> = ia.split('-').collect();
    if parts.len() != 2 {
        return Err(err());
    }
    let isd_part = parts[0];
    if isd_part.trim() != isd_part {
        return Err(err());
    }
    let isd: u64 = isd_part.parse().map_err(|_| err())?;
    if isd > 65535 {
        return Err(err());
    }

    let as_parts: Vec<&str> = parts[1].split(':').collect();
    let as_value: u64 = if as_parts.len() == 1 {
        let p = as_parts[0];
        if p.trim() != p {
            return Err(err());
        }
        let v: u64 = p.parse().map_err(|_| err())?;
        if v > (1u64 << 32) - 1 {
            return Err(err());
        }
        v
    } else if as_parts.len() == 3 {
        let mut v: u64 = 0;
        for group in &as_parts {
            if group.trim() != *group {
                return Err(err());
            }
            v <<= 16;
            let g = u64::from_str_radix(group, 16).map_err(|_| err())?;
            if g > 65535 {
                return Err(err());
            }
            v |= g;
        }
        if v > (1u64 << 48) - 1 {
            return Err(err());
        }
        v
    } else {
        return Err(err());
    };

    Ok((isd << 48) | as_value)
}

enum Host<'a> {
    V4(&'a str),
    V6(&'a str),
}

fn split_host_and_rest(s: &str) -> Result<(Host<'_>, &str), AddrError> {
    let err = || AddrError::MalformedAddress(s.to_string());
    if let Some(rest) = s.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(err)?;
        let host = &rest[..end];
        let after = rest[end + 1..].strip_prefix(':').ok_or_else(err)?;
        Ok((Host::V6(host), after))
    } else {
        let idx = s.rfind(':').ok_or_else(err)?;
        Ok((Host::V4(&s[..idx]), &s[idx + 1..]))
    }
}

fn parse_port_digits(s: &str) -> Result<u32, AddrError> {
    let err = || AddrError::MalformedAddress(s.to_string());
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(err());
    }
    s.parse::<u32>().map_err(|_| err())
}

fn parse_port(s: &str) -> Result<u16, AddrError> {
    let v = parse_port_digits(s)?;
    if v > MAX_PORT {
        return Err(AddrError::PortOutOfRange(v));
    }
    Ok(v as u16)
}

/// Parses `IP:port`, IPv4 unbracketed or IPv6 bracketed.
pub fn ip_port_from_str(s: &str) -> Result<(IpAddr, u16), AddrError> {
    let err = || AddrError::MalformedAddress(s.to_string());
    let (host, port_part) = split_host_and_rest(s)?;
    let ip = match host {
        Host::V4(h) => IpAddr::V4(h.parse::<Ipv4Addr>().map_err(|_| err())?),
        Host::V6(h) => IpAddr::V6(h.parse::<Ipv6Addr>().map_err(|_| err())?),
    };
    let port = parse_port(port_part)?;
    Ok((ip, port))
}

/// Formats `(ip, port)` back into `IP:port`, bracketing IPv6 addresses.
pub fn ip_port_to_str(ip: IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{v4}:{port}"),
        IpAddr::V6(v6) => format!("[{v6}]:{port}"),
    }
}

/// Parses `IP:min-max` (a border-router address template), normalizing a
/// swapped bound (`50-42` becomes `min=42, max=50`).
pub fn ip_port_range_from_str(s: &str) -> Result<(IpAddr, u16, u16), AddrError> {
    let err = || AddrError::MalformedAddress(s.to_string());
    let (host, range_part) = split_host_and_rest(s)?;
    let ip = match host {
        Host::V4(h) => IpAddr::V4(h.parse::<Ipv4Addr>().map_err(|_| err())?),
        Host::V6(h) => IpAddr::V6(h.parse::<Ipv6Addr>().map_err(|_| err())?),
    };

    let pieces: Vec<&str> = range_part.split('-').collect();
    if pieces.len() != 2 {
        return Err(err());
    }
    let a = parse_port(pieces[0])?;
    let b = parse_port(pieces[1])?;
    let (min_port, max_port) = if a <= b { (a, b) } else { (b, a) };
    Ok((ip, min_port, max_port))
}

/// Formats `(ip, min_port, max_port)` back into `IP:min-max`.
pub fn ip_port_range_to_str(ip: IpAddr, min_port: u16, max_port: u16) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{v4}:{min_port}-{max_port}"),
        IpAddr::V6(v6) => format!("[{v6}]:{min_port}-{max_port}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_ias_parse() {
        assert!(Ia::parse("1-ff00:0:110").is_ok());
        assert!(Ia::parse("1-1234").is_ok());
        assert!(Ia::parse("65535-ffff:ffff:ffff").is_ok());
    }

    #[test]
    fn invalid_ias_are_rejected() {
        assert!(Ia::parse("1-ff00:0:110-extra").is_err());
        assert!(Ia::parse("65536-1").is_err());
        assert!(Ia::parse("1-1:2:3:4").is_err());
        assert!(Ia::parse("1-10000:0:0").is_err());
        assert!(Ia::parse(" 1-1234").is_err());
        assert!(Ia::parse("1- 1234").is_err());
    }

    #[test]
    fn ip_port_table() {
        let cases: &[(&str, bool, Option<(&str, u16)>)] = &[
            ("1.1.1.1:42", false, Some(("1.1.1.1", 42))),
            ("1.1.1.1:0", false, Some(("1.1.1.1", 0))),
            ("[fd00:f00d:cafe::7f00:9]:42", false, Some(("fd00:f00d:cafe::7f00:9", 42))),
            ("1.1.1:42", true, None),
            ("1.1.1.1", true, None),
            ("1.1.1.1:65535", true, None),
            ("1.1.1.1:-1", true, None),
            ("1.1.1.1:1 1", true, None),
            ("fd00:f00d:cafe::7f00:9:42", true, None),
        ];
        for (input, should_err, expect) in cases {
            let got = ip_port_from_str(input);
            if *should_err {
                assert!(got.is_err(), "expected error for {input}");
            } else {
                let (ip, port) = got.unwrap_or_else(|e| panic!("{input}: {e}"));
                let (exp_ip, exp_port) = expect.unwrap();
                assert_eq!(ip, exp_ip.parse::<IpAddr>().unwrap());
                assert_eq!(port, exp_port);
                assert_eq!(ip_port_to_str(ip, port), *input);
            }
        }
    }

    #[test]
    fn ip_port_range_table() {
        let cases: &[(&str, bool, Option<(&str, u16, u16)>)] = &[
            ("1.1.1.1:42-44", false, Some(("1.1.1.1", 42, 44))),
            ("1.1.1.1:42-42", false, Some(("1.1.1.1", 42, 42))),
            ("[fd00:f00d:cafe::7f00:9]:50-42", false, Some(("fd00:f00d:cafe::7f00:9", 42, 50))),
            ("1.1.1.1:42", true, None),
            ("1.1.1.1:42-", true, None),
            ("1.1.1.1:1-65535", true, None),
            ("1.1.1.1:1 1", true, None),
            ("fd00:f00d:cafe::7f00:9:42-44", true, None),
        ];
        for (input, should_err, expect) in cases {
            let got = ip_port_range_from_str(input);
            if *should_err {
                assert!(got.is_err(), "expected error for {input}");
            } else {
                let (ip, min_port, max_port) = got.unwrap();
                let (exp_ip, exp_min, exp_max) = expect.unwrap();
                assert_eq!(ip, exp_ip.parse::<IpAddr>().unwrap());
                assert_eq!(min_port, exp_min);
                assert_eq!(max_port, exp_max);
            }
        }
    }

    #[test]
    fn blank_ia_segments_are_rejected() {
        assert!(Ia::parse("-1234").is_err());
        assert!(Ia::parse("1-").is_err());
    }
}
