//! IP / CIDR matching used by multiple pipeline stages (`IpFilter`,
//! `RelayControl`, `MessageRateLimit` exemptions, ...).
//!
//! Two operations: [`parse_rule`] turns a textual rule into an [`IpRule`],
//! [`ip_matches`] tests an address against a parsed rule.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// A parsed IP matching rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpRule {
    /// `127.0.0.0/8` (v4) or `::1` (v6).
    Localhost,
    /// `10.0.0.0/8`, `172.16.0.0/12`, `192.168.0.0/16` (v4) or `fc00::/7` (v6).
    Private,
    /// Matches every address.
    Any,
    /// A single address, matched exactly.
    Exact(IpAddr),
    /// A CIDR range; the network address is normalized by masking.
    Cidr(IpAddr, u8),
}

/// Error returned by [`parse_rule`] for malformed input.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IpRuleParseError {
    #[error("could not parse `{0}` as an IP address or CIDR rule")]
    InvalidAddress(String),
    #[error("prefix length `{0}` out of range for {1}")]
    PrefixOutOfRange(u8, &'static str),
}

/// Parse a textual rule: a keyword (`localhost`, `private`, `any`), a bare
/// address, or an `ADDR/PREFIX` CIDR range.
pub fn parse_rule(s: &str) -> Result<IpRule, IpRuleParseError> {
    match s {
        "localhost" => return Ok(IpRule::Localhost),
        "private" => return Ok(IpRule::Private),
        "any" => return Ok(IpRule::Any),
        _ => {}
    }

    if let Some((addr, prefix)) = s.split_once('/') {
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| IpRuleParseError::InvalidAddress(s.to_string()))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| IpRuleParseError::InvalidAddress(s.to_string()))?;

        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(IpRuleParseError::PrefixOutOfRange(
                prefix,
                if max == 32 { "IPv4" } else { "IPv6" },
            ));
        }

        return Ok(IpRule::Cidr(mask_network(addr, prefix), prefix));
    }

    let addr: IpAddr = s
        .parse()
        .map_err(|_| IpRuleParseError::InvalidAddress(s.to_string()))?;
    Ok(IpRule::Exact(addr))
}

/// Parse a rule, logging and dropping it on failure (callers must never
/// apply an invalid rule).
pub fn parse_rule_or_drop(s: &str) -> Option<IpRule> {
    match parse_rule(s) {
        Ok(rule) => Some(rule),
        Err(error) => {
            tracing::error!(rule = s, %error, "dropping invalid IP rule");
            None
        }
    }
}

/// Test whether `addr` falls within `rule`. Mixed address families never
/// match each other, except for `Any` / `Localhost` / `Private`, which each
/// cover both families explicitly.
#[must_use]
pub fn ip_matches(addr: &IpAddr, rule: &IpRule) -> bool {
    match rule {
        IpRule::Any => true,
        IpRule::Localhost => match addr {
            IpAddr::V4(v4) => u32::from(*v4) >> 24 == u32::from(Ipv4Addr::LOCALHOST) >> 24,
            IpAddr::V6(v6) => *v6 == Ipv6Addr::LOCALHOST,
        },
        IpRule::Private => match addr {
            IpAddr::V4(v4) => {
                let bits = u32::from(*v4);
                bits >> 24 == 10
                    || bits >> 20 == u32::from(Ipv4Addr::new(172, 16, 0, 0)) >> 20
                    || bits >> 16 == u32::from(Ipv4Addr::new(192, 168, 0, 0)) >> 16
            }
            IpAddr::V6(v6) => {
                let bits = u128::from(*v6);
                bits >> (128 - 7) == u128::from(0xfc00_u16) >> (16 - 7)
            }
        },
        IpRule::Exact(rule_addr) => addr == rule_addr,
        IpRule::Cidr(network, prefix) => match (addr, network) {
            (IpAddr::V4(addr), IpAddr::V4(network)) => {
                top_bits_match(u32::from(*addr), u32::from(*network), *prefix, 32)
            }
            (IpAddr::V6(addr), IpAddr::V6(network)) => {
                top_bits_match(u128::from(*addr), u128::from(*network), *prefix, 128)
            }
            _ => false,
        },
    }
}

fn top_bits_match<T>(addr: T, network: T, prefix: u8, width: u32) -> bool
where
    T: Copy
        + PartialEq
        + std::ops::Shr<u32, Output = T>
        + std::ops::BitAnd<Output = T>
        + From<u8>,
{
    if prefix as u32 == width {
        return addr == network;
    }
    let shift = width - u32::from(prefix);
    (addr >> shift) == (network >> shift)
}

fn mask_network(addr: IpAddr, prefix: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let masked = if prefix == 0 {
                0
            } else {
                bits & (u32::MAX << (32 - u32::from(prefix)))
            };
            IpAddr::V4(Ipv4Addr::from(masked))
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let masked = if prefix == 0 {
                0
            } else {
                bits & (u128::MAX << (128 - u32::from(prefix)))
            };
            IpAddr::V6(Ipv6Addr::from(masked))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_parse() {
        assert_eq!(parse_rule("localhost").unwrap(), IpRule::Localhost);
        assert_eq!(parse_rule("private").unwrap(), IpRule::Private);
        assert_eq!(parse_rule("any").unwrap(), IpRule::Any);
    }

    #[test]
    fn localhost_matches_both_families() {
        let rule = IpRule::Localhost;
        assert!(ip_matches(&"127.0.0.1".parse().unwrap(), &rule));
        assert!(ip_matches(&"127.255.255.255".parse().unwrap(), &rule));
        assert!(ip_matches(&"::1".parse().unwrap(), &rule));
        assert!(!ip_matches(&"10.0.0.1".parse().unwrap(), &rule));
    }

    #[test]
    fn private_matches_rfc1918_and_fc00() {
        let rule = IpRule::Private;
        assert!(ip_matches(&"10.1.2.3".parse().unwrap(), &rule));
        assert!(ip_matches(&"172.16.0.1".parse().unwrap(), &rule));
        assert!(ip_matches(&"172.31.255.255".parse().unwrap(), &rule));
        assert!(!ip_matches(&"172.32.0.1".parse().unwrap(), &rule));
        assert!(ip_matches(&"192.168.1.1".parse().unwrap(), &rule));
        assert!(!ip_matches(&"8.8.8.8".parse().unwrap(), &rule));
        assert!(ip_matches(&"fc00::1".parse().unwrap(), &rule));
        assert!(!ip_matches(&"fe80::1".parse().unwrap(), &rule));
    }

    #[test]
    fn cidr_v4_normalizes_and_matches() {
        let rule = parse_rule("203.0.113.7/24").unwrap();
        assert_eq!(rule, IpRule::Cidr("203.0.113.0".parse().unwrap(), 24));
        assert!(ip_matches(&"203.0.113.200".parse().unwrap(), &rule));
        assert!(!ip_matches(&"203.0.114.1".parse().unwrap(), &rule));
    }

    #[test]
    fn cidr_v6_matches() {
        let rule = parse_rule("2001:db8::/32").unwrap();
        assert!(ip_matches(&"2001:db8::1".parse().unwrap(), &rule));
        assert!(!ip_matches(&"2001:db9::1".parse().unwrap(), &rule));
    }

    #[test]
    fn mixed_families_never_match() {
        let rule = parse_rule("203.0.113.0/24").unwrap();
        assert!(!ip_matches(&"::1".parse().unwrap(), &rule));
    }

    #[test]
    fn out_of_range_prefix_is_rejected() {
        assert!(matches!(
            parse_rule("10.0.0.0/33"),
            Err(IpRuleParseError::PrefixOutOfRange(33, "IPv4"))
        ));
        assert!(matches!(
            parse_rule("::1/129"),
            Err(IpRuleParseError::PrefixOutOfRange(129, "IPv6"))
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_rule("not-an-ip").is_err());
        assert!(parse_rule_or_drop("not-an-ip").is_none());
    }
}
