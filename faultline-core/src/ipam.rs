//! Deterministic IPv4 allocation for isolated test networks.
//!
//! A [`NetworkAddressSpace`] hands out sequential host addresses from a CIDR
//! block. The gateway is reserved, so the first allocation is `gateway + 1`.
//!
//! ```text
//! 10.0.0.0/16, gateway 10.0.0.1
//!   next_address() -> 10.0.0.2
//!   next_address() -> 10.0.0.3
//!   ...
//!   next_address() -> 10.0.255.255
//!   next_address() -> Err(Exhausted)   (cursor unchanged)
//! ```
//!
//! Incrementing is done octet by octet with carry, so `a.b.c.255` becomes
//! `a.b.(c+1).0`. A carry out of the most significant octet, or a value past
//! the end of the block, is reported as exhaustion rather than wrapping.

use std::fmt;
use std::net::Ipv4Addr;

use crate::error::AddressError;

/// Address bookkeeping for one test network.
///
/// The cursor holds the most recently issued address (the gateway before the
/// first allocation) and always lies within `[min, max]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddressSpace {
    gateway: Ipv4Addr,
    prefix_len: u8,
    cursor: [u8; 4],
    min: u32,
    max: u32,
}

impl NetworkAddressSpace {
    /// Create an address space for `subnet` (CIDR notation) with the given gateway.
    ///
    /// The subnet is normalized to its network base, so `10.0.3.7/16` is the
    /// same block as `10.0.0.0/16`.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError::InvalidSubnet`] if the CIDR does not parse or
    /// the gateway lies outside the block.
    pub fn new(gateway: Ipv4Addr, subnet: &str) -> Result<Self, AddressError> {
        let (addr, prefix_len) = parse_cidr(subnet)?;

        let host_bits = 32 - u32::from(prefix_len);
        let mask = u32::MAX.checked_shl(host_bits).unwrap_or(0);
        let min = u32::from(addr) & mask;
        let max = (u64::from(min) + (1u64 << host_bits) - 1) as u32;

        let gw = u32::from(gateway);
        if gw < min || gw > max {
            return Err(AddressError::InvalidSubnet {
                subnet: subnet.to_string(),
                reason: format!(
                    "gateway {} is outside {}-{}",
                    gateway,
                    Ipv4Addr::from(min),
                    Ipv4Addr::from(max)
                ),
            });
        }

        Ok(Self {
            gateway,
            prefix_len,
            cursor: gateway.octets(),
            min,
            max,
        })
    }

    /// Parse both the gateway and the subnet from strings.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError::InvalidGateway`] if the gateway does not parse,
    /// otherwise the same errors as [`new`](Self::new).
    pub fn parse(gateway: &str, subnet: &str) -> Result<Self, AddressError> {
        let gateway: Ipv4Addr = gateway
            .trim()
            .parse()
            .map_err(|_| AddressError::InvalidGateway(gateway.to_string()))?;
        Self::new(gateway, subnet)
    }

    /// Allocate the next address.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError::Exhausted`] when the block has no addresses
    /// left. The cursor is not modified, so the call can be retried safely.
    pub fn next_address(&mut self) -> Result<Ipv4Addr, AddressError> {
        let candidate = match increment(self.cursor) {
            Some(octets) if u32::from_be_bytes(octets) <= self.max => octets,
            _ => return Err(self.exhausted()),
        };

        self.cursor = candidate;
        Ok(Ipv4Addr::from(candidate))
    }

    /// The reserved gateway address.
    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    /// The most recently issued address, or the gateway before any allocation.
    pub fn cursor(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.cursor)
    }

    /// Network base address (lowest address in the block).
    pub fn min(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.min)
    }

    /// Highest address in the block.
    pub fn max(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.max)
    }

    /// Prefix length of the block.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Normalized CIDR notation, e.g. `10.0.0.0/16`.
    pub fn subnet(&self) -> String {
        format!("{}/{}", self.min(), self.prefix_len)
    }

    /// Whether `addr` lies inside the block.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        (self.min..=self.max).contains(&u32::from(addr))
    }

    /// Number of addresses that can still be allocated.
    pub fn remaining(&self) -> u32 {
        self.max - u32::from_be_bytes(self.cursor)
    }

    fn exhausted(&self) -> AddressError {
        AddressError::Exhausted {
            subnet: self.subnet(),
            last: self.cursor(),
        }
    }
}

impl fmt::Display for NetworkAddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (gateway {})", self.subnet(), self.gateway)
    }
}

/// Add one to an address, least significant octet first.
///
/// Returns `None` if the carry runs out of the most significant octet.
fn increment(octets: [u8; 4]) -> Option<[u8; 4]> {
    let mut next = octets;
    for octet in next.iter_mut().rev() {
        let (value, carry) = octet.overflowing_add(1);
        *octet = value;
        if !carry {
            return Some(next);
        }
    }
    None
}

fn parse_cidr(subnet: &str) -> Result<(Ipv4Addr, u8), AddressError> {
    let invalid = |reason: &str| AddressError::InvalidSubnet {
        subnet: subnet.to_string(),
        reason: reason.to_string(),
    };

    let (addr, prefix) = subnet
        .trim()
        .split_once('/')
        .ok_or_else(|| invalid("expected address/prefix"))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| invalid("network address is not IPv4"))?;
    let prefix_len: u8 = prefix
        .parse()
        .map_err(|_| invalid("prefix length is not a number"))?;
    if prefix_len > 32 {
        return Err(invalid("prefix length must be at most 32"));
    }

    Ok((addr, prefix_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn first_allocations_follow_gateway() {
        let mut space = NetworkAddressSpace::parse("10.0.0.1", "10.0.0.0/16").unwrap();

        assert_eq!(space.next_address().unwrap(), ip("10.0.0.2"));
        assert_eq!(space.next_address().unwrap(), ip("10.0.0.3"));
        assert_eq!(space.next_address().unwrap(), ip("10.0.0.4"));
    }

    #[test]
    fn bounds_are_computed_from_prefix() {
        let space = NetworkAddressSpace::parse("172.20.0.1", "172.20.5.9/16").unwrap();

        assert_eq!(space.min(), ip("172.20.0.0"));
        assert_eq!(space.max(), ip("172.20.255.255"));
        assert_eq!(space.subnet(), "172.20.0.0/16");
        assert_eq!(space.cursor(), ip("172.20.0.1"));
        assert!(space.contains(ip("172.20.200.3")));
        assert!(!space.contains(ip("172.21.0.0")));
    }

    #[test]
    fn gateway_outside_subnet_is_rejected() {
        let err = NetworkAddressSpace::parse("10.1.0.1", "10.0.0.0/16").unwrap_err();
        assert!(matches!(err, AddressError::InvalidSubnet { .. }));
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        assert!(matches!(
            NetworkAddressSpace::parse("not-an-ip", "10.0.0.0/16"),
            Err(AddressError::InvalidGateway(_))
        ));
        for subnet in ["10.0.0.0", "10.0.0/16", "10.0.0.0/33", "10.0.0.0/x"] {
            assert!(
                matches!(
                    NetworkAddressSpace::parse("10.0.0.1", subnet),
                    Err(AddressError::InvalidSubnet { .. })
                ),
                "{} should be rejected",
                subnet
            );
        }
    }

    #[test]
    fn carry_into_third_octet() {
        let mut space = NetworkAddressSpace::new(ip("10.0.0.254"), "10.0.0.0/8").unwrap();
        assert_eq!(space.next_address().unwrap(), ip("10.0.0.255"));
        assert_eq!(space.next_address().unwrap(), ip("10.0.1.0"));
    }

    #[test]
    fn carry_into_second_octet() {
        let mut space = NetworkAddressSpace::new(ip("10.0.255.254"), "10.0.0.0/8").unwrap();
        assert_eq!(space.next_address().unwrap(), ip("10.0.255.255"));
        assert_eq!(space.next_address().unwrap(), ip("10.1.0.0"));
    }

    #[test]
    fn triple_carry_into_first_octet() {
        let mut space = NetworkAddressSpace::new(ip("10.255.255.254"), "0.0.0.0/0").unwrap();
        assert_eq!(space.next_address().unwrap(), ip("10.255.255.255"));
        assert_eq!(space.next_address().unwrap(), ip("11.0.0.0"));
    }

    #[test]
    fn triple_carry_past_block_end_fails() {
        let mut space = NetworkAddressSpace::new(ip("10.255.255.254"), "10.0.0.0/8").unwrap();
        assert_eq!(space.next_address().unwrap(), ip("10.255.255.255"));

        let err = space.next_address().unwrap_err();
        assert!(matches!(err, AddressError::Exhausted { .. }));
        assert_eq!(space.cursor(), ip("10.255.255.255"));
    }

    #[test]
    fn carry_out_of_top_octet_fails_instead_of_wrapping() {
        let mut space =
            NetworkAddressSpace::new(ip("255.255.255.254"), "0.0.0.0/0").unwrap();
        assert_eq!(space.next_address().unwrap(), ip("255.255.255.255"));
        assert!(space.next_address().is_err());
        assert!(space.next_address().is_err());
        assert_eq!(space.cursor(), ip("255.255.255.255"));
    }

    #[test]
    fn increment_cascades_through_every_octet() {
        let cases = [
            ([1, 2, 3, 4], Some([1, 2, 3, 5])),
            ([1, 2, 3, 255], Some([1, 2, 4, 0])),
            ([1, 2, 255, 255], Some([1, 3, 0, 0])),
            ([1, 255, 255, 255], Some([2, 0, 0, 0])),
            ([0, 0, 255, 254], Some([0, 0, 255, 255])),
            ([254, 255, 255, 255], Some([255, 0, 0, 0])),
            ([255, 255, 255, 255], None),
        ];
        for (input, expected) in cases {
            assert_eq!(increment(input), expected, "incrementing {:?}", input);
        }
    }

    #[test]
    fn full_block_is_allocatable_then_exhausted() {
        // 8 host bits: 2^8 - 2 addresses after the gateway at base + 1.
        for (prefix, host_bits) in [(24u8, 8u32), (30, 2), (20, 12)] {
            let subnet = format!("192.168.0.0/{}", prefix);
            let mut space = NetworkAddressSpace::parse("192.168.0.1", &subnet).unwrap();

            let expected = (1u32 << host_bits) - 2;
            for _ in 0..expected {
                space.next_address().unwrap();
            }
            assert_eq!(space.remaining(), 0);

            let before = space.cursor();
            let err = space.next_address().unwrap_err();
            assert_eq!(
                err,
                AddressError::Exhausted {
                    subnet: subnet.clone(),
                    last: before,
                }
            );
            assert_eq!(space.cursor(), before);
        }
    }

    #[test]
    fn slash_32_has_no_room() {
        let mut space = NetworkAddressSpace::parse("10.9.9.9", "10.9.9.9/32").unwrap();
        assert_eq!(space.min(), space.max());
        assert!(space.next_address().is_err());
    }

    #[test]
    fn allocations_are_unique_and_increasing() {
        let mut space = NetworkAddressSpace::parse("10.0.0.1", "10.0.0.0/22").unwrap();
        let mut last = u32::from(space.cursor());
        while let Ok(addr) = space.next_address() {
            let value = u32::from(addr);
            assert_eq!(value, last + 1);
            last = value;
        }
        assert_eq!(Ipv4Addr::from(last), ip("10.0.3.255"));
    }
}
