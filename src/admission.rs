//! Connection admission filter
//!
//! An allow-list of CIDR ranges checked against each peer address before
//! the connection reaches the request handler. No ranges means everyone is
//! allowed.

use crate::binder::BindTarget;
use crate::config::Configuration;
use crate::error::{Error, Result};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// One IPv4 or IPv6 range, e.g. `192.168.0.0/16` or `2001:db8::/32`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNetwork {
    network: IpAddr,
    prefix: u8,
}

impl IpNetwork {
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self> {
        let max = max_prefix(&addr);
        if prefix > max {
            return Err(Error::config(format!("Prefix /{prefix} is too long for {addr}")));
        }
        Ok(Self {
            network: mask(addr, prefix),
            prefix,
        })
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Is `addr` inside this range? IPv4-mapped IPv6 peers match IPv4 ranges.
    pub fn contains(&self, addr: IpAddr) -> bool {
        let addr = match (self.network, addr) {
            (IpAddr::V4(_), IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => return false,
            },
            (IpAddr::V6(_), IpAddr::V4(_)) => return false,
            _ => addr,
        };
        mask(addr, self.prefix) == self.network
    }
}

impl FromStr for IpNetwork {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::config(format!("Invalid network in allowed networks: \"{s}\""));
        let (addr, prefix) = match s.trim().split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s.trim(), None),
        };
        let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
        let prefix = match prefix {
            Some(p) => p.parse().map_err(|_| invalid())?,
            None => max_prefix(&addr),
        };
        Self::new(addr, prefix)
    }
}

impl fmt::Display for IpNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

fn max_prefix(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn mask(addr: IpAddr, prefix: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
            IpAddr::V4((bits & mask).into())
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
            IpAddr::V6((bits & mask).into())
        }
    }
}

/// The admission rule set for a server
#[derive(Debug, Clone, Default)]
pub struct NetworkRestrictions {
    allowed_networks: Vec<IpNetwork>,
}

impl NetworkRestrictions {
    /// Build the rule set from the configuration
    ///
    /// # Errors
    ///
    /// Restrictions on a non-TCP bind target and unparsable ranges are
    /// configuration errors.
    pub fn new(configuration: &Configuration) -> Result<Self> {
        let networks = configuration.allowed_networks();
        if networks.is_empty() {
            return Ok(Self::default());
        }
        let target = BindTarget::parse(&configuration.bind()?)?;
        if !target.is_tcp() {
            return Err(Error::config("Network restrictions can only be used on TCP servers"));
        }
        Self::from_networks(&networks)
    }

    /// Parse a list of ranges without checking the bind target
    pub fn from_networks<S: AsRef<str>>(networks: &[S]) -> Result<Self> {
        let allowed_networks = networks
            .iter()
            .map(|n| n.as_ref().parse())
            .collect::<Result<Vec<IpNetwork>>>()?;
        Ok(Self { allowed_networks })
    }

    pub fn allowed_networks(&self) -> &[IpNetwork] {
        &self.allowed_networks
    }

    pub fn is_restricted(&self) -> bool {
        !self.allowed_networks.is_empty()
    }

    /// Should a connection from `client_address` be allowed? Peers without
    /// an IP address (UNIX sockets) are only allowed when unrestricted.
    pub fn connection_allowed_from(&self, client_address: Option<IpAddr>) -> bool {
        if self.allowed_networks.is_empty() {
            return true;
        }
        match client_address {
            Some(addr) => self.allowed_networks.iter().any(|n| n.contains(addr)),
            None => false,
        }
    }
}
