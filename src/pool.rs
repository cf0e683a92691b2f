//! IPv4 address bookkeeping for the managed subnet.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use log::{debug, warn};

use crate::error::{Error, Result};

/// Tracks which host addresses of a subnet are taken.
///
/// The pool never persists anything; it is rebuilt from live network
/// state at startup.
pub struct AddressPool {
    subnet: Ipv4Net,
    reserved: HashSet<Ipv4Addr>,
}

impl AddressPool {
    pub fn new(subnet: Ipv4Net) -> Self {
        Self {
            subnet: subnet.trunc(),
            reserved: HashSet::new(),
        }
    }

    /// Marks an address as taken. Re-reserving is a no-op; the return
    /// value says whether the address was newly reserved. Addresses
    /// outside the subnet's host range are never recorded.
    pub fn reserve(&mut self, ip: Ipv4Addr) -> bool {
        if !self.contains_host(ip) {
            warn!("Ignoring reservation of {} outside {}", ip, self.subnet);
            return false;
        }
        if self.reserved.insert(ip) {
            debug!("Reserving ip {}", ip);
            true
        } else {
            false
        }
    }

    /// Releases a reserved address. Freeing an address that is not
    /// held is a caller bug and fails.
    pub fn free(&mut self, ip: Ipv4Addr) -> Result<()> {
        if self.reserved.remove(&ip) {
            debug!("Freeing ip {}", ip);
            Ok(())
        } else {
            Err(Error::NotReserved(ip))
        }
    }

    /// Returns the next free host address without reserving it.
    ///
    /// Hosts are scanned from the high end of the range downward, away
    /// from the low addresses the network's own IPAM hands out, so
    /// virtual IPs and container addresses rarely collide. Callers
    /// must [`reserve`](Self::reserve) the returned address before
    /// allocating again, or they will see the same address twice.
    pub fn allocate(&self) -> Result<Ipv4Addr> {
        let network = u32::from(self.subnet.network());
        let broadcast = u32::from(self.subnet.broadcast());
        (network.saturating_add(1)..broadcast)
            .rev()
            .map(Ipv4Addr::from)
            .find(|ip| !self.reserved.contains(ip))
            .ok_or(Error::AddressExhausted(self.subnet))
    }

    #[cfg(test)]
    pub fn is_reserved(&self, ip: Ipv4Addr) -> bool {
        self.reserved.contains(&ip)
    }

    fn contains_host(&self, ip: Ipv4Addr) -> bool {
        let host = u32::from(ip);
        u32::from(self.subnet.network()) < host && host < u32::from(self.subnet.broadcast())
    }
}
