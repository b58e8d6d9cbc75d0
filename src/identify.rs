//! Observed-address bookkeeping.
//!
//! Remote peers tell us which address they see our connections coming from.
//! Those reports are the only way a host behind a NAT learns its external
//! address, and they are what the hole-punch CONNECT message offers.

use multiaddr::Multiaddr;
use parking_lot::RwLock;
use tracing::trace;

use crate::protocols::AddressObserver;

/// Maximum observed addresses retained.
pub const MAX_OBSERVED_ADDRS: usize = 16;

/// Addresses other peers reported for us, most recent last.
#[derive(Debug, Default)]
pub struct ObservedAddrs {
    addrs: RwLock<Vec<Multiaddr>>,
}

impl ObservedAddrs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a report. Repeats move the address to the back; the oldest
    /// report is dropped past [`MAX_OBSERVED_ADDRS`].
    pub fn record(&self, addr: Multiaddr) {
        let mut addrs = self.addrs.write();
        addrs.retain(|a| a != &addr);
        trace!(addr = %addr, "observed address reported");
        addrs.push(addr);
        if addrs.len() > MAX_OBSERVED_ADDRS {
            let excess = addrs.len() - MAX_OBSERVED_ADDRS;
            addrs.drain(..excess);
        }
    }

    /// Replace every recorded address.
    pub fn replace(&self, addrs: Vec<Multiaddr>) {
        let mut current = self.addrs.write();
        *current = addrs;
        current.truncate(MAX_OBSERVED_ADDRS);
    }

    pub fn clear(&self) {
        self.addrs.write().clear();
    }

    pub fn len(&self) -> usize {
        self.addrs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.read().is_empty()
    }
}

impl AddressObserver for ObservedAddrs {
    fn observed_addrs(&self) -> Vec<Multiaddr> {
        self.addrs.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> Multiaddr {
        format!("/ip4/203.0.113.7/tcp/{port}").parse().unwrap()
    }

    #[test]
    fn repeated_reports_are_deduplicated() {
        let observed = ObservedAddrs::new();
        observed.record(addr(1));
        observed.record(addr(2));
        observed.record(addr(1));

        assert_eq!(observed.observed_addrs(), vec![addr(2), addr(1)]);
    }

    #[test]
    fn oldest_report_is_dropped_when_full() {
        let observed = ObservedAddrs::new();
        for port in 0..(MAX_OBSERVED_ADDRS as u16 + 3) {
            observed.record(addr(port));
        }

        let addrs = observed.observed_addrs();
        assert_eq!(addrs.len(), MAX_OBSERVED_ADDRS);
        assert_eq!(addrs[0], addr(3));
    }

    #[test]
    fn replace_overrides_reports() {
        let observed = ObservedAddrs::new();
        observed.record(addr(1));
        observed.replace(vec![addr(9)]);

        assert_eq!(observed.observed_addrs(), vec![addr(9)]);
        observed.clear();
        assert!(observed.is_empty());
    }
}
