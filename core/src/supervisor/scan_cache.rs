//! Short-lived memo of "the peripheral was just heard"

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

use crate::peripheral::{Discovered, PeripheralAddress};

/// One discovery result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCacheEntry {
    pub address: PeripheralAddress,
    pub discovered_at: Instant,
    pub signal_strength: Option<i16>,
}

impl ScanCacheEntry {
    pub fn is_fresh(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.discovered_at) <= ttl
    }
}

/// Scan results keyed by address.
///
/// Callers read and write without any lock beyond the map's own; the worst
/// outcome of a race is one redundant scan.
#[derive(Debug)]
pub struct ScanCache {
    ttl: Duration,
    entries: RwLock<HashMap<PeripheralAddress, ScanCacheEntry>>,
}

impl ScanCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record every device from a scan, refreshing existing entries
    pub fn record_scan(&self, heard: &[Discovered]) {
        let now = Instant::now();
        let mut entries = self.entries.write();
        for device in heard {
            entries.insert(
                device.address.clone(),
                ScanCacheEntry {
                    address: device.address.clone(),
                    discovered_at: now,
                    signal_strength: device.rssi,
                },
            );
        }
    }

    /// The entry for `address`, only while it is within the TTL
    pub fn fresh(&self, address: &PeripheralAddress) -> Option<ScanCacheEntry> {
        let now = Instant::now();
        self.entries
            .read()
            .get(address)
            .filter(|entry| entry.is_fresh(self.ttl, now))
            .cloned()
    }

    pub fn is_fresh(&self, address: &PeripheralAddress) -> bool {
        self.fresh(address).is_some()
    }

    pub fn invalidate(&self, address: &PeripheralAddress) {
        self.entries.write().remove(address);
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heard(address: &str, rssi: i16) -> Discovered {
        Discovered {
            address: PeripheralAddress::new(address).unwrap(),
            name: None,
            rssi: Some(rssi),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = ScanCache::new(Duration::from_secs(30));
        let target = PeripheralAddress::new("AA:BB:CC:DD:EE:FF").unwrap();

        cache.record_scan(&[heard("aa:bb:cc:dd:ee:ff", -60)]);
        assert!(cache.is_fresh(&target));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cache.is_fresh(&target));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!cache.is_fresh(&target));
        assert!(cache.fresh(&target).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescan_refreshes_entry() {
        let cache = ScanCache::new(Duration::from_secs(10));
        let target = PeripheralAddress::new("AA:BB:CC:DD:EE:FF").unwrap();

        cache.record_scan(&[heard("AA:BB:CC:DD:EE:FF", -70)]);
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.record_scan(&[heard("AA:BB:CC:DD:EE:FF", -55)]);
        tokio::time::advance(Duration::from_secs(8)).await;

        let entry = cache.fresh(&target).unwrap();
        assert_eq!(entry.signal_strength, Some(-55));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_and_other_addresses() {
        let cache = ScanCache::new(Duration::from_secs(10));
        let target = PeripheralAddress::new("AA:BB:CC:DD:EE:FF").unwrap();

        cache.record_scan(&[heard("11:22:33:44:55:66", -80)]);
        assert!(!cache.is_fresh(&target));

        cache.record_scan(&[heard("AA:BB:CC:DD:EE:FF", -60)]);
        cache.invalidate(&target);
        assert!(!cache.is_fresh(&target));
    }
}
