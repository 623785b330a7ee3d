use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use log::{debug, info, warn};
use mac_address::MacAddress;

use crate::messages::{DeviceAnnouncement, DevicePresence};

pub const DEFAULT_DEVICE_TIMEOUT: Duration = Duration::from_secs(300);

/// Lowercase hex rendering of a link address without separators,
/// e.g. `aabbccddeeff`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceKey(String);

impl DeviceKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&MacAddress> for DeviceKey {
    fn from(address: &MacAddress) -> Self {
        DeviceKey(
            address
                .bytes()
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect(),
        )
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceRecord {
    pub name: String,
    pub last_seen_ms: u64,
    pub online: bool,
}

/// Online/offline state of every device heard on the link.
///
/// Records are never removed. Silence is the only way a device goes offline:
/// [`PresenceTracker::sweep`] flips any device not heard from for longer than
/// the timeout.
#[derive(Debug)]
pub struct PresenceTracker {
    devices: BTreeMap<DeviceKey, DeviceRecord>,
    timeout_ms: u64,
}

impl PresenceTracker {
    pub fn new(timeout: Duration) -> Self {
        PresenceTracker {
            devices: BTreeMap::new(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn touch(&mut self, key: &DeviceKey, name: &str, now_ms: u64) -> Option<DeviceAnnouncement> {
        let Some(record) = self.devices.get_mut(key) else {
            info!("New device discovered: {} ({})", name, key);
            self.devices.insert(
                key.clone(),
                DeviceRecord {
                    name: name.to_string(),
                    last_seen_ms: now_ms,
                    online: true,
                },
            );
            return Some(announcement(key, name, DevicePresence::Online));
        };

        let was_offline = !record.online;
        record.last_seen_ms = now_ms;
        record.online = true;
        let renamed = record.name != name;
        if renamed {
            debug!("Device {} renamed from {} to {}", key, record.name, name);
            record.name = name.to_string();
        }

        if was_offline {
            info!("Device back online: {} ({})", name, key);
            Some(announcement(key, name, DevicePresence::Online))
        } else if renamed {
            // Availability is keyed by name, so the new name needs its own
            // online status.
            Some(announcement(key, name, DevicePresence::Online))
        } else {
            None
        }
    }

    pub fn sweep(&mut self, now_ms: u64) -> Vec<DeviceAnnouncement> {
        let mut announcements = Vec::new();
        for (key, record) in self.devices.iter_mut() {
            if record.online && now_ms.saturating_sub(record.last_seen_ms) > self.timeout_ms {
                record.online = false;
                warn!(
                    "Device offline: {} ({}), no packets for {} ms",
                    record.name, key, self.timeout_ms
                );
                announcements.push(announcement(key, &record.name, DevicePresence::Offline));
            }
        }
        announcements
    }

    #[cfg(test)]
    pub fn get(&self, key: &DeviceKey) -> Option<&DeviceRecord> {
        self.devices.get(key)
    }

    pub fn online_count(&self) -> usize {
        self.devices.values().filter(|r| r.online).count()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }
}

fn announcement(key: &DeviceKey, name: &str, presence: DevicePresence) -> DeviceAnnouncement {
    DeviceAnnouncement {
        name: name.to_string(),
        device_key: key.clone(),
        presence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DeviceKey {
        DeviceKey::from(&MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]))
    }

    #[test]
    fn test_device_key_format() {
        assert_eq!(key().as_str(), "aabbccddeeff");
        let padded = DeviceKey::from(&MacAddress::new([0x00, 0x01, 0x0a, 0x10, 0xa0, 0xff]));
        assert_eq!(padded.to_string(), "00010a10a0ff");
    }

    #[test]
    fn test_first_touch_announces_online() {
        let mut tracker = PresenceTracker::new(DEFAULT_DEVICE_TIMEOUT);
        let announcement = tracker.touch(&key(), "kitchen", 0);

        assert_eq!(
            announcement,
            Some(DeviceAnnouncement {
                name: "kitchen".to_string(),
                device_key: key(),
                presence: DevicePresence::Online,
            })
        );
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.touch(&key(), "kitchen", 1_000), None);
        assert_eq!(tracker.get(&key()).map(|r| r.last_seen_ms), Some(1_000));
    }

    #[test]
    fn test_sweep_flips_silent_device() {
        let mut tracker = PresenceTracker::new(Duration::from_millis(300_000));
        tracker.touch(&key(), "kitchen", 0);

        assert!(tracker.sweep(299_999).is_empty());
        assert!(tracker.sweep(300_000).is_empty());
        assert_eq!(tracker.online_count(), 1);

        let announcements = tracker.sweep(300_001);
        assert_eq!(announcements.len(), 1);
        assert_eq!(announcements[0].presence, DevicePresence::Offline);
        assert_eq!(tracker.get(&key()).map(|r| r.online), Some(false));

        // Already offline, nothing more to say.
        assert!(tracker.sweep(900_000).is_empty());
    }

    #[test]
    fn test_recovery_after_offline() {
        let mut tracker = PresenceTracker::new(Duration::from_millis(1_000));
        tracker.touch(&key(), "kitchen", 0);
        tracker.sweep(5_000);

        let announcement = tracker.touch(&key(), "kitchen-2", 6_000);
        assert_eq!(
            announcement.map(|a| (a.name, a.presence)),
            Some(("kitchen-2".to_string(), DevicePresence::Online))
        );
        assert_eq!(tracker.get(&key()).map(|r| r.name.as_str()), Some("kitchen-2"));
    }

    #[test]
    fn test_rename_while_online_announces_new_name() {
        let mut tracker = PresenceTracker::new(DEFAULT_DEVICE_TIMEOUT);
        tracker.touch(&key(), "kitchen", 0);

        let announcement = tracker.touch(&key(), "pantry", 1_000);
        assert_eq!(
            announcement,
            Some(DeviceAnnouncement {
                name: "pantry".to_string(),
                device_key: key(),
                presence: DevicePresence::Online,
            })
        );
        assert_eq!(tracker.touch(&key(), "pantry", 2_000), None);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.online_count(), 1);
    }

    #[test]
    fn test_touch_keeps_device_alive() {
        let mut tracker = PresenceTracker::new(Duration::from_millis(1_000));
        let other = DeviceKey::from(&MacAddress::new([1, 2, 3, 4, 5, 6]));
        tracker.touch(&key(), "kitchen", 0);
        tracker.touch(&other, "garage", 0);
        tracker.touch(&key(), "kitchen", 900);

        let announcements = tracker.sweep(1_500);
        assert_eq!(announcements.len(), 1);
        assert_eq!(announcements[0].device_key, other);
        assert_eq!(tracker.online_count(), 1);
    }
}
