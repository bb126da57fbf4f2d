use std::{
    collections::{HashSet, VecDeque},
    net::IpAddr,
    time::Instant,
};

pub use super::lan::protocol::DeviceKind;

/// Default number of entries kept in [`ClipboardHistory`].
pub const DEFAULT_HISTORY_CAPACITY: usize = 20;

/// Who we are on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDevice {
    pub name: String,
    pub kind: DeviceKind,
    /// Primary address of this host, recorded on locally originated
    /// snapshots.
    pub address: IpAddr,
}

impl LocalDevice {
    pub fn new(name: impl Into<String>, kind: DeviceKind, address: IpAddr) -> Self {
        Self {
            name: name.into(),
            kind,
            address,
        }
    }
}

/// A peer seen on the network. Identity is the `(name, address)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub name: String,
    pub address: IpAddr,
    pub kind: DeviceKind,
}

impl Device {
    pub fn identity(&self) -> (&str, IpAddr) {
        (&self.name, self.address)
    }
}

/// One clipboard value, local or remote. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardSnapshot {
    pub content: String,
    pub origin_device: String,
    pub origin_address: IpAddr,
    pub device_kind: DeviceKind,
    /// Wall-clock time the origin stamped on the message, in UNIX millis.
    pub sent_at_ms: u64,
    /// When this process observed the value.
    pub timestamp: Instant,
}

impl ClipboardSnapshot {
    /// Snapshot of a change detected on this machine.
    pub fn local(content: String, local: &LocalDevice) -> Self {
        Self {
            content,
            origin_device: local.name.clone(),
            origin_address: local.address,
            device_kind: local.kind,
            sent_at_ms: super::lan::protocol::now_unix_millis(),
            timestamp: Instant::now(),
        }
    }
}

/// Insertion-ordered, deduplicated set of peers. Entries are never removed.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
    seen: HashSet<(String, IpAddr)>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the device was not known before.
    pub fn insert(&mut self, device: Device) -> bool {
        let (name, address) = device.identity();
        if !self.seen.insert((name.to_string(), address)) {
            return false;
        }
        self.devices.push(device);
        true
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, device: &Device) -> bool {
        let (name, address) = device.identity();
        self.seen.contains(&(name.to_string(), address))
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Most-recent-first list of snapshots, bounded to `capacity` entries.
#[derive(Debug)]
pub struct ClipboardHistory {
    entries: VecDeque<ClipboardSnapshot>,
    capacity: usize,
}

impl ClipboardHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, snapshot: ClipboardSnapshot) {
        self.entries.push_front(snapshot);
        self.entries.truncate(self.capacity);
    }

    #[cfg(test)]
    pub(crate) fn latest(&self) -> Option<&ClipboardSnapshot> {
        self.entries.front()
    }

    pub fn to_vec(&self) -> Vec<ClipboardSnapshot> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ClipboardHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn device(name: &str, last_octet: u8) -> Device {
        Device {
            name: name.to_string(),
            address: Ipv4Addr::new(10, 0, 0, last_octet).into(),
            kind: DeviceKind::Linux,
        }
    }

    #[test]
    fn registry_dedups_by_name_and_address() {
        let mut registry = DeviceRegistry::new();
        assert!(registry.insert(device("a", 1)));
        assert!(!registry.insert(device("a", 1)));
        assert!(registry.insert(device("a", 2)));
        assert!(registry.insert(device("b", 1)));

        let mut other_kind = device("b", 1);
        other_kind.kind = DeviceKind::Windows;
        assert!(!registry.insert(other_kind));

        assert!(registry.contains(&device("a", 2)));
        assert!(!registry.contains(&device("c", 1)));

        let names: Vec<_> = registry.devices().iter().map(|d| d.identity()).collect();
        assert_eq!(
            names,
            [
                ("a", IpAddr::from(Ipv4Addr::new(10, 0, 0, 1))),
                ("a", IpAddr::from(Ipv4Addr::new(10, 0, 0, 2))),
                ("b", IpAddr::from(Ipv4Addr::new(10, 0, 0, 1))),
            ]
        );
    }

    #[test]
    fn history_keeps_most_recent_first_and_is_bounded() {
        let local = LocalDevice::new("me", DeviceKind::MacOS, Ipv4Addr::LOCALHOST.into());
        let mut history = ClipboardHistory::default();
        for i in 0..25 {
            history.push(ClipboardSnapshot::local(format!("item {}", i), &local));
        }
        assert_eq!(history.len(), DEFAULT_HISTORY_CAPACITY);
        assert_eq!(history.latest().unwrap().content, "item 24");
        assert_eq!(history.to_vec().last().unwrap().content, "item 5");
    }
}
