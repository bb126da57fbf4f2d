//! The sync state machine.
//!
//! Clipboard changes and network receipts arrive on one queue and are
//! handled here, one at a time, so `last_known`, the history and the device
//! registry all have a single writer.

use std::sync::Arc;

use log::Level;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    task,
};
use tokio_util::sync::CancellationToken;

use super::clipboard::ClipboardAccess;
use super::models::{ClipboardHistory, ClipboardSnapshot, Device, DeviceRegistry, LocalDevice};
use super::{emit, emit_log, RuntimeEvent};

#[derive(Debug)]
pub enum SyncEvent {
    /// The watcher saw new text on the local clipboard.
    LocalChange(String),
    /// The listener decoded a complete message from a peer.
    Remote {
        device: Device,
        snapshot: ClipboardSnapshot,
    },
}

pub struct SyncCoordinator {
    local: LocalDevice,
    last_known: Option<String>,
    history: ClipboardHistory,
    devices: DeviceRegistry,
    clipboard: Arc<dyn ClipboardAccess>,
    outbound: mpsc::Sender<String>,
    /// Last remote value actually written to the clipboard.
    applied: watch::Sender<Option<String>>,
    events: mpsc::Sender<RuntimeEvent>,
    cancel: CancellationToken,
}

impl SyncCoordinator {
    pub fn new(
        local: LocalDevice,
        history_capacity: usize,
        clipboard: Arc<dyn ClipboardAccess>,
        outbound: mpsc::Sender<String>,
        events: mpsc::Sender<RuntimeEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let (applied, _) = watch::channel(None);
        Self {
            local,
            last_known: None,
            history: ClipboardHistory::new(history_capacity),
            devices: DeviceRegistry::new(),
            clipboard,
            outbound,
            applied,
            events,
            cancel,
        }
    }

    /// Follows every remote value once it is on the local clipboard, so the
    /// watcher can treat it as already seen.
    pub fn applied_text(&self) -> watch::Receiver<Option<String>> {
        self.applied.subscribe()
    }

    #[cfg(test)]
    pub(crate) fn last_known(&self) -> Option<&str> {
        self.last_known.as_deref()
    }

    #[cfg(test)]
    pub(crate) fn history(&self) -> &ClipboardHistory {
        &self.history
    }

    #[cfg(test)]
    pub(crate) fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    /// Process events until cancelled or every sender is gone. An event in
    /// progress is abandoned when cancellation fires.
    pub async fn run(mut self, mut rx: mpsc::Receiver<SyncEvent>) {
        let cancel = self.cancel.clone();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.handle(event) => {}
            }
        }
        emit_log(&self.events, &cancel, Level::Debug, "coordinator stopped").await;
    }

    pub async fn handle(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::LocalChange(content) => self.on_local_change(content).await,
            SyncEvent::Remote { device, snapshot } => self.on_remote(device, snapshot).await,
        }
    }

    async fn log(&self, level: Level, message: impl Into<String>) {
        emit_log(&self.events, &self.cancel, level, message).await;
    }

    async fn on_local_change(&mut self, content: String) {
        if content.is_empty() || self.last_known.as_deref() == Some(content.as_str()) {
            return;
        }
        self.last_known = Some(content.clone());

        match self.outbound.try_send(content.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.log(Level::Warn, "broadcast queue full, dropping clipboard update").await;
            }
            Err(TrySendError::Closed(_)) => {
                self.log(Level::Warn, "broadcaster is not running").await;
            }
        }

        self.log(Level::Info, format!("local clipboard changed (len={})", content.len())).await;
        self.history.push(ClipboardSnapshot::local(content, &self.local));
        self.emit_history().await;
    }

    async fn on_remote(&mut self, device: Device, snapshot: ClipboardSnapshot) {
        if self.devices.insert(device.clone()) {
            self.log(
                Level::Info,
                format!(
                    "discovered {} ({}) at {}",
                    device.name, device.kind, device.address
                ),
            )
            .await;
            let devices = self.devices.devices().to_vec();
            emit(&self.events, &self.cancel, RuntimeEvent::DevicesChanged(devices)).await;
        }

        let duplicate = self.last_known.as_deref() == Some(snapshot.content.as_str());
        emit(
            &self.events,
            &self.cancel,
            RuntimeEvent::ClipboardReceived {
                device: device.clone(),
                applied: !duplicate,
            },
        )
        .await;
        if duplicate {
            log::debug!("content from {} already current, not applying", device.name);
            return;
        }

        self.last_known = Some(snapshot.content.clone());

        let clipboard = self.clipboard.clone();
        let text = snapshot.content.clone();
        match task::spawn_blocking(move || clipboard.write_text(&text)).await {
            Ok(Ok(())) => {
                self.applied.send_replace(Some(snapshot.content.clone()));
                self.log(
                    Level::Info,
                    format!(
                        "applied clipboard from {} (len={})",
                        device.name,
                        snapshot.content.len()
                    ),
                )
                .await;
            }
            Ok(Err(e)) => {
                self.log(Level::Warn, format!("clipboard write failed: {:#}", e)).await;
            }
            Err(e) => {
                self.log(Level::Error, format!("clipboard write task failed: {}", e)).await;
            }
        }

        self.history.push(snapshot);
        self.emit_history().await;
    }

    async fn emit_history(&self) {
        let history = self.history.to_vec();
        emit(&self.events, &self.cancel, RuntimeEvent::HistoryChanged(history)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::clipboard::MemoryClipboard;
    use crate::runtime::models::DeviceKind;
    use std::{
        net::{IpAddr, Ipv4Addr},
        time::Instant,
    };

    struct Harness {
        coordinator: SyncCoordinator,
        clipboard: Arc<MemoryClipboard>,
        outbound: mpsc::Receiver<String>,
        events: mpsc::Receiver<RuntimeEvent>,
    }

    fn harness() -> Harness {
        let clipboard = Arc::new(MemoryClipboard::new());
        let (out_tx, out_rx) = mpsc::channel(16);
        let (ev_tx, ev_rx) = mpsc::channel(256);
        let local = LocalDevice::new("me", DeviceKind::Linux, Ipv4Addr::new(10, 0, 0, 1).into());
        Harness {
            coordinator: SyncCoordinator::new(
                local,
                20,
                clipboard.clone(),
                out_tx,
                ev_tx,
                CancellationToken::new(),
            ),
            clipboard,
            outbound: out_rx,
            events: ev_rx,
        }
    }

    fn remote(name: &str, last_octet: u8, content: &str) -> SyncEvent {
        let address = IpAddr::from(Ipv4Addr::new(10, 0, 0, last_octet));
        SyncEvent::Remote {
            device: Device {
                name: name.to_string(),
                address,
                kind: DeviceKind::Windows,
            },
            snapshot: ClipboardSnapshot {
                content: content.to_string(),
                origin_device: name.to_string(),
                origin_address: address,
                device_kind: DeviceKind::Windows,
                sent_at_ms: 0,
                timestamp: Instant::now(),
            },
        }
    }

    #[tokio::test]
    async fn local_change_broadcasts_once() {
        let mut h = harness();
        h.coordinator.handle(SyncEvent::LocalChange("hello".into())).await;
        h.coordinator.handle(SyncEvent::LocalChange("hello".into())).await;
        h.coordinator.handle(SyncEvent::LocalChange(String::new())).await;

        assert_eq!(h.outbound.try_recv().unwrap(), "hello");
        assert!(h.outbound.try_recv().is_err());
        assert_eq!(h.coordinator.last_known(), Some("hello"));
        assert_eq!(h.coordinator.history().len(), 1);
        assert_eq!(h.coordinator.history().latest().unwrap().origin_device, "me");
        assert!(h.clipboard.writes().is_empty());
    }

    #[tokio::test]
    async fn remote_content_is_written_and_recorded() {
        let mut h = harness();
        h.coordinator.handle(remote("peer", 2, "hello")).await;

        assert_eq!(h.clipboard.writes(), ["hello"]);
        assert_eq!(h.coordinator.history().latest().unwrap().content, "hello");
        assert_eq!(h.coordinator.devices().len(), 1);
        assert!(h.outbound.try_recv().is_err());

        let mut saw_history = false;
        let mut saw_devices = false;
        while let Ok(event) = h.events.try_recv() {
            match event {
                RuntimeEvent::HistoryChanged(list) => {
                    saw_history = true;
                    assert_eq!(list[0].content, "hello");
                }
                RuntimeEvent::DevicesChanged(list) => {
                    saw_devices = true;
                    assert_eq!(list[0].name, "peer");
                }
                _ => {}
            }
        }
        assert!(saw_history && saw_devices);
    }

    #[tokio::test]
    async fn repeated_remote_content_is_written_once() {
        let mut h = harness();
        h.coordinator.handle(remote("peer", 2, "same")).await;
        h.coordinator.handle(remote("peer", 2, "same")).await;
        h.coordinator.handle(remote("other", 3, "same")).await;

        assert_eq!(h.clipboard.writes(), ["same"]);
        assert_eq!(h.coordinator.history().len(), 1);
        assert_eq!(h.coordinator.devices().len(), 2);

        let applied: Vec<bool> = std::iter::from_fn(|| h.events.try_recv().ok())
            .filter_map(|e| match e {
                RuntimeEvent::ClipboardReceived { applied, .. } => Some(applied),
                _ => None,
            })
            .collect();
        assert_eq!(applied, [true, false, false]);
    }

    #[tokio::test]
    async fn received_content_is_not_rebroadcast() {
        let mut h = harness();
        h.coordinator.handle(remote("peer", 2, "from afar")).await;
        // The watcher then notices the value we just wrote.
        h.coordinator
            .handle(SyncEvent::LocalChange("from afar".into()))
            .await;

        assert!(h.outbound.try_recv().is_err());
        assert_eq!(h.coordinator.history().len(), 1);
    }

    #[tokio::test]
    async fn remote_matching_local_copy_is_not_written() {
        let mut h = harness();
        h.coordinator.handle(SyncEvent::LocalChange("mine".into())).await;
        h.coordinator.handle(remote("peer", 2, "mine")).await;

        assert!(h.clipboard.writes().is_empty());
        assert!(h.coordinator.devices().contains(&Device {
            name: "peer".into(),
            address: Ipv4Addr::new(10, 0, 0, 2).into(),
            kind: DeviceKind::Unknown,
        }));
    }

    #[tokio::test]
    async fn written_remote_value_is_published() {
        let mut h = harness();
        let mut applied = h.coordinator.applied_text();
        assert_eq!(*applied.borrow(), None);

        h.coordinator.handle(SyncEvent::LocalChange("mine".into())).await;
        assert!(!applied.has_changed().unwrap());

        h.coordinator.handle(remote("peer", 2, "theirs")).await;
        assert!(applied.has_changed().unwrap());
        assert_eq!(applied.borrow_and_update().as_deref(), Some("theirs"));

        // A duplicate is not written, so nothing new is published.
        h.coordinator.handle(remote("other", 3, "theirs")).await;
        assert!(!applied.has_changed().unwrap());
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let h = harness();
        let (_tx, rx) = mpsc::channel(1);
        let cancel = h.coordinator.cancel.clone();
        let task = tokio::spawn(h.coordinator.run(rx));
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .expect("coordinator stops promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn run_stops_on_cancel_with_a_full_event_queue() {
        let clipboard = Arc::new(MemoryClipboard::new());
        let (out_tx, _out_rx) = mpsc::channel(16);
        // Nobody reads this queue.
        let (ev_tx, _ev_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let local = LocalDevice::new("me", DeviceKind::Linux, Ipv4Addr::new(10, 0, 0, 1).into());
        let coordinator =
            SyncCoordinator::new(local, 20, clipboard, out_tx, ev_tx, cancel.clone());

        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(coordinator.run(rx));
        tx.send(remote("peer", 2, "one")).await.unwrap();
        tx.send(SyncEvent::LocalChange("two".into())).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .expect("coordinator stops while blocked on events")
            .unwrap();
    }
}
