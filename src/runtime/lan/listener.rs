//! Inbound side: receives datagrams, decodes them and feeds the coordinator.

use std::{
    collections::HashSet,
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

use log::Level;
use tokio::{net::UdpSocket, sync::mpsc, time::interval};
use tokio_util::sync::CancellationToken;

use super::chunker::Reassembler;
use super::protocol::{decode, MessageHeader, WireMessage, MAX_UDP_PAYLOAD};
use crate::runtime::coordinator::SyncEvent;
use crate::runtime::models::{ClipboardSnapshot, Device, LocalDevice};
use crate::runtime::{emit_log, RuntimeEvent};

/// How often abandoned reassembly buffers are swept when no traffic arrives.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Identifies datagrams this host sent itself: same device name, sent from
/// one of our own interface addresses.
#[derive(Debug, Clone)]
pub struct SelfFilter {
    name: String,
    addresses: HashSet<IpAddr>,
}

impl SelfFilter {
    pub fn new(local: &LocalDevice, addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            name: local.name.clone(),
            addresses: addresses.into_iter().collect(),
        }
    }

    pub fn is_own(&self, header: &MessageHeader, src: &SocketAddr) -> bool {
        header.device_name == self.name && self.addresses.contains(&src.ip())
    }
}

/// Turn one datagram into a coordinator event, if it completes a message.
///
/// Framing failures are background noise and return `None` without logging.
pub fn handle_datagram(
    data: &[u8],
    src: SocketAddr,
    reassembler: &mut Reassembler,
    self_filter: &SelfFilter,
    now: Instant,
) -> Option<SyncEvent> {
    let message = decode(data).ok()?;
    if self_filter.is_own(message.header(), &src) {
        return None;
    }

    let (header, content) = match message {
        WireMessage::Direct { header, content } => (header, content),
        WireMessage::Fragment(fragment) => {
            log::trace!(
                "fragment {}/{} of {} from {}",
                fragment.chunk_index + 1,
                fragment.total_chunks,
                fragment.message_id,
                src
            );
            let completed = reassembler.accept(fragment, now)?;
            (completed.header, completed.content)
        }
    };

    let device = Device {
        name: header.device_name.clone(),
        address: src.ip(),
        kind: header.device_kind,
    };
    let snapshot = ClipboardSnapshot {
        content,
        origin_device: header.device_name,
        origin_address: src.ip(),
        device_kind: header.device_kind,
        sent_at_ms: header.timestamp_ms,
        timestamp: now,
    };
    Some(SyncEvent::Remote { device, snapshot })
}

/// Receive loop. Runs until `cancel` fires, including while waiting for the
/// coordinator to take an event. A failed receive is logged and the loop
/// carries on.
pub async fn run_listener(
    socket: UdpSocket,
    self_filter: SelfFilter,
    reassembly_timeout: Duration,
    sync_events: mpsc::Sender<SyncEvent>,
    events: mpsc::Sender<RuntimeEvent>,
    cancel: CancellationToken,
) {
    let local_addr = socket
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "?".into());
    emit_log(
        &events,
        &cancel,
        Level::Info,
        format!("listener started on {}", local_addr),
    )
    .await;

    let mut reassembler = Reassembler::new(reassembly_timeout);
    let mut sweep = interval(SWEEP_INTERVAL);
    let mut buf = vec![0u8; MAX_UDP_PAYLOAD + 1];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sweep.tick() => {
                reassembler.evict_expired(Instant::now());
            }
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src)) => {
                        let event = handle_datagram(
                            &buf[..len],
                            src,
                            &mut reassembler,
                            &self_filter,
                            Instant::now(),
                        );
                        if let Some(event) = event {
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                sent = sync_events.send(event) => {
                                    if sent.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        let message = format!("receive failed: {}", e);
                        emit_log(&events, &cancel, Level::Warn, message).await;
                    }
                }
            }
        }
    }

    emit_log(&events, &cancel, Level::Debug, "listener stopped").await;
}
