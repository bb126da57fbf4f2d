//! Outbound side: turns clipboard text into datagrams and broadcasts them.

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

use log::Level;
use thiserror::Error;
use tokio::{net::UdpSocket, sync::mpsc, time::sleep};
use tokio_util::sync::CancellationToken;

use super::chunker::{fragment_count, split_into_fragments, MAX_TOTAL_CHUNKS};
use super::protocol::{encode, MessageHeader, WireMessage, MAX_UDP_PAYLOAD};
use crate::runtime::models::LocalDevice;
use crate::runtime::{emit, emit_log, RuntimeEvent};

/// Pause between successive fragments of one message.
pub const DEFAULT_FRAGMENT_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum SendError {
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
    #[error("content of {bytes} bytes needs more than {max} fragments")]
    TooLarge { bytes: usize, max: u32 },
}

/// Decide how `content` goes on the wire and encode every datagram.
///
/// Content of at most `chunk_size` UTF-8 bytes is one direct message. Larger
/// content is split into fragments of `chunk_size` bytes. A direct message
/// whose JSON escaping pushes it past [`MAX_UDP_PAYLOAD`] is sent as
/// fragments instead.
pub fn plan_datagrams(
    content: &str,
    chunk_size: usize,
    header: &MessageHeader,
) -> Result<Vec<Vec<u8>>, SendError> {
    if content.len() <= chunk_size {
        let frame = encode(&WireMessage::Direct {
            header: header.clone(),
            content: content.to_string(),
        });
        if frame.len() <= MAX_UDP_PAYLOAD {
            return Ok(vec![frame]);
        }
        log::debug!(
            "direct frame of {} bytes exceeds datagram limit, fragmenting",
            frame.len()
        );
    }

    if fragment_count(content.len(), chunk_size) > MAX_TOTAL_CHUNKS as usize {
        return Err(SendError::TooLarge {
            bytes: content.len(),
            max: MAX_TOTAL_CHUNKS,
        });
    }

    Ok(split_into_fragments(content, chunk_size, header)
        .into_iter()
        .map(|fragment| encode(&WireMessage::Fragment(fragment)))
        .collect())
}

/// Fire-and-forget UDP broadcaster.
///
/// Uses its own ephemeral socket so it never competes with the listener
/// bound to the protocol port.
pub struct Broadcaster {
    socket: UdpSocket,
    target: SocketAddr,
    chunk_size: usize,
    fragment_delay: Duration,
}

impl Broadcaster {
    /// Bind `0.0.0.0:0` with `SO_BROADCAST` and remember where to send.
    pub async fn bind(
        target: SocketAddr,
        chunk_size: usize,
        fragment_delay: Duration,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_broadcast(true)?;
        Ok(Self {
            socket,
            target,
            chunk_size,
            fragment_delay,
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Broadcast `content` as this device. Returns the number of datagrams
    /// sent.
    pub async fn send(&self, content: &str, local: &LocalDevice) -> Result<usize, SendError> {
        let header = MessageHeader::local(&local.name, local.kind);
        let datagrams = plan_datagrams(content, self.chunk_size, &header)?;

        for (i, datagram) in datagrams.iter().enumerate() {
            if i > 0 {
                sleep(self.fragment_delay).await;
            }
            self.socket.send_to(datagram, self.target).await?;
        }

        Ok(datagrams.len())
    }
}

/// Drain `outbound` one broadcast at a time until cancelled.
///
/// A single consumer means two broadcasts never interleave their fragments.
/// Send failures are logged and the loop moves on to the next item.
pub async fn run_outbound_sender(
    broadcaster: Broadcaster,
    local: LocalDevice,
    mut outbound: mpsc::Receiver<String>,
    events: mpsc::Sender<RuntimeEvent>,
    cancel: CancellationToken,
) {
    emit_log(
        &events,
        &cancel,
        Level::Info,
        format!(
            "broadcaster started (target={}, chunk_size={})",
            broadcaster.target(),
            broadcaster.chunk_size()
        ),
    )
    .await;

    loop {
        let content = tokio::select! {
            _ = cancel.cancelled() => break,
            next = outbound.recv() => match next {
                Some(content) => content,
                None => break,
            },
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = broadcaster.send(&content, &local) => result,
        };

        match result {
            Ok(datagrams) => {
                log::debug!(
                    "broadcast {} bytes in {} datagram(s)",
                    content.len(),
                    datagrams
                );
                let sent = RuntimeEvent::ClipboardSent {
                    bytes: content.len(),
                    datagrams,
                };
                emit(&events, &cancel, sent).await;
            }
            Err(e) => {
                let message = format!("broadcast failed: {}", e);
                emit_log(&events, &cancel, Level::Warn, message).await;
            }
        }
    }

    emit_log(&events, &cancel, Level::Debug, "broadcaster stopped").await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::lan::protocol::{decode, DeviceKind, DEFAULT_CHUNK_SIZE};

    fn header() -> MessageHeader {
        MessageHeader::local("sender", DeviceKind::Windows)
    }

    #[test]
    fn content_at_threshold_is_one_direct_message() {
        let content = "a".repeat(DEFAULT_CHUNK_SIZE);
        let datagrams = plan_datagrams(&content, DEFAULT_CHUNK_SIZE, &header()).unwrap();
        assert_eq!(datagrams.len(), 1);
        match decode(&datagrams[0]).unwrap() {
            WireMessage::Direct { content: c, .. } => assert_eq!(c, content),
            other => panic!("expected direct, got {:?}", other),
        }
    }

    #[test]
    fn one_byte_over_threshold_is_chunked() {
        let content = "a".repeat(DEFAULT_CHUNK_SIZE + 1);
        let datagrams = plan_datagrams(&content, DEFAULT_CHUNK_SIZE, &header()).unwrap();
        assert_eq!(datagrams.len(), 2);
        for (i, d) in datagrams.iter().enumerate() {
            match decode(d).unwrap() {
                WireMessage::Fragment(f) => {
                    assert_eq!(f.chunk_index, i as u32);
                    assert_eq!(f.total_chunks, 2);
                }
                other => panic!("expected fragment, got {:?}", other),
            }
        }
    }

    #[test]
    fn heavily_escaped_direct_content_falls_back_to_fragments() {
        // Each control character becomes a six byte JSON escape.
        let content = "\u{0001}".repeat(DEFAULT_CHUNK_SIZE);
        let datagrams = plan_datagrams(&content, DEFAULT_CHUNK_SIZE, &header()).unwrap();
        assert!(datagrams.iter().all(|d| d.len() <= MAX_UDP_PAYLOAD));
        assert!(matches!(decode(&datagrams[0]).unwrap(), WireMessage::Fragment(_)));
    }

    #[test]
    fn refuses_content_beyond_fragment_limit() {
        let content = "b".repeat(1024 * (MAX_TOTAL_CHUNKS as usize) + 1);
        let err = plan_datagrams(&content, 1024, &header()).unwrap_err();
        assert!(matches!(err, SendError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn sends_every_datagram_to_target() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();
        let broadcaster = Broadcaster::bind(target, 16, Duration::from_millis(1))
            .await
            .unwrap();
        let local = LocalDevice::new("sender", DeviceKind::Linux, Ipv4Addr::LOCALHOST.into());

        let sent = broadcaster.send(&"c".repeat(40), &local).await.unwrap();
        assert_eq!(sent, 3);

        let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
        for expected in 0..3u32 {
            let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
            match decode(&buf[..len]).unwrap() {
                WireMessage::Fragment(f) => {
                    assert_eq!(f.chunk_index, expected);
                    assert_eq!(f.header.device_name, "sender");
                }
                other => panic!("expected fragment, got {:?}", other),
            }
        }
    }
}
