//! Sync runtime: wires the clipboard watcher, coordinator, listener and
//! broadcaster together and owns their lifetimes.

pub mod clipboard;
pub mod config;
pub mod coordinator;
pub mod lan;
pub mod models;

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use log::Level;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use clipboard::{run_clipboard_watcher, ClipboardAccess};
use config::Config;
use coordinator::{SyncCoordinator, SyncEvent};
use lan::broadcaster::{run_outbound_sender, Broadcaster};
use lan::listener::{run_listener, SelfFilter};
use lan::protocol::truncate_device_name;
use lan::{bind_reusable_udp, local_addresses, primary_address};
use models::{ClipboardSnapshot, Device, DeviceKind, LocalDevice};

/// Queue depth between the coordinator and the broadcaster.
const OUTBOUND_QUEUE: usize = 16;
/// Queue depth into the coordinator.
const SYNC_QUEUE: usize = 100;

#[derive(Debug, Clone)]
pub struct RuntimeLogEvent {
    pub level: Level,
    pub message: String,
}

impl RuntimeLogEvent {
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

/// Everything the presentation layer hears about. Delivered on an mpsc
/// channel; the receiver decides which thread it is consumed on.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    Status(String),
    Log(RuntimeLogEvent),
    /// Full history, newest first.
    HistoryChanged(Vec<ClipboardSnapshot>),
    /// Full device list, in discovery order.
    DevicesChanged(Vec<Device>),
    ClipboardSent { bytes: usize, datagrams: usize },
    /// A peer's content arrived; `applied` is false when it matched what we
    /// already had.
    ClipboardReceived { device: Device, applied: bool },
}

/// Deliver `event` unless `cancel` fires first. After cancellation delivery
/// is best effort and never waits on a consumer that stopped reading.
pub(crate) async fn emit(
    events: &mpsc::Sender<RuntimeEvent>,
    cancel: &CancellationToken,
    event: RuntimeEvent,
) {
    if cancel.is_cancelled() {
        let _ = events.try_send(event);
        return;
    }
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = events.send(event) => {}
    }
}

pub(crate) async fn emit_log(
    events: &mpsc::Sender<RuntimeEvent>,
    cancel: &CancellationToken,
    level: Level,
    message: impl Into<String>,
) {
    emit(events, cancel, RuntimeEvent::Log(RuntimeLogEvent::new(level, message))).await;
}

/// Resolved runtime parameters.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub local: LocalDevice,
    /// Where the listener binds.
    pub listen_addr: SocketAddr,
    /// Where broadcasts go.
    pub target: SocketAddr,
    pub chunk_size: usize,
    pub fragment_delay: Duration,
    pub reassembly_timeout: Duration,
    pub poll_interval: Duration,
    pub history_capacity: usize,
}

impl SyncOptions {
    pub fn from_config(cfg: &Config) -> Self {
        let cfg = cfg.clone().normalized();
        let name = truncate_device_name(&cfg.resolve_device_name());
        Self {
            local: LocalDevice::new(name, DeviceKind::current(), primary_address()),
            listen_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, cfg.port)),
            target: SocketAddr::V4(SocketAddrV4::new(cfg.broadcast_address, cfg.port)),
            chunk_size: cfg.chunk_size,
            fragment_delay: Duration::from_millis(cfg.fragment_delay_ms),
            reassembly_timeout: Duration::from_secs(cfg.reassembly_timeout_secs),
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            history_capacity: cfg.history_capacity,
        }
    }
}

/// Handles for every task started by [`start_sync`].
pub struct SyncTasks {
    pub cancel: CancellationToken,
    pub handles: Vec<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl SyncTasks {
    /// Address the listener is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Cancel all tasks and await their completion. Sockets close as the
    /// tasks that own them return.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for h in self.handles {
            let _ = h.await;
        }
    }

    /// Cancel all tasks and abort them without waiting.
    pub fn abort(self) {
        self.cancel.cancel();
        for h in self.handles {
            h.abort();
        }
    }
}

/// Bind the sockets and start watcher, listener, coordinator and
/// broadcaster.
///
/// Both sockets are bound before anything is spawned, so a bind failure is
/// returned to the caller with nothing left running.
pub async fn start_sync(
    options: SyncOptions,
    clipboard: Arc<dyn ClipboardAccess>,
    events: mpsc::Sender<RuntimeEvent>,
) -> Result<SyncTasks> {
    let listen_socket = bind_reusable_udp(options.listen_addr)
        .with_context(|| format!("failed to bind UDP listener on {}", options.listen_addr))?;
    let local_addr = listen_socket.local_addr()?;

    let broadcaster = Broadcaster::bind(options.target, options.chunk_size, options.fragment_delay)
        .await
        .context("failed to bind UDP broadcaster")?;

    let mut own_addrs = local_addresses();
    if !local_addr.ip().is_unspecified() {
        own_addrs.push(local_addr.ip());
    }
    let self_filter = SelfFilter::new(&options.local, own_addrs);

    let cancel = CancellationToken::new();
    let (sync_tx, sync_rx) = mpsc::channel::<SyncEvent>(SYNC_QUEUE);
    let (outbound_tx, outbound_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);

    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    // ── 1. Coordinator ───────────────────────────────────────────────────
    let coordinator = SyncCoordinator::new(
        options.local.clone(),
        options.history_capacity,
        clipboard.clone(),
        outbound_tx,
        events.clone(),
        cancel.clone(),
    );
    let applied = coordinator.applied_text();
    handles.push(tokio::spawn(coordinator.run(sync_rx)));

    // ── 2. Broadcaster ───────────────────────────────────────────────────
    {
        let local = options.local.clone();
        let ev = events.clone();
        let ct = cancel.clone();
        handles.push(tokio::spawn(async move {
            run_outbound_sender(broadcaster, local, outbound_rx, ev, ct).await;
        }));
    }

    // ── 3. Listener ──────────────────────────────────────────────────────
    {
        let tx = sync_tx.clone();
        let ev = events.clone();
        let ct = cancel.clone();
        let timeout = options.reassembly_timeout;
        handles.push(tokio::spawn(async move {
            run_listener(listen_socket, self_filter, timeout, tx, ev, ct).await;
        }));
    }

    // ── 4. Clipboard watcher ─────────────────────────────────────────────
    {
        let ev = events.clone();
        let ct = cancel.clone();
        let interval = options.poll_interval;
        handles.push(tokio::spawn(async move {
            run_clipboard_watcher(clipboard, interval, applied, sync_tx, ev, ct).await;
        }));
    }

    // The caller only gets the cancel token once this returns, so these two
    // must not wait on the consumer.
    let _ = events.try_send(RuntimeEvent::Log(RuntimeLogEvent::new(
        Level::Info,
        format!(
            "sync started (name={}, kind={}, listen={}, target={})",
            options.local.name, options.local.kind, local_addr, options.target
        ),
    )));
    let _ = events.try_send(RuntimeEvent::Status(format!(
        "Syncing as {}",
        options.local.name
    )));

    Ok(SyncTasks {
        cancel,
        handles,
        local_addr,
    })
}
