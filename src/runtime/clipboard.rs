use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use arboard::Clipboard;
use log::Level;
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, watch},
    task,
    time::sleep,
};
use tokio_util::sync::CancellationToken;

use super::coordinator::SyncEvent;
use super::{emit_log, RuntimeEvent};

/// Default clipboard polling period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Text access to a clipboard. Both calls may block and may fail
/// transiently; callers run them on the blocking pool and retry on the next
/// tick.
pub trait ClipboardAccess: Send + Sync + 'static {
    /// `Ok(None)` when the clipboard holds no text.
    fn read_text(&self) -> Result<Option<String>>;
    fn write_text(&self, text: &str) -> Result<()>;
}

/// The OS clipboard via `arboard`. A fresh context is opened per call since
/// some platforms invalidate long-lived handles.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClipboard;

impl ClipboardAccess for SystemClipboard {
    fn read_text(&self) -> Result<Option<String>> {
        let mut cb = Clipboard::new().context("clipboard init failed")?;
        match cb.get_text() {
            Ok(text) => Ok(Some(text)),
            Err(arboard::Error::ContentNotAvailable) => Ok(None),
            Err(e) => Err(e).context("clipboard read failed"),
        }
    }

    fn write_text(&self, text: &str) -> Result<()> {
        let mut cb = Clipboard::new().context("clipboard init failed")?;
        cb.set_text(text.to_owned())
            .context("clipboard write failed")
    }
}

/// In-process clipboard, for headless runs and tests.
#[derive(Debug, Default)]
pub struct MemoryClipboard {
    text: Mutex<Option<String>>,
    writes: Mutex<Vec<String>>,
}

impl MemoryClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the user copying `text`.
    pub fn set(&self, text: impl Into<String>) {
        *self.text.lock() = Some(text.into());
    }

    pub fn get(&self) -> Option<String> {
        self.text.lock().clone()
    }

    /// Every value written through [`ClipboardAccess::write_text`], in order.
    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().clone()
    }
}

impl ClipboardAccess for MemoryClipboard {
    fn read_text(&self) -> Result<Option<String>> {
        Ok(self.get())
    }

    fn write_text(&self, text: &str) -> Result<()> {
        self.writes.lock().push(text.to_string());
        self.set(text);
        Ok(())
    }
}

/// Poll `clipboard` every `poll_interval` and report new, non-empty text as
/// [`SyncEvent::LocalChange`].
///
/// "New" means different from the last value seen here, which is either the
/// previous poll or the latest remote value the coordinator published on
/// `applied`. Whether the value is really new to the network is the
/// coordinator's call. Read errors skip the tick.
pub async fn run_clipboard_watcher(
    clipboard: Arc<dyn ClipboardAccess>,
    poll_interval: Duration,
    mut applied: watch::Receiver<Option<String>>,
    sync_events: mpsc::Sender<SyncEvent>,
    events: mpsc::Sender<RuntimeEvent>,
    cancel: CancellationToken,
) {
    emit_log(
        &events,
        &cancel,
        Level::Info,
        format!("clipboard watcher started (every {:?})", poll_interval),
    )
    .await;

    let mut last_polled: Option<String> = None;

    loop {
        // Checked before reading: a value published later is already on the
        // clipboard and at worst gets reported once more.
        if applied.has_changed().unwrap_or(false) {
            if let Some(text) = applied.borrow_and_update().clone() {
                last_polled = Some(text);
            }
        }

        let cb = clipboard.clone();
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = task::spawn_blocking(move || cb.read_text()) => read,
        };

        match read {
            Ok(Ok(Some(text))) => {
                if !text.is_empty() && last_polled.as_deref() != Some(text.as_str()) {
                    last_polled = Some(text.clone());
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = sync_events.send(SyncEvent::LocalChange(text)) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => {
                let message = format!("clipboard read failed: {:#}", e);
                emit_log(&events, &cancel, Level::Warn, message).await;
            }
            Err(e) => {
                let message = format!("clipboard read task failed: {}", e);
                emit_log(&events, &cancel, Level::Error, message).await;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(poll_interval) => {}
        }
    }

    emit_log(&events, &cancel, Level::Debug, "clipboard watcher stopped").await;
}
