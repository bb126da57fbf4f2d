#[path = "log.rs"]
mod app_log;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

use app_log::setup_logger;
use clippy_sync::runtime::clipboard::SystemClipboard;
use clippy_sync::runtime::config::Config;
use clippy_sync::{start_sync, RuntimeEvent, SyncOptions};

#[tokio::main]
async fn main() -> Result<()> {
    setup_logger()?;

    let cfg = Config::load()?;
    let options = SyncOptions::from_config(&cfg);

    let (event_tx, mut event_rx) = mpsc::channel::<RuntimeEvent>(512);
    let tasks = start_sync(options, Arc::new(SystemClipboard), event_tx).await?;
    log::info!("Listening on {} - press Ctrl+C to exit", tasks.local_addr());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = event_rx.recv() => match event {
                Some(event) => print_event(event),
                None => break,
            },
        }
    }

    log::info!("Shutting down");
    tasks.shutdown().await;
    while let Ok(event) = event_rx.try_recv() {
        print_event(event);
    }
    Ok(())
}

fn print_event(event: RuntimeEvent) {
    match event {
        RuntimeEvent::Log(entry) => log::log!(entry.level, "{}", entry.message),
        RuntimeEvent::Status(text) => log::info!("{}", text),
        RuntimeEvent::HistoryChanged(history) => {
            if let Some(latest) = history.first() {
                log::info!(
                    "[history {}] {} ({}): {}",
                    history.len(),
                    latest.origin_device,
                    latest.origin_address,
                    preview(&latest.content)
                );
            }
        }
        RuntimeEvent::DevicesChanged(devices) => {
            let names: Vec<String> = devices
                .iter()
                .map(|d| format!("{} [{}] @ {}", d.name, d.kind, d.address))
                .collect();
            log::info!("Devices: {}", names.join(", "));
        }
        RuntimeEvent::ClipboardSent { bytes, datagrams } => {
            log::debug!("sent {} bytes in {} datagram(s)", bytes, datagrams)
        }
        RuntimeEvent::ClipboardReceived { device, applied } => {
            log::debug!("received from {} (applied={})", device.name, applied)
        }
    }
}

fn preview(text: &str) -> String {
    const MAX: usize = 60;
    let flat: String = text.chars().map(|c| if c.is_control() { ' ' } else { c }).collect();
    if flat.chars().count() <= MAX {
        flat
    } else {
        format!("{}…", flat.chars().take(MAX).collect::<String>())
    }
}
