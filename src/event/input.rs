use super::Event;
use crossterm::event::{self, Event as CrosstermEvent, KeyEventKind};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Forward terminal input to the update loop until canceled
pub async fn listen(tx: mpsc::Sender<Event>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!("Input listener cancelled");
                break;
            }
            () = tokio::time::sleep(Duration::from_millis(50)) => {
                while event::poll(Duration::ZERO).unwrap_or(false) {
                    let forwarded = match event::read() {
                        Ok(CrosstermEvent::Key(key)) if key.kind == KeyEventKind::Press => Event::Key(key),
                        Ok(CrosstermEvent::Resize(..)) => Event::Resize,
                        Ok(_) => continue,
                        Err(e) => {
                            tracing::debug!(error = %e, "Failed to read terminal event");
                            break;
                        }
                    };
                    if tx.send(forwarded).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Forward coordinator events into the update loop
pub async fn forward_coordinator(
    mut rx: mpsc::Receiver<crate::coordination::CoordinatorEvent>,
    tx: mpsc::Sender<Event>,
) {
    while let Some(ev) = rx.recv().await {
        if tx.send(Event::Coordinator(ev)).await.is_err() {
            break;
        }
    }
}
