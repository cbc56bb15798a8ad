//! One log subscription: a reader task that tails a file in response to
//! inotify events and fans the bytes into a bounded output channel.

use std::path::PathBuf;
use std::sync::Weak;

use nix::sys::inotify::{AddWatchFlags, WatchDescriptor};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::logwatcher::WatcherInner;

pub(crate) const READ_BUFFER_SIZE: usize = 4 << 10;
pub(crate) const EVENT_CHANNEL_SIZE: usize = 1 << 10;
pub(crate) const OUTPUT_CHANNEL_SIZE: usize = 1 << 10;

/// Predicate polled after each read-to-EOF; the subscription winds down
/// once it reports false.
pub type IsActiveFn = Box<dyn Fn() -> bool + Send + Sync + 'static>;

/// Reader half of a subscription. The dispatcher half (the event sender)
/// lives in the watch registry under the same `watch_id`.
pub(crate) struct WatchObject {
    pub(crate) watch_id: Uuid,
    pub(crate) wd: WatchDescriptor,
    pub(crate) file_path: PathBuf,
    pub(crate) event_rx: mpsc::Receiver<AddWatchFlags>,
    pub(crate) out_tx: mpsc::Sender<Vec<u8>>,
}

impl WatchObject {
    /// Tail the file until the job goes inactive and the registry entry is
    /// removed.
    ///
    /// The file is opened only after the watch is registered, so the open
    /// itself raises `IN_OPEN` and primes the first read-to-EOF; nothing
    /// written before the subscription is missed. Each received event mask
    /// triggers one read from the current offset to EOF. Once `is_active`
    /// turns false the registry entry is removed exactly once, which closes
    /// the event channel and ends the loop when it drains.
    pub(crate) async fn run(mut self, is_active: IsActiveFn, watcher: Weak<WatcherInner>) {
        let mut file = match File::open(&self.file_path).await {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(
                    watch_id = %self.watch_id,
                    path = %self.file_path.display(),
                    error = %e,
                    "failed opening watched file"
                );
                self.remove_from(&watcher).await;
                return;
            }
        };

        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        let mut cleaned = false;

        while let Some(_mask) = self.event_rx.recv().await {
            if let Err(e) = self.read_to_eof(&mut file, &mut buffer).await {
                if e.kind() == std::io::ErrorKind::BrokenPipe {
                    tracing::debug!(watch_id = %self.watch_id, "subscriber disconnected");
                } else {
                    tracing::warn!(watch_id = %self.watch_id, error = %e, "log read failed");
                }
                if !cleaned {
                    self.remove_from(&watcher).await;
                }
                break;
            }

            if !cleaned && !is_active() {
                cleaned = true;
                self.remove_from(&watcher).await;
            }
        }

        tracing::debug!(watch_id = %self.watch_id, "watch task exiting");
    }

    /// Read from the current offset to EOF, emitting each non-empty block as
    /// a freshly allocated buffer. A full output channel drops the block
    /// rather than stalling; a closed one reports `BrokenPipe`.
    async fn read_to_eof(&self, file: &mut File, buffer: &mut [u8]) -> std::io::Result<()> {
        loop {
            let n = file.read(buffer).await?;
            if n == 0 {
                return Ok(());
            }

            match self.out_tx.try_send(buffer[..n].to_vec()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(watch_id = %self.watch_id, "output channel full, dropping block");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    return Err(std::io::ErrorKind::BrokenPipe.into());
                }
            }
        }
    }

    async fn remove_from(&self, watcher: &Weak<WatcherInner>) {
        if let Some(watcher) = watcher.upgrade() {
            watcher.remove_subscriber(self.wd, self.watch_id).await;
        }
    }
}
