//! Process-wide inotify fan-out.
//!
//! One inotify descriptor serves every subscription. The kernel hands back
//! the same watch descriptor for a path that is already watched, so the
//! registry keeps a list of subscribers per descriptor and the dispatcher
//! fans each event mask out to all of them in user space. Behaves like
//! `tail -f` per subscriber: bytes flow until the watched job goes inactive
//! and the final close of its log file has been observed.

use std::collections::HashMap;
use std::os::unix::io::{AsFd, AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;

use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, InotifyEvent, WatchDescriptor};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::watch::{IsActiveFn, WatchObject, EVENT_CHANNEL_SIZE, OUTPUT_CHANNEL_SIZE};
use crate::error::{JobWorkerError, Result};

// AddWatchFlags operations are not const.
fn watch_mask() -> AddWatchFlags {
    AddWatchFlags::IN_OPEN | AddWatchFlags::IN_MODIFY | AddWatchFlags::IN_CLOSE_WRITE
}

/// Dispatcher half of a subscription; the reader half is the
/// [`WatchObject`] task holding the receiving ends.
struct Subscriber {
    watch_id: Uuid,
    event_tx: mpsc::Sender<AddWatchFlags>,
}

pub(crate) struct WatcherInner {
    inotify: Inotify,
    registry: RwLock<HashMap<WatchDescriptor, Vec<Subscriber>>>,
}

impl WatcherInner {
    async fn dispatch(&self, event: &InotifyEvent) {
        let registry = self.registry.read().await;
        let Some(subscribers) = registry.get(&event.wd) else {
            return;
        };

        for subscriber in subscribers {
            // Dropped wake-ups are harmless: the reader drains to EOF on
            // every event it does see.
            let _ = subscriber.event_tx.try_send(event.mask);
        }
    }

    /// Drop one subscriber; when the last one for a descriptor goes, the
    /// kernel watch is removed too. Closing the event channel here is what
    /// ends the reader task's loop.
    pub(crate) async fn remove_subscriber(&self, wd: WatchDescriptor, watch_id: Uuid) {
        let mut registry = self.registry.write().await;

        tracing::debug!(%watch_id, "removing log subscriber");

        let Some(subscribers) = registry.get_mut(&wd) else {
            return;
        };
        subscribers.retain(|s| s.watch_id != watch_id);

        if subscribers.is_empty() {
            registry.remove(&wd);
            if let Err(e) = self.inotify.rm_watch(wd) {
                tracing::warn!(error = %e, "inotify rm_watch failed");
            }
        }
    }
}

/// `AsyncFd` needs an `AsRawFd` owner; borrow the descriptor through the
/// shared watcher state.
struct InotifyIo(Arc<WatcherInner>);

impl AsRawFd for InotifyIo {
    fn as_raw_fd(&self) -> RawFd {
        self.0.inotify.as_fd().as_raw_fd()
    }
}

pub struct LogWatcher {
    inner: Arc<WatcherInner>,
    shutdown: CancellationToken,
}

impl LogWatcher {
    /// Initialize the shared inotify descriptor and start the dispatcher
    /// task. Must be called from within a tokio runtime.
    pub fn new() -> Result<Self> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
            .map_err(|e| JobWorkerError::Io {
                context: "initializing inotify".to_string(),
                source: std::io::Error::from_raw_os_error(e as i32),
            })?;

        let inner = Arc::new(WatcherInner {
            inotify,
            registry: RwLock::new(HashMap::new()),
        });
        let shutdown = CancellationToken::new();

        tokio::spawn(dispatch_events(inner.clone(), shutdown.clone()));

        Ok(Self { inner, shutdown })
    }

    /// Subscribe to `file_path` until `is_active` reports false and the
    /// file's final close has been read through. Returns the byte channel
    /// the reader task feeds; it closes once the subscription ends.
    pub async fn add_watch(
        &self,
        file_path: PathBuf,
        is_active: IsActiveFn,
    ) -> Result<mpsc::Receiver<Vec<u8>>> {
        // Register under the write lock so the dispatcher cannot observe the
        // new descriptor before its subscriber entry exists.
        let mut registry = self.inner.registry.write().await;

        let wd = self
            .inner
            .inotify
            .add_watch(&file_path, watch_mask())
            .map_err(|e| JobWorkerError::Io {
                context: format!("adding inotify watch for {}", file_path.display()),
                source: std::io::Error::from_raw_os_error(e as i32),
            })?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (out_tx, out_rx) = mpsc::channel(OUTPUT_CHANNEL_SIZE);
        let watch_id = Uuid::new_v4();

        registry.entry(wd).or_default().push(Subscriber {
            watch_id,
            event_tx,
        });
        drop(registry);

        tracing::info!(%watch_id, path = %file_path.display(), "starting log watch");

        let object = WatchObject {
            watch_id,
            wd,
            file_path,
            event_rx,
            out_tx,
        };
        tokio::spawn(object.run(is_active, Arc::downgrade(&self.inner)));

        Ok(out_rx)
    }

    /// Stop the dispatcher. No further events are delivered; readers that
    /// are mid-drain finish on their own.
    pub fn close(&self) {
        tracing::info!("closing log watcher");
        self.shutdown.cancel();
    }
}

async fn dispatch_events(inner: Arc<WatcherInner>, shutdown: CancellationToken) {
    let fd = match AsyncFd::with_interest(InotifyIo(inner.clone()), Interest::READABLE) {
        Ok(fd) => fd,
        Err(e) => {
            tracing::error!(error = %e, "failed registering inotify with the reactor");
            return;
        }
    };

    tracing::debug!("log watcher dispatching events");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!("log watcher dispatcher shutting down");
                break;
            }
            guard = fd.readable() => {
                let mut guard = match guard {
                    Ok(guard) => guard,
                    Err(e) => {
                        tracing::error!(error = %e, "inotify readiness failed");
                        break;
                    }
                };

                match inner.inotify.read_events() {
                    Ok(events) => {
                        for event in &events {
                            if !event.mask.contains(AddWatchFlags::IN_IGNORED) {
                                inner.dispatch(event).await;
                            }
                        }
                    }
                    Err(nix::errno::Errno::EAGAIN) => guard.clear_ready(),
                    Err(e) => {
                        tracing::error!(error = %e, "inotify read failed");
                        break;
                    }
                }
            }
        }
    }
}
