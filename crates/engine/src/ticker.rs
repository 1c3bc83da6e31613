//! The background auto-merge ticker.
//!
//! One thread, woken by a `crossbeam-channel` tick source, evaluates the
//! merge trigger on every tick. It holds only a `Weak` reference to the
//! engine core: if the engine is dropped without a close, the next tick
//! fails to upgrade and the thread exits on its own. A clean close sends
//! the shutdown signal and joins.

use crossbeam_channel::{bounded, select, tick, Sender};
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::Core;

pub(crate) struct MergeTicker {
    shutdown: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl MergeTicker {
    pub(crate) fn start(core: Weak<Core>, interval: Duration) -> Self {
        let (shutdown, shutdown_rx) = bounded::<()>(1);
        let handle = thread::spawn(move || {
            let ticks = tick(interval);
            loop {
                select! {
                    recv(ticks) -> _ => {
                        let core = match core.upgrade() {
                            Some(core) => core,
                            None => break,
                        };
                        core.maybe_merge();
                    }
                    recv(shutdown_rx) -> _ => break,
                }
            }
        });
        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Signals the thread and waits for it to exit.
    pub(crate) fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MergeTicker {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}
