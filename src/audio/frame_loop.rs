//! # Frame Loop
//!
//! Repeating tick at display cadence, used by the activity detector and the
//! visualisers in place of a browser animation-frame callback.
//!
//! Behaviour:
//! - ticks every `interval`; a late tick is skipped, never replayed in a burst
//! - while the visibility channel reads `false` no tick runs; ticking resumes
//!   when it turns `true` again
//! - [`FrameTask::cancel`] is synchronous: once it returns, the tick closure
//!   will not run again
//!
//! ## Key Rust Concepts Used:
//! - **tokio::select!**: race the next tick against cancellation and visibility changes
//! - **CancellationToken** (tokio-util): cooperative shutdown of the spawned task
//! - **Drop**: dropping the handle cancels the loop

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::trace;

struct Gate {
    cancelled: AtomicBool,
    // Held for the whole duration of a tick.
    running: Mutex<()>,
    ticking_on: Mutex<Option<ThreadId>>,
}

/// Handle to a running frame loop.
pub struct FrameTask {
    token: CancellationToken,
    gate: Arc<Gate>,
}

impl FrameTask {
    /// Spawn a loop on the current tokio runtime.
    ///
    /// ## Parameters:
    /// - **interval**: time between ticks
    /// - **visibility**: optional pause switch; `None` means always visible
    /// - **tick**: invoked once per frame on a runtime worker
    pub fn spawn<F>(interval: Duration, visibility: Option<watch::Receiver<bool>>, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let token = CancellationToken::new();
        let gate = Arc::new(Gate {
            cancelled: AtomicBool::new(false),
            running: Mutex::new(()),
            ticking_on: Mutex::new(None),
        });

        let task_token = token.clone();
        let task_gate = gate.clone();
        tokio::spawn(async move {
            let mut visibility = visibility;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                let hidden = visibility.as_ref().is_some_and(|rx| !*rx.borrow());
                if hidden {
                    let mut source_gone = false;
                    if let Some(rx) = visibility.as_mut() {
                        tokio::select! {
                            _ = task_token.cancelled() => break,
                            changed = rx.changed() => source_gone = changed.is_err(),
                        }
                    }
                    if source_gone {
                        // No one can unhide us any more; stop pausing.
                        visibility = None;
                    }
                    ticker.reset();
                    continue;
                }

                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let stop = {
                    let _running = task_gate.running.lock().unwrap();
                    if task_gate.cancelled.load(Ordering::SeqCst) {
                        true
                    } else {
                        *task_gate.ticking_on.lock().unwrap() = Some(thread::current().id());
                        tick();
                        *task_gate.ticking_on.lock().unwrap() = None;
                        false
                    }
                };
                if stop {
                    break;
                }
            }
            trace!("Frame loop finished");
        });

        Self { token, gate }
    }

    /// Stop the loop. Waits for a tick in progress on another thread; may be
    /// called from inside the tick itself.
    pub fn cancel(&self) {
        self.gate.cancelled.store(true, Ordering::SeqCst);
        self.token.cancel();

        let inside_tick = *self.gate.ticking_on.lock().unwrap() == Some(thread::current().id());
        if !inside_tick {
            drop(self.gate.running.lock().unwrap());
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.gate.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for FrameTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for FrameTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameTask")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
