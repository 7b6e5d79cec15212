//! Background recognition loop.
//!
//! Ticks are self-scheduled: the next wait starts only after the previous
//! tick has settled, so two ticks never overlap.

use crate::engine::{Detection, EngineError, EngineShared};
use presence_core::{Recognition, RecognitionOutcome};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::ThreadId;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub(crate) type ResultCallback = Box<dyn FnMut(&Recognition) + Send>;

struct LoopControl {
    shared: Arc<EngineShared>,
    /// Held while a result is being delivered.
    callback: Mutex<Option<ResultCallback>>,
    cancelled: AtomicBool,
    /// Thread currently running the callback, so a cancel from inside the
    /// callback does not wait on itself.
    delivering_on: Mutex<Option<ThreadId>>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LoopControl {
    fn deliver(&self, result: Result<Option<RecognitionOutcome>, EngineError>) {
        let outcome = match result {
            Ok(Some(outcome)) => outcome,
            Ok(None) => {
                tracing::trace!("no frame available; skipping tick");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "recognition tick failed");
                return;
            }
        };

        let mut callback = self.callback.lock().unwrap_or_else(PoisonError::into_inner);
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        let Some(on_result) = callback.as_mut() else {
            return;
        };

        match outcome {
            RecognitionOutcome::NoFace => self.shared.set_detection(Detection::NoFace),
            RecognitionOutcome::Unmatched { distance } => {
                tracing::debug!(?distance, "face present, no match");
                self.shared.set_detection(Detection::Unmatched { distance });
            }
            RecognitionOutcome::Matched(recognition) => {
                tracing::info!(
                    subject = %recognition.subject,
                    distance = recognition.distance,
                    confidence = recognition.confidence,
                    "face recognized"
                );
                self.shared.set_detection(Detection::Matched {
                    subject: recognition.subject.clone(),
                    confidence: recognition.confidence,
                });
                *self.delivering_on.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(std::thread::current().id());
                on_result(&recognition);
                *self.delivering_on.lock().unwrap_or_else(PoisonError::into_inner) = None;
            }
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.send_replace(true);
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }

        let reentrant = *self.delivering_on.lock().unwrap_or_else(PoisonError::into_inner)
            == Some(std::thread::current().id());
        if !reentrant {
            // Wait out any delivery in progress on another thread.
            drop(self.callback.lock().unwrap_or_else(PoisonError::into_inner).take());
        }
        self.shared.set_detection(Detection::NoFace);
        tracing::info!("recognition stopped");
    }
}

/// Cancels a recognition loop. Clones share the same loop.
#[derive(Clone)]
pub struct RecognitionHandle {
    control: Option<Arc<LoopControl>>,
}

impl RecognitionHandle {
    /// A handle with no loop behind it; `cancel` does nothing.
    pub(crate) fn inert() -> Self {
        Self { control: None }
    }

    /// Stop polling. No callback starts after this returns. Idempotent.
    pub fn cancel(&self) {
        if let Some(control) = &self.control {
            control.cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.control
            .as_ref()
            .is_some_and(|c| !c.cancelled.load(Ordering::SeqCst))
    }
}

impl std::fmt::Debug for RecognitionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecognitionHandle")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Spawn the loop on the current runtime. Returns an inert handle outside one.
pub(crate) fn spawn(shared: Arc<EngineShared>, on_result: ResultCallback) -> RecognitionHandle {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::warn!("recognition not started: no async runtime");
        return RecognitionHandle::inert();
    };

    let (stop, stop_rx) = watch::channel(false);
    let control = Arc::new(LoopControl {
        shared,
        callback: Mutex::new(Some(on_result)),
        cancelled: AtomicBool::new(false),
        delivering_on: Mutex::new(None),
        stop,
        task: Mutex::new(None),
    });

    let task = runtime.spawn(run(Arc::clone(&control), stop_rx));
    *control.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    tracing::info!(
        interval_ms = control.shared.options.recognition_interval.as_millis() as u64,
        "recognition started"
    );

    RecognitionHandle {
        control: Some(control),
    }
}

async fn run(control: Arc<LoopControl>, mut stop: watch::Receiver<bool>) {
    let interval = control.shared.options.recognition_interval;
    loop {
        tokio::select! {
            _ = stop.wait_for(|stopped| *stopped) => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let result = tokio::select! {
            _ = stop.wait_for(|stopped| *stopped) => break,
            result = control.shared.recognize_once() => result,
        };
        control.deliver(result);
    }
    tracing::debug!("recognition loop exited");
}
