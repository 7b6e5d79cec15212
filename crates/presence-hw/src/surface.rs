//! Render surfaces a stream is bound to, and where sessions find them.
//!
//! A surface may not exist yet when a stream is opened, and the caller may
//! replace it later (a UI re-creating its preview widget, for example). The
//! session therefore asks a [`SurfaceProvider`] for the current surface
//! instead of holding one fixed handle.

use crate::device::VideoStream;
use crate::frame::Frame;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

/// Something a video stream can be bound to and frames read back from.
pub trait Surface: Send + Sync {
    /// Bind `stream`, replacing any previous binding. Readiness resets to
    /// `false` until the surface can render frames from the new stream.
    fn attach(&self, stream: Arc<dyn VideoStream>);
    /// Drop the binding. Does not stop the stream.
    fn detach(&self);
    /// Drop the binding only if `stream` is the one currently bound.
    fn detach_stream(&self, stream: &Arc<dyn VideoStream>);
    /// Flips to `true` once frame metadata is known for the bound stream.
    fn readiness(&self) -> watch::Receiver<bool>;
    /// Current frame, or `None` if nothing is bound or the read failed.
    fn current_frame(&self) -> Option<Frame>;
}

/// Hands out the surface the stream should currently be bound to.
pub trait SurfaceProvider: Send + Sync + 'static {
    fn acquire(&self) -> Option<Arc<dyn Surface>>;
}

/// Whether `a` and `b` are the same stream object.
pub(crate) fn same_stream(a: &Arc<dyn VideoStream>, b: &Arc<dyn VideoStream>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// A caller-owned slot holding the current surface, if any.
#[derive(Default)]
pub struct SurfaceSlot {
    current: Mutex<Option<Arc<dyn Surface>>>,
}

impl SurfaceSlot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with(surface: Arc<dyn Surface>) -> Self {
        Self {
            current: Mutex::new(Some(surface)),
        }
    }

    pub fn set(&self, surface: Arc<dyn Surface>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(surface);
    }

    pub fn clear(&self) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl SurfaceProvider for SurfaceSlot {
    fn acquire(&self) -> Option<Arc<dyn Surface>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

struct SurfaceShared {
    stream: Mutex<Option<Arc<dyn VideoStream>>>,
    latest: Mutex<Option<Frame>>,
    ready: watch::Sender<bool>,
    /// Bumped on every attach/detach so a stale primer cannot mark a newer binding ready.
    binding: AtomicU64,
}

/// In-process surface that reads frames straight from the bound stream.
///
/// On attach a short-lived thread reads one frame; once it arrives the
/// surface reports ready. [`latest_frame`](Self::latest_frame) exposes the
/// most recent frame for previews.
pub struct FrameSurface {
    shared: Arc<SurfaceShared>,
}

impl FrameSurface {
    pub fn new() -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            shared: Arc::new(SurfaceShared {
                stream: Mutex::new(None),
                latest: Mutex::new(None),
                ready,
                binding: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.shared
            .stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn latest_frame(&self) -> Option<Frame> {
        self.shared
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for FrameSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl Surface for FrameSurface {
    fn attach(&self, stream: Arc<dyn VideoStream>) {
        let binding = {
            let mut latest = self.shared.latest.lock().unwrap_or_else(PoisonError::into_inner);
            *latest = None;
            *self.shared.stream.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&stream));
            self.shared.ready.send_replace(false);
            self.shared.binding.fetch_add(1, Ordering::SeqCst) + 1
        };

        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("presence-surface-primer".into())
            .spawn(move || match stream.read_frame() {
                Ok(frame) => {
                    let mut latest = shared.latest.lock().unwrap_or_else(PoisonError::into_inner);
                    if shared.binding.load(Ordering::SeqCst) != binding {
                        return;
                    }
                    tracing::debug!(
                        device = stream.device_id(),
                        width = frame.width,
                        height = frame.height,
                        "surface ready"
                    );
                    *latest = Some(frame);
                    shared.ready.send_replace(true);
                }
                Err(e) => {
                    tracing::warn!(device = stream.device_id(), error = %e, "surface could not read first frame");
                }
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "failed to spawn surface primer thread");
        }
    }

    fn detach(&self) {
        let mut latest = self.shared.latest.lock().unwrap_or_else(PoisonError::into_inner);
        self.shared.binding.fetch_add(1, Ordering::SeqCst);
        *self.shared.stream.lock().unwrap_or_else(PoisonError::into_inner) = None;
        *latest = None;
        self.shared.ready.send_replace(false);
    }

    fn detach_stream(&self, stream: &Arc<dyn VideoStream>) {
        let mut latest = self.shared.latest.lock().unwrap_or_else(PoisonError::into_inner);
        let mut bound = self.shared.stream.lock().unwrap_or_else(PoisonError::into_inner);
        if !bound.as_ref().is_some_and(|b| same_stream(b, stream)) {
            return;
        }
        self.shared.binding.fetch_add(1, Ordering::SeqCst);
        *bound = None;
        *latest = None;
        self.shared.ready.send_replace(false);
    }

    fn readiness(&self) -> watch::Receiver<bool> {
        self.shared.ready.subscribe()
    }

    fn current_frame(&self) -> Option<Frame> {
        let stream = self
            .shared
            .stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        match stream.read_frame() {
            Ok(frame) => {
                *self.shared.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame.clone());
                Some(frame)
            }
            Err(e) => {
                tracing::debug!(device = stream.device_id(), error = %e, "frame read failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CameraError;
    use std::time::Duration;

    struct StaticStream {
        fail: bool,
    }

    impl VideoStream for StaticStream {
        fn device_id(&self) -> &str {
            "static"
        }
        fn resolution(&self) -> (u32, u32) {
            (2, 2)
        }
        fn read_frame(&self) -> Result<Frame, CameraError> {
            if self.fail {
                Err(CameraError::CaptureFailed("broken".into()))
            } else {
                Ok(Frame::new(vec![7; 4], 2, 2, 1))
            }
        }
        fn stop(&self) {}
    }

    #[tokio::test]
    async fn test_frame_surface_becomes_ready_after_attach() {
        let surface = FrameSurface::new();
        let mut ready = surface.readiness();
        assert!(!*ready.borrow());

        surface.attach(Arc::new(StaticStream { fail: false }));
        tokio::time::timeout(Duration::from_secs(2), ready.wait_for(|r| *r))
            .await
            .expect("surface never became ready")
            .unwrap();

        assert!(surface.latest_frame().is_some());
        assert_eq!(surface.current_frame().unwrap().data, vec![7; 4]);
    }

    #[tokio::test]
    async fn test_failed_stream_never_ready() {
        let surface = FrameSurface::new();
        let mut ready = surface.readiness();
        surface.attach(Arc::new(StaticStream { fail: true }));
        let waited = tokio::time::timeout(Duration::from_millis(100), ready.wait_for(|r| *r)).await;
        assert!(waited.is_err());
        assert!(surface.current_frame().is_none());
    }

    #[test]
    fn test_detach_clears_binding() {
        let surface = FrameSurface::new();
        surface.attach(Arc::new(StaticStream { fail: false }));
        assert!(surface.is_attached());
        surface.detach();
        assert!(!surface.is_attached());
        assert!(surface.current_frame().is_none());
        assert!(!*surface.readiness().borrow());
    }

    #[test]
    fn test_detach_stream_leaves_other_binding() {
        let surface = FrameSurface::new();
        let old: Arc<dyn VideoStream> = Arc::new(StaticStream { fail: false });
        let current: Arc<dyn VideoStream> = Arc::new(StaticStream { fail: false });
        surface.attach(Arc::clone(&old));
        surface.attach(Arc::clone(&current));

        surface.detach_stream(&old);
        assert!(surface.is_attached());

        surface.detach_stream(&current);
        assert!(!surface.is_attached());
    }

    #[test]
    fn test_surface_slot_set_and_clear() {
        let slot = SurfaceSlot::empty();
        assert!(slot.acquire().is_none());
        let surface: Arc<dyn Surface> = Arc::new(FrameSurface::new());
        slot.set(Arc::clone(&surface));
        assert!(Arc::ptr_eq(&slot.acquire().unwrap(), &surface));
        slot.clear();
        assert!(slot.acquire().is_none());
    }
}
