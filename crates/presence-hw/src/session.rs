//! Camera capture session: `Idle → Acquiring → Active → Idle`, with `Error`
//! reachable from `Acquiring`.

use crate::device::{CameraError, StreamRequest, VideoBackend, VideoStream};
use crate::frame::Frame;
use crate::surface::{Surface, SurfaceProvider};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Acquiring,
    Active,
    /// Last start failed; `start()` may be retried.
    Error,
}

/// Tunables for stream acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOptions {
    pub ideal_width: u32,
    pub ideal_height: u32,
    /// Device to open instead of the first enumerated one.
    pub preferred_device: Option<String>,
    /// How many times to look for a render surface before giving up.
    pub surface_attempts: u32,
    pub surface_interval: Duration,
    /// Upper bound on waiting for the bound surface to become ready.
    pub ready_timeout: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            ideal_width: 1280,
            ideal_height: 720,
            preferred_device: None,
            surface_attempts: 20,
            surface_interval: Duration::from_millis(200),
            ready_timeout: Duration::from_secs(10),
        }
    }
}

struct Inner {
    state: SessionState,
    /// Bumped by `stop()`; an in-flight `start()` that sees a different
    /// value discards what it acquired.
    generation: u64,
    stream: Option<Arc<dyn VideoStream>>,
    surface: Option<Arc<dyn Surface>>,
    last_error: Option<String>,
}

/// Stops the stream on drop unless disarmed.
struct StreamGuard(Option<Arc<dyn VideoStream>>);

impl StreamGuard {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Some(stream) = self.0.take() {
            tracing::debug!(device = stream.device_id(), "releasing partially acquired stream");
            stream.stop();
        }
    }
}

/// Owns one live stream and its binding to a render surface.
pub struct CaptureSession {
    backend: Arc<dyn VideoBackend>,
    surfaces: Arc<dyn SurfaceProvider>,
    options: CaptureOptions,
    inner: Mutex<Inner>,
}

impl CaptureSession {
    pub fn new(
        backend: Arc<dyn VideoBackend>,
        surfaces: Arc<dyn SurfaceProvider>,
        options: CaptureOptions,
    ) -> Self {
        Self {
            backend,
            surfaces,
            options,
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                generation: 0,
                stream: None,
                surface: None,
                last_error: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Human-readable reason the last `start()` failed.
    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    pub fn options(&self) -> &CaptureOptions {
        &self.options
    }

    /// Acquire a stream, bind it to a surface, and wait until it renders.
    ///
    /// Already active is a no-op success. On failure everything acquired so
    /// far is released and the session is left in `Error`.
    pub async fn start(&self) -> Result<(), CameraError> {
        let generation = {
            let mut inner = self.lock();
            match inner.state {
                SessionState::Active => return Ok(()),
                SessionState::Acquiring => return Err(CameraError::StartInProgress),
                SessionState::Idle | SessionState::Error => {}
            }
            inner.state = SessionState::Acquiring;
            inner.last_error = None;
            inner.generation
        };

        let acquired = self.acquire(generation).await;

        let mut inner = self.lock();
        match acquired {
            Ok((stream, surface)) if inner.generation == generation => {
                tracing::info!(device = stream.device_id(), "camera session active");
                inner.stream = Some(stream);
                inner.surface = Some(surface);
                inner.state = SessionState::Active;
                Ok(())
            }
            Ok((stream, surface)) => {
                drop(inner);
                surface.detach_stream(&stream);
                stream.stop();
                Err(CameraError::Aborted)
            }
            Err(e) => {
                if inner.generation == generation {
                    tracing::warn!(error = %e, "camera start failed");
                    inner.state = SessionState::Error;
                    inner.last_error = Some(e.to_string());
                }
                Err(e)
            }
        }
    }

    async fn acquire(&self, generation: u64) -> Result<(Arc<dyn VideoStream>, Arc<dyn Surface>), CameraError> {
        let backend = Arc::clone(&self.backend);
        let devices = tokio::task::spawn_blocking(move || backend.enumerate())
            .await
            .map_err(|e| CameraError::CaptureFailed(format!("device enumeration task: {e}")))??;
        if devices.is_empty() {
            return Err(CameraError::NoDeviceFound);
        }
        tracing::debug!(count = devices.len(), "video devices enumerated");

        let request = StreamRequest {
            device_id: self
                .options
                .preferred_device
                .clone()
                .or_else(|| devices.first().map(|d| d.id.clone()).filter(|id| !id.is_empty())),
            ideal_width: self.options.ideal_width,
            ideal_height: self.options.ideal_height,
        };
        let backend = Arc::clone(&self.backend);
        let stream = tokio::task::spawn_blocking(move || backend.open(&request))
            .await
            .map_err(|e| CameraError::CaptureFailed(format!("stream open task: {e}")))??;
        let guard = StreamGuard(Some(Arc::clone(&stream)));
        self.ensure_current(generation)?;

        let surface = self.find_surface(generation).await?;
        surface.attach(Arc::clone(&stream));

        let mut ready = surface.readiness();
        let waited = tokio::time::timeout(self.options.ready_timeout, ready.wait_for(|r| *r))
            .await
            .map(|r| r.map(|_| ()));
        let ready_result = match waited {
            Err(_) => Err(CameraError::InitTimeout(self.options.ready_timeout)),
            Ok(Err(_)) => Err(CameraError::CaptureFailed("render surface closed".into())),
            Ok(Ok(_)) => self.ensure_current(generation),
        };
        if let Err(e) = ready_result {
            // A newer start may already own this surface.
            surface.detach_stream(&stream);
            return Err(e);
        }

        // The caller may have swapped surfaces while we waited.
        let surface = match self.surfaces.acquire() {
            Some(latest) if !Arc::ptr_eq(&latest, &surface) => {
                tracing::debug!("render surface replaced during start; rebinding");
                surface.detach_stream(&stream);
                latest.attach(Arc::clone(&stream));
                latest
            }
            _ => surface,
        };

        guard.disarm();
        Ok((stream, surface))
    }

    /// Poll the provider for a surface, up to the configured attempt budget.
    async fn find_surface(&self, generation: u64) -> Result<Arc<dyn Surface>, CameraError> {
        let attempts = self.options.surface_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(surface) = self.surfaces.acquire() {
                if attempt > 1 {
                    tracing::debug!(attempt, "render surface found");
                }
                return Ok(surface);
            }
            if attempt < attempts {
                tokio::time::sleep(self.options.surface_interval).await;
                self.ensure_current(generation)?;
            }
        }
        Err(CameraError::SurfaceNotFound { attempts })
    }

    fn ensure_current(&self, generation: u64) -> Result<(), CameraError> {
        if self.lock().generation == generation {
            Ok(())
        } else {
            Err(CameraError::Aborted)
        }
    }

    /// Release the stream and detach from the surface. Idempotent, never fails.
    pub fn stop(&self) {
        let (stream, surface, was) = {
            let mut inner = self.lock();
            inner.generation += 1;
            let was = inner.state;
            inner.state = SessionState::Idle;
            (inner.stream.take(), inner.surface.take(), was)
        };
        if let Some(surface) = surface {
            surface.detach();
        }
        if let Some(stream) = stream {
            stream.stop();
        }
        if was != SessionState::Idle {
            tracing::info!(previous = ?was, "camera session stopped");
        }
    }

    /// Read the current frame from the bound surface.
    ///
    /// Rebinds first if the provider now hands out a different surface.
    /// Returns `None` when inactive or the surface has nothing to give.
    /// May block on the device.
    pub fn current_frame(&self) -> Option<Frame> {
        self.bound_surface()?.current_frame()
    }

    fn bound_surface(&self) -> Option<Arc<dyn Surface>> {
        let mut inner = self.lock();
        if inner.state != SessionState::Active {
            return None;
        }
        let bound = inner.surface.clone()?;
        match self.surfaces.acquire() {
            Some(latest) if !Arc::ptr_eq(&latest, &bound) => {
                let stream = inner.stream.clone()?;
                tracing::debug!(device = stream.device_id(), "render surface changed; rebinding stream");
                bound.detach();
                latest.attach(stream);
                inner.surface = Some(Arc::clone(&latest));
                Some(latest)
            }
            _ => Some(bound),
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}
