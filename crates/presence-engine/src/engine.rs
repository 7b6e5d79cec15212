use crate::enrollment::{self, EnrollReport};
use crate::recognition::{self, RecognitionHandle};
use presence_core::{
    confidence, DetectedFace, Descriptor, EmbeddingProvider, EuclideanMatcher, MatchOutcome, Matcher,
    ProviderError, Recognition, RecognitionOutcome, Subject, DEFAULT_MATCH_THRESHOLD,
};
use presence_hw::{CameraError, CaptureSession};
use presence_store::{DescriptorStore, StoreError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("face recognition models not loaded")]
    NotInitialized,
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("embedding provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("descriptor storage unavailable: {0}")]
    StorageUnavailable(#[from] StoreError),
    #[error("Failed to capture any face samples")]
    NoSamplesCaptured,
    #[error("sample count must be at least 1")]
    InvalidSampleCount,
    #[error("background task failed: {0}")]
    Task(String),
}

/// Timing and matching parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    /// Maximum Euclidean distance for a positive match (inclusive).
    pub match_threshold: f32,
    /// Pause between the end of one recognition tick and the start of the next.
    pub recognition_interval: Duration,
    pub enroll_samples: usize,
    /// Pause between enrollment samples, to encourage pose variation.
    pub enroll_sample_delay: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            recognition_interval: Duration::from_millis(1000),
            enroll_samples: 3,
            enroll_sample_delay: Duration::from_millis(500),
        }
    }
}

/// What the recognition loop currently sees.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Detection {
    #[default]
    NoFace,
    /// A face is in view but matched nobody.
    Unmatched { distance: Option<f32> },
    Matched { subject: Subject, confidence: f32 },
}

/// Observable engine state for UI layers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EngineStatus {
    pub initialized: bool,
    pub loading: bool,
    pub camera_active: bool,
    pub last_error: Option<String>,
    pub detection: Detection,
}

/// State shared between the engine handle and its background tasks.
pub(crate) struct EngineShared {
    pub(crate) options: EngineOptions,
    provider: Mutex<Box<dyn EmbeddingProvider>>,
    pub(crate) store: Arc<DescriptorStore>,
    pub(crate) camera: Arc<CaptureSession>,
    matcher: EuclideanMatcher,
    initialized: AtomicBool,
    status: watch::Sender<EngineStatus>,
}

impl EngineShared {
    pub(crate) fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Apply `f` to the status, notifying subscribers only on change.
    pub(crate) fn update_status(&self, f: impl FnOnce(&mut EngineStatus)) {
        self.status.send_if_modified(|status| {
            let before = status.clone();
            f(status);
            *status != before
        });
    }

    pub(crate) fn set_detection(&self, detection: Detection) {
        self.update_status(|s| s.detection = detection);
    }

    pub(crate) fn record_error(&self, error: &EngineError) {
        let message = error.to_string();
        self.update_status(|s| s.last_error = Some(message));
    }

    /// Grab the current frame and run face detection. Blocking.
    ///
    /// `Ok(None)` means no frame was available.
    fn capture_faces(&self) -> Result<Option<Vec<DetectedFace>>, EngineError> {
        let Some(frame) = self.camera.current_frame() else {
            return Ok(None);
        };
        let mut provider = self.provider.lock().unwrap_or_else(PoisonError::into_inner);
        let faces = provider.detect_faces(&frame.data, frame.width, frame.height)?;
        Ok(Some(faces))
    }

    /// [`capture_faces`](Self::capture_faces) on the blocking pool.
    pub(crate) async fn detect(self: &Arc<Self>) -> Result<Option<Vec<DetectedFace>>, EngineError> {
        let shared = Arc::clone(self);
        tokio::task::spawn_blocking(move || shared.capture_faces())
            .await
            .map_err(|e| EngineError::Task(e.to_string()))?
    }

    pub(crate) async fn identify(&self, descriptor: &Descriptor) -> Result<RecognitionOutcome, EngineError> {
        let gallery = self.store.get_all().await?;
        let threshold = self.options.match_threshold;
        let outcome = match self.matcher.compare(descriptor, &gallery, threshold) {
            MatchOutcome::NoCandidates => RecognitionOutcome::Unmatched { distance: None },
            MatchOutcome::Rejected { distance } => RecognitionOutcome::Unmatched {
                distance: Some(distance),
            },
            MatchOutcome::Matched(m) => RecognitionOutcome::Matched(Recognition {
                subject: m.subject,
                distance: m.distance,
                confidence: confidence(m.distance, threshold),
            }),
        };
        Ok(outcome)
    }

    /// One recognition attempt against the live camera.
    ///
    /// Only the first detected face is considered. `Ok(None)` means there was
    /// no frame to look at.
    pub(crate) async fn recognize_once(self: &Arc<Self>) -> Result<Option<RecognitionOutcome>, EngineError> {
        let Some(faces) = self.detect().await? else {
            return Ok(None);
        };
        let Some(face) = faces.first() else {
            return Ok(Some(RecognitionOutcome::NoFace));
        };
        if faces.len() > 1 {
            tracing::debug!(faces = faces.len(), "multiple faces in frame; using the first");
        }
        self.identify(&face.descriptor).await.map(Some)
    }
}

/// Face enrollment and recognition over one camera and one descriptor store.
///
/// Must be used from within a Tokio runtime.
pub struct FaceRecognitionEngine {
    shared: Arc<EngineShared>,
    recognition: Mutex<Option<RecognitionHandle>>,
}

impl FaceRecognitionEngine {
    pub fn new<P>(
        provider: P,
        store: Arc<DescriptorStore>,
        camera: Arc<CaptureSession>,
        options: EngineOptions,
    ) -> Self
    where
        P: EmbeddingProvider + 'static,
    {
        let (status, _) = watch::channel(EngineStatus::default());
        Self {
            shared: Arc::new(EngineShared {
                options,
                provider: Mutex::new(Box::new(provider)),
                store,
                camera,
                matcher: EuclideanMatcher,
                initialized: AtomicBool::new(false),
                status,
            }),
            recognition: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.shared.options
    }

    pub fn store(&self) -> &Arc<DescriptorStore> {
        &self.shared.store
    }

    pub fn camera(&self) -> &Arc<CaptureSession> {
        &self.shared.camera
    }

    pub fn status(&self) -> EngineStatus {
        self.shared.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineStatus> {
        self.shared.status.subscribe()
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.is_initialized()
    }

    /// Load the provider's models. Repeat calls after success are no-ops.
    pub async fn initialize(&self) -> Result<(), EngineError> {
        if self.is_initialized() {
            return Ok(());
        }
        self.shared.update_status(|s| s.loading = true);
        tracing::info!("loading face recognition models");

        let shared = Arc::clone(&self.shared);
        let loaded = tokio::task::spawn_blocking(move || {
            shared
                .provider
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .initialize()
        })
        .await
        .map_err(|e| EngineError::Task(e.to_string()))
        .and_then(|r| match r {
            Ok(true) => Ok(()),
            Ok(false) => Err(EngineError::NotInitialized),
            Err(e) => Err(e.into()),
        });

        match &loaded {
            Ok(()) => {
                self.shared.initialized.store(true, Ordering::SeqCst);
                self.shared.update_status(|s| {
                    s.initialized = true;
                    s.loading = false;
                    s.last_error = None;
                });
                tracing::info!("face recognition models loaded");
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to load face recognition models");
                let message = e.to_string();
                self.shared.update_status(|s| {
                    s.loading = false;
                    s.last_error = Some(message);
                });
            }
        }
        loaded
    }

    /// Start the camera. Fails immediately with `NotInitialized` before
    /// [`initialize`](Self::initialize) has succeeded.
    pub async fn start_camera(&self) -> Result<(), EngineError> {
        if !self.is_initialized() {
            let err = EngineError::NotInitialized;
            self.shared.record_error(&err);
            return Err(err);
        }

        self.shared.update_status(|s| {
            s.loading = true;
            s.last_error = None;
        });
        let result = self.shared.camera.start().await.map_err(EngineError::from);
        let active = self.shared.camera.is_active();
        let error = result.as_ref().err().map(ToString::to_string);
        self.shared.update_status(|s| {
            s.loading = false;
            s.camera_active = active;
            s.last_error = error;
        });
        result
    }

    /// Stop recognition, then release the camera. Idempotent.
    pub fn stop_camera(&self) {
        self.stop_recognition();
        self.shared.camera.stop();
        self.shared.update_status(|s| {
            s.camera_active = false;
            s.detection = Detection::NoFace;
        });
    }

    /// Start polling the camera and call `on_result` for every match.
    ///
    /// Any loop already running is cancelled first. When the models are not
    /// loaded or the camera is not active, an inert handle is returned and
    /// nothing is polled.
    pub fn start_recognition<F>(&self, on_result: F) -> RecognitionHandle
    where
        F: FnMut(&Recognition) + Send + 'static,
    {
        self.stop_recognition();

        if !self.is_initialized() {
            tracing::debug!("recognition not started: models not loaded");
            return RecognitionHandle::inert();
        }
        if !self.shared.camera.is_active() {
            tracing::debug!("recognition not started: camera not active");
            return RecognitionHandle::inert();
        }

        let handle = recognition::spawn(Arc::clone(&self.shared), Box::new(on_result));
        *self.recognition.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle.clone());
        handle
    }

    /// Cancel the running recognition loop, if any.
    pub fn stop_recognition(&self) {
        let running = self
            .recognition
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = running {
            handle.cancel();
        }
    }

    /// Capture `sample_count` samples of `subject` and store every detected
    /// descriptor. `on_progress` receives 0–100 after each sample.
    pub async fn enroll<F>(
        &self,
        subject: &Subject,
        sample_count: usize,
        on_progress: F,
    ) -> Result<EnrollReport, EngineError>
    where
        F: FnMut(u8) + Send,
    {
        let result = enrollment::run(&self.shared, subject, sample_count, on_progress).await;
        if let Err(e) = &result {
            self.shared.record_error(e);
        }
        result
    }

    /// [`enroll`](Self::enroll) with the configured sample count.
    pub async fn enroll_default<F>(&self, subject: &Subject, on_progress: F) -> Result<EnrollReport, EngineError>
    where
        F: FnMut(u8) + Send,
    {
        self.enroll(subject, self.shared.options.enroll_samples, on_progress)
            .await
    }

    /// Match `descriptor` against every enrolled descriptor.
    pub async fn identify(&self, descriptor: &Descriptor) -> Result<RecognitionOutcome, EngineError> {
        self.shared.identify(descriptor).await
    }

    /// Delete every enrolled descriptor for `subject`.
    pub async fn remove_subject(&self, subject: &Subject) -> Result<usize, EngineError> {
        Ok(self.shared.store.remove_all_for_user(subject).await?)
    }
}

impl Drop for FaceRecognitionEngine {
    fn drop(&mut self) {
        self.stop_recognition();
    }
}
