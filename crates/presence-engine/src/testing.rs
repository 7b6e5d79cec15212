//! Test doubles: a scripted embedding provider and an in-process camera.

use crate::engine::{EngineOptions, FaceRecognitionEngine};
use presence_core::{BoundingBox, DetectedFace, Descriptor, EmbeddingProvider, ProviderError, DESCRIPTOR_DIM};
use presence_hw::{
    CameraError, CaptureOptions, CaptureSession, DeviceInfo, Frame, FrameSurface, StreamRequest, SurfaceSlot,
    VideoBackend, VideoStream,
};
use presence_store::DescriptorStore;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A full-length descriptor with every component set to `value`.
pub fn descriptor(value: f32) -> Descriptor {
    Descriptor::new(vec![value; DESCRIPTOR_DIM])
}

fn face(descriptor: Descriptor) -> DetectedFace {
    DetectedFace {
        descriptor,
        region: BoundingBox {
            x: 0.0,
            y: 0.0,
            width: 2.0,
            height: 2.0,
            score: 0.99,
        },
    }
}

/// Per-call detection results. `Err(())` becomes an inference failure;
/// once exhausted every call sees no faces.
#[derive(Clone)]
pub struct Script {
    steps: Arc<Mutex<VecDeque<Result<Vec<Descriptor>, ()>>>>,
    consumed: Arc<AtomicUsize>,
}

impl Script {
    pub fn new(steps: Vec<Result<Vec<Descriptor>, ()>>) -> Self {
        Self {
            steps: Arc::new(Mutex::new(steps.into())),
            consumed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Scripted steps handed out so far.
    pub fn consumed(&self) -> usize {
        self.consumed.load(Ordering::SeqCst)
    }

    fn next(&self) -> Option<Result<Vec<Descriptor>, ()>> {
        let step = self.steps.lock().unwrap().pop_front()?;
        self.consumed.fetch_add(1, Ordering::SeqCst);
        Some(step)
    }
}

enum Faces {
    Fixed(Vec<Descriptor>),
    Scripted(Script),
}

pub struct FakeProvider {
    faces: Faces,
    fail_init: bool,
    delay: Duration,
}

impl FakeProvider {
    /// Every frame contains exactly these faces.
    pub fn with_faces(descriptors: Vec<Descriptor>) -> Self {
        Self {
            faces: Faces::Fixed(descriptors),
            fail_init: false,
            delay: Duration::ZERO,
        }
    }

    pub fn scripted(script: Script) -> Self {
        Self {
            faces: Faces::Scripted(script),
            fail_init: false,
            delay: Duration::ZERO,
        }
    }

    pub fn failing_init() -> Self {
        Self {
            fail_init: true,
            ..Self::with_faces(vec![])
        }
    }

    /// Sleep this long inside every detection call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl EmbeddingProvider for FakeProvider {
    fn initialize(&mut self) -> Result<bool, ProviderError> {
        if self.fail_init {
            return Err(ProviderError::ModelLoad("model file missing".into()));
        }
        Ok(true)
    }

    fn detect_faces(&mut self, _frame: &[u8], _width: u32, _height: u32) -> Result<Vec<DetectedFace>, ProviderError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let descriptors = match &self.faces {
            Faces::Fixed(d) => d.clone(),
            Faces::Scripted(script) => match script.next() {
                Some(Ok(d)) => d,
                Some(Err(())) => return Err(ProviderError::InferenceFailed("scripted failure".into())),
                None => Vec::new(),
            },
        };
        Ok(descriptors.into_iter().map(face).collect())
    }
}

pub struct FakeStream {
    sequence: AtomicU32,
    stopped: AtomicBool,
}

impl VideoStream for FakeStream {
    fn device_id(&self) -> &str {
        "/dev/video-fake"
    }

    fn resolution(&self) -> (u32, u32) {
        (2, 2)
    }

    fn read_frame(&self) -> Result<Frame, CameraError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(CameraError::CaptureFailed("stream stopped".into()));
        }
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        Ok(Frame::new(vec![128; 4], 2, 2, sequence))
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

pub struct FakeBackend {
    devices: Vec<DeviceInfo>,
    opened: AtomicUsize,
}

impl FakeBackend {
    /// Streams opened so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl VideoBackend for FakeBackend {
    fn enumerate(&self) -> Result<Vec<DeviceInfo>, CameraError> {
        Ok(self.devices.clone())
    }

    fn open(&self, _request: &StreamRequest) -> Result<Arc<dyn VideoStream>, CameraError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeStream {
            sequence: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
        }))
    }
}

/// Camera plumbing shared by engine tests.
pub struct Rig {
    pub backend: Arc<FakeBackend>,
    pub surfaces: Arc<SurfaceSlot>,
}

impl Rig {
    pub fn new() -> Self {
        Self::with_devices(vec![DeviceInfo {
            id: "/dev/video-fake".into(),
            name: "Fake Camera".into(),
            driver: "fake".into(),
            bus: "test".into(),
        }])
    }

    pub fn without_devices() -> Self {
        Self::with_devices(Vec::new())
    }

    fn with_devices(devices: Vec<DeviceInfo>) -> Self {
        Self {
            backend: Arc::new(FakeBackend {
                devices,
                opened: AtomicUsize::new(0),
            }),
            surfaces: Arc::new(SurfaceSlot::with(Arc::new(FrameSurface::new()))),
        }
    }
}

/// Engine over an in-memory store with short timings.
pub fn engine_with(rig: &Rig, provider: FakeProvider) -> FaceRecognitionEngine {
    engine_with_store(rig, provider, DescriptorStore::in_memory())
}

/// Store that can never be opened.
pub fn unavailable_store() -> DescriptorStore {
    DescriptorStore::open("/dev/null/presence/descriptors.db")
}

pub fn engine_with_store(rig: &Rig, provider: FakeProvider, store: DescriptorStore) -> FaceRecognitionEngine {
    let capture = CaptureOptions {
        surface_attempts: 5,
        surface_interval: Duration::from_millis(10),
        ready_timeout: Duration::from_secs(2),
        ..CaptureOptions::default()
    };
    let camera = CaptureSession::new(
        Arc::clone(&rig.backend) as Arc<dyn VideoBackend>,
        Arc::clone(&rig.surfaces) as Arc<dyn presence_hw::SurfaceProvider>,
        capture,
    );
    let options = EngineOptions {
        recognition_interval: Duration::from_millis(20),
        enroll_sample_delay: Duration::from_millis(5),
        ..EngineOptions::default()
    };
    FaceRecognitionEngine::new(
        provider,
        Arc::new(store),
        Arc::new(camera),
        options,
    )
}
