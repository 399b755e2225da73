//! In-process image backend for tests and offline runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{ImageBackend, ImageBackendFactory, ImageRequest, RenderProfile};
use crate::error::Result;
use crate::PipelineError;

/// A 2x2 8-bit RGB PNG.
pub const SAMPLE_PNG: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x02, 0x08, 0x02, 0x00, 0x00, 0x00, 0xfd, 0xd4, 0x9a,
    0x73, 0x00, 0x00, 0x00, 0x10, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x38, 0x51, 0x61, 0x03,
    0x44, 0x0c, 0x10, 0x0a, 0x00, 0x2b, 0xce, 0x05, 0xf1, 0xd0, 0x7a, 0xed, 0x5a, 0x00, 0x00, 0x00,
    0x00, 0x49, 0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

#[derive(Debug, Default)]
struct Shared {
    created: Mutex<Vec<&'static str>>,
    requests: Mutex<Vec<ImageRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Factory handing out [`MockImageBackend`]s that share one call log.
#[derive(Debug, Default)]
pub struct MockImageFactory {
    shared: Arc<Shared>,
    fail_renders: bool,
}

impl MockImageFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every render fails with `BackendUnavailable`.
    pub fn failing_renders(mut self) -> Self {
        self.fail_renders = true;
        self
    }

    /// Profile keys in construction order.
    pub fn created(&self) -> Vec<&'static str> {
        self.shared
            .created
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Every request received by any backend of this factory.
    pub fn requests(&self) -> Vec<ImageRequest> {
        self.shared
            .requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Highest number of renders observed running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.shared.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageBackendFactory for MockImageFactory {
    async fn create(&self, profile: &RenderProfile) -> Result<Arc<dyn ImageBackend>> {
        if let Ok(mut created) = self.shared.created.lock() {
            created.push(profile.key);
        }
        Ok(Arc::new(MockImageBackend {
            shared: self.shared.clone(),
            fail: self.fail_renders,
        }))
    }
}

/// Returns [`SAMPLE_PNG`] for every request.
#[derive(Debug)]
pub struct MockImageBackend {
    shared: Arc<Shared>,
    fail: bool,
}

#[async_trait]
impl ImageBackend for MockImageBackend {
    async fn generate(&self, request: &ImageRequest) -> Result<Vec<u8>> {
        let now = self.shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Ok(mut requests) = self.shared.requests.lock() {
            requests.push(request.clone());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail {
            return Err(PipelineError::BackendUnavailable {
                backend: "mock-image".into(),
                reason: "scripted failure".into(),
            });
        }
        Ok(SAMPLE_PNG.to_vec())
    }

    fn name(&self) -> &'static str {
        "mock-image"
    }
}
