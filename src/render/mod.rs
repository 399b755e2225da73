//! Illustration rendering: one description in, one image file out.
//!
//! ```text
//! description ──► styled prompt ──► Renderer ──► profile slot (cached, serialized)
//!                                                    │
//!                                       ImageBackendFactory (first use only)
//!                                                    │
//!                                       ImageBackend::generate ──► PNG bytes ──► output_path
//! ```
//!
//! Backends are expensive to construct (the diffusion server loads a
//! checkpoint), so the [`Renderer`] creates one per profile on first use and
//! keeps it for its whole lifetime. Renders against one profile never
//! overlap.

pub mod mock;
pub mod txt2img;

pub use mock::{MockImageBackend, MockImageFactory};
pub use txt2img::{Txt2ImgBackend, Txt2ImgFactory};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::store::write_atomic;
use crate::PipelineError;

/// Wraps every illustration description.
pub const STYLE_TEMPLATE: &str = "Style: hand-drawn, warm, and poetic—blending detailed, nature-rich backgrounds with simple, expressive characters.
It captures everyday beauty, quiet magic, and emotional depth through soft colors, whimsical worlds, and gentle pacing.

Content: {content}";

pub const NEGATIVE_PROMPT: &str = "blurry, distorted, creepy, low quality, deformed, disfigured";

/// Sampler settings for one diffusion model.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderProfile {
    /// Lowercase lookup key.
    pub key: &'static str,
    /// Checkpoint the backend loads for this profile.
    pub checkpoint: &'static str,
    pub steps: u32,
    /// Classifier-free guidance scale.
    pub guidance: f32,
    /// Decode the latent in tiles (VAE tiling).
    pub tiling: bool,
}

pub const PROFILES: &[RenderProfile] = &[
    RenderProfile {
        key: "sdxl",
        checkpoint: "stabilityai/sdxl-turbo",
        steps: 1,
        guidance: 0.0,
        tiling: false,
    },
    RenderProfile {
        key: "sd35",
        checkpoint: "stabilityai/stable-diffusion-3.5-medium",
        steps: 20,
        guidance: 7.5,
        tiling: true,
    },
];

/// Look up a profile by key, ignoring case.
pub fn profile(key: &str) -> Result<&'static RenderProfile> {
    let wanted = key.trim().to_lowercase();
    PROFILES
        .iter()
        .find(|p| p.key == wanted)
        .ok_or_else(|| PipelineError::UnknownProfile {
            profile: key.to_string(),
            known: profile_keys().join(", "),
        })
}

pub fn profile_keys() -> Vec<&'static str> {
    PROFILES.iter().map(|p| p.key).collect()
}

/// The final diffusion prompt for an illustration description.
pub fn styled_prompt(description: &str) -> String {
    STYLE_TEMPLATE.replace("{content}", description)
}

/// A fully resolved text-to-image request.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: u32,
    pub guidance: f32,
    pub tiling: bool,
    pub width: u32,
    pub height: u32,
}

/// A text-to-image service bound to one profile.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    /// Produce one encoded raster image.
    async fn generate(&self, request: &ImageRequest) -> Result<Vec<u8>>;

    fn name(&self) -> &'static str;
}

/// Constructs the backend for a profile. Called at most once per profile by
/// a [`Renderer`] unless construction fails.
#[async_trait]
pub trait ImageBackendFactory: Send + Sync {
    async fn create(&self, profile: &RenderProfile) -> Result<Arc<dyn ImageBackend>>;
}

type Slot = Arc<Mutex<Option<Arc<dyn ImageBackend>>>>;

/// Renders illustrations, owning the per-profile backend cache.
pub struct Renderer {
    factory: Arc<dyn ImageBackendFactory>,
    slots: Mutex<HashMap<&'static str, Slot>>,
    width: u32,
    height: u32,
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

impl Renderer {
    /// Create a renderer producing 1024x1024 images.
    pub fn new(factory: Arc<dyn ImageBackendFactory>) -> Self {
        Self {
            factory,
            slots: Mutex::new(HashMap::new()),
            width: 1024,
            height: 1024,
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Profiles whose backend has been constructed.
    pub async fn cached_profiles(&self) -> Vec<&'static str> {
        let slots = self.slots.lock().await;
        let mut keys = Vec::new();
        for (key, slot) in slots.iter() {
            if slot.lock().await.is_some() {
                keys.push(*key);
            }
        }
        keys.sort_unstable();
        keys
    }

    async fn slot(&self, key: &'static str) -> Slot {
        let mut slots = self.slots.lock().await;
        slots.entry(key).or_default().clone()
    }

    /// Render `description` with the profile named `profile_key` and write the
    /// image to `output_path`, replacing any file there.
    ///
    /// Fails with `UnknownProfile` before touching any backend or file.
    pub async fn render(&self, description: &str, profile_key: &str, output_path: &Path) -> Result<()> {
        let profile = profile(profile_key)?;
        let request = ImageRequest {
            prompt: styled_prompt(description),
            negative_prompt: NEGATIVE_PROMPT.to_string(),
            steps: profile.steps,
            guidance: profile.guidance,
            tiling: profile.tiling,
            width: self.width,
            height: self.height,
        };

        let slot = self.slot(profile.key).await;
        let mut guard = slot.lock().await;
        let backend = match guard.as_ref() {
            Some(backend) => backend.clone(),
            None => {
                tracing::info!(profile = profile.key, checkpoint = profile.checkpoint, "initializing image backend");
                let backend = self.factory.create(profile).await?;
                *guard = Some(backend.clone());
                backend
            }
        };

        tracing::debug!(profile = profile.key, backend = backend.name(), prompt = %request.prompt, "rendering image");
        let bytes = backend.generate(&request).await?;
        drop(guard);

        if bytes.is_empty() {
            return Err(PipelineError::MalformedResponse {
                stage: "render".into(),
                reason: "image backend returned no data".into(),
                raw: String::new(),
            });
        }

        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_atomic(output_path, &bytes).await?;
        tracing::info!(profile = profile.key, path = %output_path.display(), bytes = bytes.len(), "image written");
        Ok(())
    }
}
