//! Render backends. The pipeline talks to a renderer through
//! `RenderBackend`; production pools hold MapLibre-backed instances, tests
//! substitute a deterministic stub.

use std::num::NonZeroU32;

use maplibre_native::ImageRendererBuilder;
use url::Url;

use crate::error::ServeError;
use crate::models::{RawImage, RenderJob};

/// One pooled renderer. `render` blocks and is expected to run on a
/// blocking worker; the returned buffer is premultiplied RGBA at
/// `pixel_ratio` times the job's logical dimensions.
pub trait RenderBackend: Send + 'static {
    fn render(&mut self, job: &RenderJob) -> Result<RawImage, ServeError>;
}

/// MapLibre-native backend. The underlying surface is created per render
/// with the job's dimensions, since static requests change size from call
/// to call; the style document is loaded from the binding's persisted
/// `file://` URL.
pub struct MlRenderer {
    style_url: Url,
    pixel_ratio: f32,
}

impl MlRenderer {
    pub fn new(style_url: Url, pixel_ratio: f32) -> Self {
        Self {
            style_url,
            pixel_ratio,
        }
    }
}

impl RenderBackend for MlRenderer {
    fn render(&mut self, job: &RenderJob) -> Result<RawImage, ServeError> {
        let width = NonZeroU32::new(job.width)
            .ok_or_else(|| ServeError::bad_request("render width must be positive"))?;
        let height = NonZeroU32::new(job.height)
            .ok_or_else(|| ServeError::bad_request("render height must be positive"))?;

        let builder = ImageRendererBuilder::new()
            .with_size(width, height)
            .with_pixel_ratio(self.pixel_ratio);
        let mut renderer = builder.build_static_renderer();
        renderer.load_style_from_url(&self.style_url);

        let result = renderer
            .render_static(
                job.center.1,
                job.center.0,
                job.zoom,
                job.bearing,
                job.pitch,
            )
            .map_err(|e| ServeError::Render(e.to_string()))?;

        let image = result.as_image();
        Ok(RawImage {
            width: image.width(),
            height: image.height(),
            data: image.as_raw().clone(),
        })
    }
}

/// Deterministic backend used by the test suites: fills the requested
/// surface with one premultiplied color and remembers the jobs it ran.
pub struct StubRenderer {
    pub color: [u8; 4],
    pub pixel_ratio: u32,
    pub jobs: Vec<RenderJob>,
}

impl StubRenderer {
    pub fn new(color: [u8; 4], pixel_ratio: u32) -> Self {
        Self {
            color,
            pixel_ratio,
            jobs: Vec::new(),
        }
    }
}

impl RenderBackend for StubRenderer {
    fn render(&mut self, job: &RenderJob) -> Result<RawImage, ServeError> {
        self.jobs.push(job.clone());
        let width = job.width * self.pixel_ratio;
        let height = job.height * self.pixel_ratio;
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for _ in 0..width * height {
            data.extend_from_slice(&self.color);
        }
        Ok(RawImage {
            width,
            height,
            data,
        })
    }
}
