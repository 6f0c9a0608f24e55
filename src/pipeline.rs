//! The render pipeline: validate the request, compute the renderer
//! parameterization, run the render on a pooled backend, post-process the
//! raw buffer (un-premultiplication, zoom-0 upscale correction, margin
//! extraction) and composite overlay, watermark and attribution before
//! encoding.

use std::io::Cursor;

use ab_glyph::{FontArc, PxScale};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::{self, FilterType};
use image::{ExtendedColorType, ImageEncoder, Rgba, RgbaImage};
use imageproc::drawing::{draw_text_mut, text_size};

use crate::config::Config;
use crate::error::ServeError;
use crate::fonts;
use crate::mercator::Mercator;
use crate::models::{ImageFormat, RenderJob, RenderMode};
use crate::registry::StyleBinding;

/// Latitude ceiling accepted from clients.
const MAX_LAT: f64 = 85.06;

#[derive(Clone)]
pub struct PipelineSettings {
    pub max_size: u32,
    pub tile_margin: u32,
    pub jpeg_quality: u8,
    pub webp_quality: f32,
    pub text_face: Option<FontArc>,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_size: config.options.max_size,
            tile_margin: config.options.tile_margin,
            jpeg_quality: config.format_quality.jpeg,
            webp_quality: config.format_quality.webp,
            text_face: fonts::load_text_face(config.options.watermark_font.as_deref()),
        }
    }
}

/// A fully decoded image request in request-space coordinates (256px tile
/// zoom convention).
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub z: f64,
    pub lon: f64,
    pub lat: f64,
    pub bearing: f64,
    pub pitch: f64,
    pub width: u32,
    pub height: u32,
    pub scale: u32,
    pub format: ImageFormat,
    pub mode: RenderMode,
}

/// Render, post-process, composite and encode one image.
pub async fn respond_image(
    settings: &PipelineSettings,
    binding: &StyleBinding,
    req: &ImageRequest,
    overlay: Option<RgbaImage>,
    attribution: Option<&str>,
) -> Result<Vec<u8>, ServeError> {
    validate(settings, req)?;

    let tile_margin = match req.mode {
        RenderMode::Tile => settings.tile_margin,
        RenderMode::Static => 0,
    };

    // The renderer lays out 512px tiles, one zoom below the 256px request
    // grid.
    let mlgl_z = (req.z - 1.0).max(0.0);
    let mut render_w = req.width;
    let mut render_h = req.height;
    if req.z == 0.0 {
        // A zoom-0 render comes back as one 512-tile; double the surface
        // and shrink afterwards so the tile stays 256-equivalent.
        render_w *= 2;
        render_h *= 2;
    }
    let with_margin = req.z > 2.0 && tile_margin > 0;
    if with_margin {
        render_w += 2 * tile_margin;
        render_h += 2 * tile_margin;
    }

    let job = RenderJob {
        zoom: mlgl_z,
        center: (req.lon, req.lat),
        bearing: req.bearing,
        pitch: req.pitch,
        width: render_w,
        height: render_h,
    };

    let pool = binding
        .pool(req.mode, tile_margin, req.scale)
        .ok_or_else(|| ServeError::bad_request(format!("unsupported scale @{}x", req.scale)))?;
    let guard = pool.acquire().await?;

    let render_job = job.clone();
    let mut raw = tokio::task::spawn_blocking(move || {
        let mut guard = guard;
        guard.render(&render_job)
        // Guard drops here: the instance returns to the pool even when the
        // render failed or the requester has gone away.
    })
    .await
    .map_err(|e| ServeError::Render(format!("render task failed: {e}")))??;

    unpremultiply(&mut raw.data);
    let mut image = RgbaImage::from_raw(raw.width, raw.height, raw.data)
        .ok_or_else(|| ServeError::Render("renderer returned a short buffer".into()))?;

    let final_w = req.width * req.scale;
    let final_h = req.height * req.scale;

    if req.z == 0.0 {
        image = imageops::resize(&image, final_w, final_h, FilterType::Lanczos3);
    }

    if with_margin {
        let overshoot = pole_overshoot(req.z, (req.lon, req.lat), req.height, tile_margin);
        let crop_x = tile_margin * req.scale;
        let crop_y = ((tile_margin as f64 + overshoot) * req.scale as f64).round().max(0.0) as u32;
        let crop_y = crop_y.min(image.height().saturating_sub(final_h));
        image = imageops::crop_imm(&image, crop_x, crop_y, final_w, final_h).to_image();
    }

    if let Some(overlay) = overlay {
        imageops::overlay(&mut image, &overlay, 0, 0);
    }
    if let Some(watermark) = &binding.watermark {
        draw_watermark(&mut image, watermark, req.scale, settings.text_face.as_ref());
    }
    if req.mode == RenderMode::Static {
        if let Some(text) = attribution {
            draw_attribution(&mut image, text, req.scale, settings.text_face.as_ref());
        }
    }

    encode(settings, &image, req.format)
}

fn validate(settings: &PipelineSettings, req: &ImageRequest) -> Result<(), ServeError> {
    if !req.lon.is_finite() || !req.lat.is_finite() || req.lon.abs() > 180.0 || req.lat.abs() > MAX_LAT
    {
        return Err(ServeError::bad_request("Invalid center"));
    }
    if !req.z.is_finite() || !req.bearing.is_finite() || !req.pitch.is_finite() {
        return Err(ServeError::bad_request("Invalid center"));
    }
    if req.width.min(req.height) == 0 || req.scale == 0 {
        return Err(ServeError::bad_request("Invalid size"));
    }
    if req.width.max(req.height).saturating_mul(req.scale) > settings.max_size {
        return Err(ServeError::bad_request("Invalid size"));
    }
    Ok(())
}

/// How far the padded request window reaches past the world's vertical
/// edge at `z`; negative toward the north pole, positive toward the south.
/// The margin crop shifts by this amount so it never samples beyond the
/// rendered world.
fn pole_overshoot(z: f64, center: (f64, f64), height: u32, margin: u32) -> f64 {
    let merc = Mercator::new(256);
    let y = merc.px(center, z).1;
    let world = merc.world_size(z);
    let half = height as f64 / 2.0 + margin as f64;
    (y - half).min(0.0).max(y + half - world)
}

/// In-place conversion of premultiplied RGBA to straight alpha. A no-op on
/// already-straight fully opaque pixels, which keeps the operation
/// idempotent where it matters.
pub fn unpremultiply(data: &mut [u8]) {
    for pixel in data.chunks_exact_mut(4) {
        let alpha = pixel[3] as u16;
        if alpha == 0 {
            pixel[0] = 0;
            pixel[1] = 0;
            pixel[2] = 0;
        } else if alpha < 255 {
            for channel in 0..3 {
                pixel[channel] = ((pixel[channel] as u16 * 255 + alpha / 2) / alpha).min(255) as u8;
            }
        }
    }
}

/// Stamp semi-transparent text with a light halo at the bottom-left
/// corner.
fn draw_watermark(image: &mut RgbaImage, text: &str, scale: u32, face: Option<&FontArc>) {
    let Some(font) = face else { return };
    let size = PxScale::from(10.0 * scale as f32);
    let (w, h) = image.dimensions();
    let (_, th) = text_size(size, font, text);

    let mut layer = RgbaImage::new(w, h);
    let x = (5 * scale) as i32;
    let y = h as i32 - (5 * scale) as i32 - th as i32;
    let step = scale.max(1) as i32;
    for (dx, dy) in [(-step, 0), (step, 0), (0, -step), (0, step)] {
        draw_text_mut(
            &mut layer,
            Rgba([255, 255, 255, 102]),
            x + dx,
            y + dy,
            size,
            font,
            text,
        );
    }
    draw_text_mut(&mut layer, Rgba([0, 0, 0, 102]), x, y, size, font, text);
    imageops::overlay(image, &layer, 0, 0);
}

/// Black label on a translucent white box, right-aligned at the bottom.
fn draw_attribution(image: &mut RgbaImage, text: &str, scale: u32, face: Option<&FontArc>) {
    let Some(font) = face else { return };
    let size = PxScale::from(10.0 * scale as f32);
    let (w, h) = image.dimensions();
    let (tw, th) = text_size(size, font, text);

    let pad = 2 * scale;
    let rect_w = (tw + 2 * pad).min(w);
    let rect_h = (th + 2 * pad).min(h);
    let x0 = w.saturating_sub(6 * scale + rect_w);
    let y0 = h.saturating_sub(6 * scale + rect_h);

    blend_rect(image, x0, y0, rect_w, rect_h, [255, 255, 255, 204]);

    let mut layer = RgbaImage::new(w, h);
    draw_text_mut(
        &mut layer,
        Rgba([0, 0, 0, 255]),
        (x0 + pad) as i32,
        (y0 + pad) as i32,
        size,
        font,
        text,
    );
    imageops::overlay(image, &layer, 0, 0);
}

/// Source-over blend a solid color rectangle, since a plain rectangle draw
/// would replace the pixels underneath instead of shading them.
fn blend_rect(image: &mut RgbaImage, x0: u32, y0: u32, rect_w: u32, rect_h: u32, color: [u8; 4]) {
    let alpha = color[3] as u32;
    for y in y0..(y0 + rect_h).min(image.height()) {
        for x in x0..(x0 + rect_w).min(image.width()) {
            let pixel = image.get_pixel_mut(x, y);
            for c in 0..3 {
                let blended =
                    (color[c] as u32 * alpha + pixel.0[c] as u32 * (255 - alpha)) / 255;
                pixel.0[c] = blended as u8;
            }
            pixel.0[3] = pixel.0[3].max(color[3]);
        }
    }
}

fn encode(
    settings: &PipelineSettings,
    image: &RgbaImage,
    format: ImageFormat,
) -> Result<Vec<u8>, ServeError> {
    let (w, h) = image.dimensions();
    match format {
        ImageFormat::Png => {
            let mut out = Cursor::new(Vec::new());
            // Adaptive filtering off: tiles compress fine without it and
            // encode measurably faster.
            PngEncoder::new_with_quality(&mut out, CompressionType::Default, PngFilter::NoFilter)
                .write_image(image.as_raw(), w, h, ExtendedColorType::Rgba8)
                .map_err(|e| ServeError::Internal(format!("png encode failed: {e}")))?;
            Ok(out.into_inner())
        }
        ImageFormat::Jpeg => {
            // No alpha in jpeg: composite onto white first.
            let mut rgb = image::RgbImage::new(w, h);
            for (x, y, pixel) in image.enumerate_pixels() {
                let [r, g, b, a] = pixel.0;
                let a = a as u32;
                let blend = |c: u8| ((c as u32 * a + 255 * (255 - a)) / 255) as u8;
                rgb.put_pixel(x, y, image::Rgb([blend(r), blend(g), blend(b)]));
            }
            let mut out = Cursor::new(Vec::new());
            JpegEncoder::new_with_quality(&mut out, settings.jpeg_quality)
                .encode(rgb.as_raw(), w, h, ExtendedColorType::Rgb8)
                .map_err(|e| ServeError::Internal(format!("jpeg encode failed: {e}")))?;
            Ok(out.into_inner())
        }
        ImageFormat::Webp => {
            let encoded = webp::Encoder::from_rgba(image.as_raw(), w, h)
                .encode(settings.webp_quality.clamp(0.0, 100.0));
            Ok(encoded.to_vec())
        }
    }
}
