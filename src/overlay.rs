//! Overlay rasterization: parses the `path=` / `marker=` query syntax,
//! projects the geometry into canvas pixel space at the resolved zoom and
//! draws it into an RGBA buffer that the pipeline composites over the base
//! render. Marker icons are fetched up front so the canvas pass never
//! waits on I/O.

use std::path::PathBuf;

use base64::Engine as _;
use image::RgbaImage;
use tiny_skia::{
    FillRule, Paint, PathBuilder, Pixmap, PixmapPaint, Stroke, Transform,
};
use tracing::warn;

use crate::error::ServeError;
use crate::mercator::Mercator;
use crate::models::{
    parse_color, LineCap, LineJoin, MarkerIcon, MarkerSpec, OverlayQuery, PathSpec, Rgba,
    DEFAULT_STROKE,
};
use crate::pipeline::unpremultiply;

/// Marker icon fill when the query does not set one.
const DEFAULT_PIN_COLOR: Rgba = [63, 177, 206, 255];

/// Gates and locations for marker icon loading.
#[derive(Debug, Clone, Default)]
pub struct OverlaySettings {
    pub icons_dir: PathBuf,
    pub available_icons: Vec<String>,
    pub allow_remote_marker_icons: bool,
    pub allow_inline_marker_images: bool,
}

// --- Query parsing ---

/// Parse the overlay-relevant portion of a decoded query string. Scalar
/// options are read first so `latlng` applies to every coordinate pair no
/// matter where it appears.
pub fn parse_overlay_query(pairs: &[(String, String)]) -> Result<OverlayQuery, ServeError> {
    let mut query = OverlayQuery::default();

    for (key, value) in pairs {
        match key.as_str() {
            "fill" => query.fill = parse_color(value),
            "stroke" => query.stroke = parse_color(value),
            "width" => query.width = value.parse().ok(),
            "border" => query.border = parse_color(value),
            "borderwidth" => query.border_width = value.parse().ok(),
            "linecap" => {
                query.line_cap = match value.as_str() {
                    "round" => LineCap::Round,
                    "square" => LineCap::Square,
                    _ => LineCap::Butt,
                }
            }
            "linejoin" => {
                query.line_join = match value.as_str() {
                    "round" => LineJoin::Round,
                    "bevel" => LineJoin::Bevel,
                    _ => LineJoin::Miter,
                }
            }
            "padding" => query.padding = value.parse().ok(),
            "latlng" => query.latlng = value == "1" || value == "true",
            "maxzoom" => query.maxzoom = value.parse().ok(),
            "attributionText" => query.attribution_text = Some(value.clone()),
            _ => {}
        }
    }

    for (key, value) in pairs {
        match key.as_str() {
            "path" => query.paths.push(parse_path(value, query.latlng)?),
            "marker" => query.markers.push(parse_marker(value, query.latlng)?),
            _ => {}
        }
    }

    Ok(query)
}

/// `(lng,lat)` pair, or `(lat,lng)` when the `latlng` flag is set.
pub fn parse_coordinate_pair(value: &str, latlng: bool) -> Option<(f64, f64)> {
    let (first, second) = value.split_once(',')?;
    let a: f64 = first.trim().parse().ok()?;
    let b: f64 = second.trim().parse().ok()?;
    if !a.is_finite() || !b.is_finite() {
        return None;
    }
    Some(if latlng { (b, a) } else { (a, b) })
}

fn parse_path(value: &str, latlng: bool) -> Result<PathSpec, ServeError> {
    let mut path = PathSpec::default();
    for segment in value.split('|') {
        if segment.is_empty() {
            continue;
        }
        if let Some(color) = segment.strip_prefix("fill:") {
            path.fill = parse_color(color);
        } else if let Some(color) = segment.strip_prefix("stroke:") {
            path.stroke = parse_color(color);
        } else if let Some(width) = segment.strip_prefix("width:") {
            path.width = width.parse().ok();
        } else if let Some(encoded) = segment.strip_prefix("enc:") {
            for (lat, lng) in decode_polyline(encoded) {
                path.points.push((lng, lat));
            }
        } else {
            let point = parse_coordinate_pair(segment, latlng).ok_or_else(|| {
                ServeError::bad_request(format!("invalid path coordinate '{segment}'"))
            })?;
            path.points.push(point);
        }
    }
    Ok(path)
}

fn parse_marker(value: &str, latlng: bool) -> Result<MarkerSpec, ServeError> {
    let mut parts = value.split('|');
    let location = parts
        .next()
        .and_then(|loc| parse_coordinate_pair(loc, latlng))
        .ok_or_else(|| ServeError::bad_request(format!("invalid marker location in '{value}'")))?;

    let icon = classify_icon(parts.next().unwrap_or("default"))?;

    let mut marker = MarkerSpec {
        location,
        icon,
        scale: 1.0,
        offset_x: 0.0,
        offset_y: 0.0,
        color: None,
    };

    for option in parts {
        if let Some(scale) = option.strip_prefix("scale:") {
            if let Ok(scale) = scale.parse::<f64>() {
                if scale >= 0.0 {
                    marker.scale = scale;
                }
            }
        } else if let Some(offset) = option.strip_prefix("offset:") {
            let (x, y) = match offset.split_once(',') {
                Some((x, y)) => (x, Some(y)),
                None => (offset, None),
            };
            marker.offset_x = x.parse().unwrap_or(0.0);
            marker.offset_y = y.and_then(|y| y.parse().ok()).unwrap_or(0.0);
        } else if let Some(color) = option.strip_prefix("color:") {
            marker.color = parse_color(color);
        }
    }

    Ok(marker)
}

fn classify_icon(raw: &str) -> Result<MarkerIcon, ServeError> {
    if raw.is_empty() || raw == "default" {
        return Ok(MarkerIcon::Default);
    }
    if raw.starts_with("data:") {
        return Ok(MarkerIcon::DataUrl(raw.to_string()));
    }
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return Ok(MarkerIcon::Remote(raw.to_string()));
    }
    let sanitized = raw.trim_start_matches('/');
    if sanitized.contains("..") {
        return Err(ServeError::bad_request(format!("invalid marker icon '{raw}'")));
    }
    Ok(MarkerIcon::Local(sanitized.to_string()))
}

/// Google polyline decoding (precision 5). Returns (lat, lng) pairs.
pub fn decode_polyline(encoded: &str) -> Vec<(f64, f64)> {
    let mut points = Vec::new();
    let mut bytes = encoded.bytes();
    let mut lat = 0i64;
    let mut lng = 0i64;

    while let Some(dlat) = next_polyline_value(&mut bytes) {
        let Some(dlng) = next_polyline_value(&mut bytes) else {
            break;
        };
        lat += dlat;
        lng += dlng;
        points.push((lat as f64 / 1e5, lng as f64 / 1e5));
    }
    points
}

fn next_polyline_value(bytes: &mut std::str::Bytes<'_>) -> Option<i64> {
    let mut result = 0i64;
    let mut shift = 0u32;
    loop {
        let byte = bytes.next()? as i64 - 63;
        if byte < 0 {
            return None;
        }
        result |= (byte & 0x1f) << shift;
        shift += 5;
        if byte < 0x20 {
            break;
        }
    }
    Some(if result & 1 != 0 {
        !(result >> 1)
    } else {
        result >> 1
    })
}

// --- Rasterization ---

struct LoadedMarker {
    spec: MarkerSpec,
    pixmap: Pixmap,
    /// Canvas-space scale applied at draw time.
    factor: f64,
}

/// Rasterize paths and markers into a `(scale*width) x (scale*height)`
/// straight-alpha RGBA buffer, or `None` when there is nothing to draw.
/// `z`, `center` and `bearing` are the request-space view parameters of
/// the base render the overlay must align with.
pub async fn render_overlay(
    z: f64,
    center: (f64, f64),
    bearing: f64,
    width: u32,
    height: u32,
    scale: u32,
    query: &OverlayQuery,
    settings: &OverlaySettings,
    client: &reqwest::Client,
) -> Result<Option<RgbaImage>, ServeError> {
    if query.is_empty() || width == 0 || height == 0 {
        return Ok(None);
    }

    let markers = load_markers(&query.markers, settings, client, scale).await?;

    let mut canvas = Pixmap::new(width * scale, height * scale)
        .ok_or_else(|| ServeError::Internal("overlay canvas allocation failed".into()))?;

    let merc = Mercator::new(256);
    let mut center_px = merc.px(center, z);

    // Match the base render's clamping when the window reaches past the
    // poles, so overlay geometry stays registered with the map.
    let world = merc.world_size(z);
    let max_edge = center_px.1 + height as f64 / 2.0;
    let min_edge = center_px.1 - height as f64 / 2.0;
    if max_edge > world {
        center_px.1 -= max_edge - world;
    } else if min_edge < 0.0 {
        center_px.1 -= min_edge;
    }

    let mut transform = Transform::identity();
    if bearing != 0.0 {
        transform = transform.post_rotate(-bearing as f32);
    }
    transform = transform
        .post_translate(width as f32 / 2.0, height as f32 / 2.0)
        .post_scale(scale as f32, scale as f32);

    for path in &query.paths {
        draw_path(&mut canvas, path, query, &merc, z, center_px, transform);
    }
    for marker in &markers {
        draw_marker(&mut canvas, marker, &merc, z, center_px, transform);
    }

    let mut data = canvas.take();
    unpremultiply(&mut data);
    let image = RgbaImage::from_raw(width * scale, height * scale, data)
        .ok_or_else(|| ServeError::Internal("overlay buffer size mismatch".into()))?;
    Ok(Some(image))
}

fn draw_path(
    canvas: &mut Pixmap,
    path: &PathSpec,
    query: &OverlayQuery,
    merc: &Mercator,
    z: f64,
    center_px: (f64, f64),
    transform: Transform,
) {
    if path.points.len() < 2 {
        return;
    }

    let mut builder = PathBuilder::new();
    for (i, ll) in path.points.iter().enumerate() {
        let p = merc.precise_px(*ll, z);
        // Recentered in f64 before the f32 canvas sees it; raw world
        // pixels at high zooms overflow single precision.
        let x = (p.0 - center_px.0) as f32;
        let y = (p.1 - center_px.1) as f32;
        if i == 0 {
            builder.move_to(x, y);
        } else {
            builder.line_to(x, y);
        }
    }
    if path.is_closed() {
        builder.close();
    }
    let Some(skia_path) = builder.finish() else {
        return;
    };

    let mut paint = Paint::default();
    paint.anti_alias = true;

    if let Some(fill) = path.fill.or(query.fill) {
        paint.set_color_rgba8(fill[0], fill[1], fill[2], fill[3]);
        canvas.fill_path(&skia_path, &paint, FillRule::Winding, transform, None);
    }

    let stroke_color = path.stroke.or(query.stroke).unwrap_or(DEFAULT_STROKE);
    let line_width = path.width.or(query.width).unwrap_or(1.0);
    let mut stroke = Stroke {
        width: line_width as f32,
        miter_limit: 10.0,
        line_cap: match query.line_cap {
            LineCap::Butt => tiny_skia::LineCap::Butt,
            LineCap::Round => tiny_skia::LineCap::Round,
            LineCap::Square => tiny_skia::LineCap::Square,
        },
        line_join: match query.line_join {
            LineJoin::Miter => tiny_skia::LineJoin::Miter,
            LineJoin::Round => tiny_skia::LineJoin::Round,
            LineJoin::Bevel => tiny_skia::LineJoin::Bevel,
        },
        ..Stroke::default()
    };

    if let Some(border) = query.border {
        let border_width = query.border_width.unwrap_or(line_width * 0.1);
        if border_width > 0.0 {
            let mut border_paint = Paint::default();
            border_paint.anti_alias = true;
            border_paint.set_color_rgba8(border[0], border[1], border[2], border[3]);
            let mut border_stroke = stroke.clone();
            border_stroke.width = (line_width + 2.0 * border_width) as f32;
            canvas.stroke_path(&skia_path, &border_paint, &border_stroke, transform, None);
        }
    }

    paint.set_color_rgba8(
        stroke_color[0],
        stroke_color[1],
        stroke_color[2],
        stroke_color[3],
    );
    stroke.width = line_width as f32;
    canvas.stroke_path(&skia_path, &paint, &stroke, transform, None);
}

fn draw_marker(
    canvas: &mut Pixmap,
    marker: &LoadedMarker,
    merc: &Mercator,
    z: f64,
    center_px: (f64, f64),
    transform: Transform,
) {
    let p = merc.precise_px(marker.spec.location, z);
    let rel_x = p.0 - center_px.0;
    let rel_y = p.1 - center_px.1;

    let w = marker.pixmap.width() as f64 * marker.factor;
    let h = marker.pixmap.height() as f64 * marker.factor;

    // Center-bottom anchor, offsets scaled by the marker's own factor.
    let x = rel_x - w / 2.0 + marker.spec.offset_x * marker.spec.scale;
    let y = rel_y - h + marker.spec.offset_y * marker.spec.scale;

    let paint = PixmapPaint {
        quality: tiny_skia::FilterQuality::Bilinear,
        ..PixmapPaint::default()
    };
    let placed = transform
        .pre_translate(x as f32, y as f32)
        .pre_scale(marker.factor as f32, marker.factor as f32);
    canvas.draw_pixmap(0, 0, marker.pixmap.as_ref(), &paint, placed, None);
}

async fn load_markers(
    markers: &[MarkerSpec],
    settings: &OverlaySettings,
    client: &reqwest::Client,
    canvas_scale: u32,
) -> Result<Vec<LoadedMarker>, ServeError> {
    let mut tasks = tokio::task::JoinSet::new();
    for (index, spec) in markers.iter().cloned().enumerate() {
        let settings = settings.clone();
        let client = client.clone();
        tasks.spawn(async move {
            let loaded = load_marker_pixmap(&spec, &settings, &client, canvas_scale).await;
            (index, spec, loaded)
        });
    }

    let mut slots: Vec<Option<LoadedMarker>> = Vec::new();
    slots.resize_with(markers.len(), || None);
    while let Some(joined) = tasks.join_next().await {
        let (index, spec, loaded) =
            joined.map_err(|e| ServeError::Internal(format!("marker load task failed: {e}")))?;
        if let Some((pixmap, factor)) = loaded? {
            slots[index] = Some(LoadedMarker {
                spec,
                pixmap,
                factor,
            });
        }
    }
    Ok(slots.into_iter().flatten().collect())
}

/// Fetch and decode one marker icon. Fetch failures skip the marker with a
/// warning; disallowed icon sources are a client error.
async fn load_marker_pixmap(
    spec: &MarkerSpec,
    settings: &OverlaySettings,
    client: &reqwest::Client,
    canvas_scale: u32,
) -> Result<Option<(Pixmap, f64)>, ServeError> {
    match &spec.icon {
        MarkerIcon::Default => {
            let color = spec.color.unwrap_or(DEFAULT_PIN_COLOR);
            let pixmap = default_pin_pixmap(color)
                .ok_or_else(|| ServeError::Internal("default marker rasterization failed".into()))?;
            // The canvas pre-applies the pixel ratio; the built-in pin is
            // sized in physical pixels, so compensate here.
            Ok(Some((pixmap, spec.scale / canvas_scale as f64)))
        }
        MarkerIcon::DataUrl(url) => {
            if !settings.allow_inline_marker_images {
                return Err(ServeError::bad_request("inline marker images are disabled"));
            }
            let payload = url
                .split_once(',')
                .map(|(_, payload)| payload)
                .ok_or_else(|| ServeError::bad_request("malformed data url"))?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(payload)
                .map_err(|e| ServeError::bad_request(format!("malformed data url: {e}")))?;
            Ok(decode_icon_bytes(&bytes).map(|p| (p, spec.scale)))
        }
        MarkerIcon::Remote(url) => {
            if !settings.allow_remote_marker_icons {
                return Err(ServeError::bad_request("remote marker icons are disabled"));
            }
            match client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                    Ok(bytes) => Ok(decode_icon_bytes(&bytes).map(|p| (p, spec.scale))),
                    Err(e) => {
                        warn!("marker fetch body failed for {}: {}", url, e);
                        Ok(None)
                    }
                },
                Ok(resp) => {
                    warn!("marker fetch {} returned {}", url, resp.status());
                    Ok(None)
                }
                Err(e) => {
                    warn!("marker fetch failed for {}: {}", url, e);
                    Ok(None)
                }
            }
        }
        MarkerIcon::Local(rel) => {
            if !settings.available_icons.iter().any(|icon| icon == rel) {
                return Err(ServeError::bad_request(format!(
                    "marker icon '{rel}' is not available"
                )));
            }
            let path = settings.icons_dir.join(rel);
            match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(decode_icon_bytes(&bytes).map(|p| (p, spec.scale))),
                Err(e) => {
                    warn!("marker icon read failed for {}: {}", path.display(), e);
                    Ok(None)
                }
            }
        }
    }
}

fn decode_icon_bytes(bytes: &[u8]) -> Option<Pixmap> {
    let image = image::load_from_memory(bytes).ok()?.to_rgba8();
    rgba_image_to_pixmap(&image)
}

/// Straight-alpha image buffer into tiny-skia's premultiplied layout.
fn rgba_image_to_pixmap(image: &RgbaImage) -> Option<Pixmap> {
    let mut pixmap = Pixmap::new(image.width(), image.height())?;
    let data = pixmap.data_mut();
    for (i, pixel) in image.pixels().enumerate() {
        let [r, g, b, a] = pixel.0;
        let offset = i * 4;
        data[offset] = (r as u16 * a as u16 / 255) as u8;
        data[offset + 1] = (g as u16 * a as u16 / 255) as u8;
        data[offset + 2] = (b as u16 * a as u16 / 255) as u8;
        data[offset + 3] = a;
    }
    Some(pixmap)
}

fn default_pin_svg(color: Rgba) -> String {
    let fill = format!("#{:02x}{:02x}{:02x}", color[0], color[1], color[2]);
    let opacity = color[3] as f64 / 255.0;
    format!(
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="30" height="45" viewBox="0 0 30 45">
<path d="M15 1 C7.3 1 1 7.3 1 15 C1 25.5 15 44 15 44 C15 44 29 25.5 29 15 C29 7.3 22.7 1 15 1 Z" fill="{fill}" fill-opacity="{opacity}" stroke="#404040" stroke-opacity="0.5" stroke-width="1"/>
<circle cx="15" cy="15" r="5.5" fill="#ffffff" fill-opacity="0.85"/>
</svg>"##
    )
}

/// The canonical 30x45 pin, rasterized at its native size.
fn default_pin_pixmap(color: Rgba) -> Option<Pixmap> {
    let svg = default_pin_svg(color);
    let options = usvg::Options::default();
    let tree = usvg::Tree::from_str(&svg, &options).ok()?;
    let size = tree.size();
    let mut pixmap = Pixmap::new(size.width().round() as u32, size.height().round() as u32)?;
    resvg::render(&tree, Transform::identity(), &mut pixmap.as_mut());
    Some(pixmap)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn coordinate_pair_order_and_roundtrip() {
        assert_eq!(parse_coordinate_pair("10,20", false), Some((10.0, 20.0)));
        assert_eq!(parse_coordinate_pair("10,20", true), Some((20.0, 10.0)));
        // Swapping twice restores the original order.
        let (a, b) = parse_coordinate_pair("10,20", true).unwrap();
        assert_eq!(
            parse_coordinate_pair(&format!("{a},{b}"), true),
            Some((10.0, 20.0))
        );
        assert_eq!(parse_coordinate_pair("10", false), None);
        assert_eq!(parse_coordinate_pair("x,y", false), None);
        assert_eq!(parse_coordinate_pair("NaN,5", false), None);
    }

    #[test]
    fn polyline_decoding_matches_reference_vector() {
        let points = decode_polyline("_p~iF~ps|U_ulLnnqC_mqNvxq`@");
        assert_eq!(points.len(), 3);
        let expect = [(38.5, -120.2), (40.7, -120.95), (43.252, -126.453)];
        for (got, want) in points.iter().zip(expect.iter()) {
            assert!((got.0 - want.0).abs() < 1e-5);
            assert!((got.1 - want.1).abs() < 1e-5);
        }
    }

    #[test]
    fn path_parsing_with_style_tokens() {
        let query = parse_overlay_query(&pairs(&[(
            "path",
            "stroke:#ff0000|width:3|fill:rgba(0,255,0,0.5)|0,0|1,1|2,0",
        )]))
        .unwrap();
        let path = &query.paths[0];
        assert_eq!(path.points, vec![(0.0, 0.0), (1.0, 1.0), (2.0, 0.0)]);
        assert_eq!(path.stroke, Some([255, 0, 0, 255]));
        assert_eq!(path.width, Some(3.0));
        assert_eq!(path.fill, Some([0, 255, 0, 128]));
    }

    #[test]
    fn encoded_paths_decode_to_lnglat() {
        let query =
            parse_overlay_query(&pairs(&[("path", "enc:_p~iF~ps|U_ulLnnqC_mqNvxq`@")])).unwrap();
        let path = &query.paths[0];
        // Decoded pairs arrive as (lat, lng) and are stored as (lng, lat).
        assert!((path.points[0].0 - (-120.2)).abs() < 1e-5);
        assert!((path.points[0].1 - 38.5).abs() < 1e-5);
    }

    #[test]
    fn latlng_flag_applies_to_paths_and_markers() {
        let query = parse_overlay_query(&pairs(&[
            ("latlng", "1"),
            ("path", "10,0|20,0"),
            ("marker", "10,0|default"),
        ]))
        .unwrap();
        assert_eq!(query.paths[0].points[0], (0.0, 10.0));
        assert_eq!(query.markers[0].location, (0.0, 10.0));
    }

    #[test]
    fn marker_parsing_with_options() {
        let query = parse_overlay_query(&pairs(&[(
            "marker",
            "13.4,52.5|default|color:#ff0000|scale:2|offset:4,-6",
        )]))
        .unwrap();
        let marker = &query.markers[0];
        assert_eq!(marker.location, (13.4, 52.5));
        assert_eq!(marker.icon, MarkerIcon::Default);
        assert_eq!(marker.color, Some([255, 0, 0, 255]));
        assert_eq!(marker.scale, 2.0);
        assert_eq!(marker.offset_x, 4.0);
        assert_eq!(marker.offset_y, -6.0);
    }

    #[test]
    fn icon_classification() {
        assert_eq!(classify_icon("default").unwrap(), MarkerIcon::Default);
        assert!(matches!(
            classify_icon("data:image/png;base64,AAA").unwrap(),
            MarkerIcon::DataUrl(_)
        ));
        assert!(matches!(
            classify_icon("https://example.com/pin.png").unwrap(),
            MarkerIcon::Remote(_)
        ));
        assert_eq!(
            classify_icon("/pins/red.png").unwrap(),
            MarkerIcon::Local("pins/red.png".to_string())
        );
        assert!(classify_icon("../etc/passwd").is_err());
    }

    #[test]
    fn negative_marker_scale_is_ignored() {
        let query = parse_overlay_query(&pairs(&[("marker", "0,0|default|scale:-3")])).unwrap();
        assert_eq!(query.markers[0].scale, 1.0);
    }

    async fn render(
        query: &OverlayQuery,
        width: u32,
        height: u32,
        scale: u32,
    ) -> Option<RgbaImage> {
        render_overlay(
            2.0,
            (0.0, 0.0),
            0.0,
            width,
            height,
            scale,
            query,
            &OverlaySettings::default(),
            &reqwest::Client::new(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn empty_query_renders_nothing() {
        assert!(render(&OverlayQuery::default(), 256, 256, 1).await.is_none());
    }

    #[tokio::test]
    async fn stroked_path_crosses_window_center() {
        let query = parse_overlay_query(&pairs(&[
            ("path", "-20,-20|20,20"),
            ("stroke", "#ff0000"),
            ("width", "4"),
        ]))
        .unwrap();
        let image = render(&query, 256, 256, 1).await.unwrap();
        assert_eq!(image.dimensions(), (256, 256));

        let center = image.get_pixel(128, 128).0;
        assert!(center[3] > 0, "path should cross the window center");
        assert!(center[0] > 200, "stroke should be red");
        // A corner far from the diagonal stays empty.
        assert_eq!(image.get_pixel(250, 5).0[3], 0);
    }

    #[tokio::test]
    async fn scale_doubles_canvas_dimensions() {
        let query = parse_overlay_query(&pairs(&[("path", "-20,-20|20,20")])).unwrap();
        let image = render(&query, 256, 256, 2).await.unwrap();
        assert_eq!(image.dimensions(), (512, 512));
        assert!(image.get_pixel(256, 256).0[3] > 0);
    }

    #[tokio::test]
    async fn closed_path_fills_interior() {
        let query = parse_overlay_query(&pairs(&[(
            "path",
            "fill:#00ff00|-30,-30|30,-30|30,30|-30,30|-30,-30",
        )]))
        .unwrap();
        let image = render(&query, 256, 256, 1).await.unwrap();
        let center = image.get_pixel(128, 128).0;
        assert!(center[1] > 200, "interior should be filled green");
    }

    #[tokio::test]
    async fn border_strokes_wider_than_line() {
        let plain = parse_overlay_query(&pairs(&[
            ("path", "-40,0|40,0"),
            ("stroke", "#0000ff"),
            ("width", "2"),
        ]))
        .unwrap();
        let bordered = parse_overlay_query(&pairs(&[
            ("path", "-40,0|40,0"),
            ("stroke", "#0000ff"),
            ("width", "2"),
            ("border", "#ffff00"),
            ("borderwidth", "3"),
        ]))
        .unwrap();
        let plain_img = render(&plain, 256, 256, 1).await.unwrap();
        let bordered_img = render(&bordered, 256, 256, 1).await.unwrap();

        // Three pixels off the line axis only the border reaches.
        assert_eq!(plain_img.get_pixel(128, 125).0[3], 0);
        let edge = bordered_img.get_pixel(128, 125).0;
        assert!(edge[3] > 0);
        assert!(edge[0] > 200 && edge[1] > 200, "border should be yellow");
    }

    #[tokio::test]
    async fn default_marker_is_anchored_center_bottom() {
        let query = parse_overlay_query(&pairs(&[("marker", "0,0|default|color:#ff0000")])).unwrap();
        let image = render(&query, 256, 256, 1).await.unwrap();

        // Pin body sits above the anchor point.
        let body = image.get_pixel(128, 108).0;
        assert!(body[3] > 0, "marker body should be above the anchor");
        assert!(body[0] > 150, "pin should use the requested color");
        // Below the anchor there is nothing.
        assert_eq!(image.get_pixel(128, 140).0[3], 0);
    }

    #[tokio::test]
    async fn short_paths_are_skipped() {
        let query = parse_overlay_query(&pairs(&[("path", "5,5")])).unwrap();
        let image = render(&query, 64, 64, 1).await.unwrap();
        assert!(image.pixels().all(|p| p.0[3] == 0));
    }
}
