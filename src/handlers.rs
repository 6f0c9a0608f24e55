//! HTTP surface: the tile endpoint, the static-map endpoints (center,
//! bounds, auto-fit and the WMS-style front door), the per-style tilejson,
//! and the internal `/_int` routes that deliver the resource resolver to
//! the renderer.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::error::ServeError;
use crate::mercator::{self, Mercator};
use crate::models::{ImageFormat, OverlayQuery, ResolvedResource, RenderMode};
use crate::overlay::{self, OverlaySettings};
use crate::pipeline::{self, ImageRequest, PipelineSettings};
use crate::registry::StyleRegistry;
use crate::resolver::{format_http_date, ResourceResolver, SourceSet};

pub struct AppState {
    pub config: Config,
    pub registry: StyleRegistry,
    pub resolver: ResourceResolver,
    pub pipeline: PipelineSettings,
    pub overlay: OverlaySettings,
    pub client: reqwest::Client,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/_int/sprites/{*path}", get(int_sprites))
        .route("/_int/fonts/{fontstack}/{file}", get(int_fonts))
        .route("/_int/tiles/{id}/{source}/{z}/{x}/{yext}", get(int_tiles))
        .route("/{id_json}", get(style_tilejson))
        .route("/{id}/{z}/{x}/{yext}", get(rendered_tile))
        .route("/{id}/static", get(wms_static))
        .route("/{id}/static/", get(wms_static))
        .route("/{id}/static/{spec}/{size}", get(static_projected))
        .route("/{id}/static/raw/{spec}/{size}", get(static_raw))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

// --- Rendered tiles ---

async fn rendered_tile(
    State(state): State<Arc<AppState>>,
    Path((id, z, x, yext)): Path<(String, u32, u32, String)>,
    headers: HeaderMap,
) -> Result<Response, ServeError> {
    let binding = state
        .registry
        .get(&id)
        .ok_or_else(|| ServeError::not_found(format!("style '{id}' not found")))?;

    let (y, scale, format) = parse_y_scale_format(&yext)
        .ok_or_else(|| ServeError::bad_request(format!("invalid tile path '{yext}'")))?;
    if scale > binding.max_scale_factor {
        return Err(ServeError::not_found("scale out of range"));
    }
    if z > 22 || x >= 1u32.checked_shl(z).unwrap_or(0) || y >= 1u32.checked_shl(z).unwrap_or(0) {
        return Err(ServeError::not_found("tile out of bounds"));
    }

    if not_modified(&headers, binding.last_modified) {
        return Ok(StatusCode::NOT_MODIFIED.into_response());
    }

    let (lon, lat) = Mercator::new(256).tile_center(z, x, y);
    let req = ImageRequest {
        z: z as f64,
        lon,
        lat,
        bearing: 0.0,
        pitch: 0.0,
        width: 256,
        height: 256,
        scale,
        format,
        mode: RenderMode::Tile,
    };
    let bytes = pipeline::respond_image(&state.pipeline, &binding, &req, None, None).await?;
    Ok(image_response(bytes, format, binding.last_modified))
}

// --- Static maps ---

#[derive(Debug, Clone, PartialEq)]
enum StaticSpec {
    Center {
        x: f64,
        y: f64,
        zoom: f64,
        bearing: f64,
        pitch: f64,
    },
    Bounds([f64; 4]),
    Auto,
}

async fn static_projected(
    State(state): State<Arc<AppState>>,
    Path((id, spec, size)): Path<(String, String, String)>,
    Query(pairs): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Result<Response, ServeError> {
    serve_static(&state, &id, &spec, &size, false, pairs, &headers).await
}

async fn static_raw(
    State(state): State<Arc<AppState>>,
    Path((id, spec, size)): Path<(String, String, String)>,
    Query(pairs): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Result<Response, ServeError> {
    serve_static(&state, &id, &spec, &size, true, pairs, &headers).await
}

/// WMS-style front door: `?bbox=&width=&height=&format=image/png`, always
/// raw coordinates. Query keys are folded to lowercase here and nowhere
/// else.
async fn wms_static(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(pairs): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Result<Response, ServeError> {
    let pairs: Vec<(String, String)> = pairs
        .into_iter()
        .map(|(k, v)| (k.to_lowercase(), v))
        .collect();
    let get = |key: &str| {
        pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    };

    let bbox = get("bbox").ok_or_else(|| ServeError::bad_request("missing bbox"))?;
    let width: u32 = get("width")
        .and_then(|w| w.parse().ok())
        .ok_or_else(|| ServeError::bad_request("missing width"))?;
    let height: u32 = get("height")
        .and_then(|h| h.parse().ok())
        .ok_or_else(|| ServeError::bad_request("missing height"))?;
    let scale = get("scale").and_then(|s| s.parse().ok()).unwrap_or(1);
    let format = get("format")
        .and_then(|f| f.rsplit('/').next())
        .unwrap_or("png");
    let format = ImageFormat::from_ext(format)
        .ok_or_else(|| ServeError::bad_request("unsupported format"))?;

    let spec = parse_static_spec(bbox).filter(|s| matches!(s, StaticSpec::Bounds(_)));
    let Some(StaticSpec::Bounds(bounds)) = spec else {
        return Err(ServeError::bad_request("invalid bbox"));
    };

    render_static_response(
        &state,
        &id,
        StaticSpec::Bounds(bounds),
        width,
        height,
        scale,
        format,
        true,
        &pairs,
        &headers,
    )
    .await
}

async fn serve_static(
    state: &Arc<AppState>,
    id: &str,
    spec: &str,
    size: &str,
    raw: bool,
    pairs: Vec<(String, String)>,
    headers: &HeaderMap,
) -> Result<Response, ServeError> {
    let spec = parse_static_spec(spec)
        .ok_or_else(|| ServeError::bad_request(format!("invalid static spec '{spec}'")))?;
    let (width, height, scale, format) = parse_size_scale_format(size)
        .ok_or_else(|| ServeError::bad_request(format!("invalid size '{size}'")))?;
    render_static_response(state, id, spec, width, height, scale, format, raw, &pairs, headers)
        .await
}

#[allow(clippy::too_many_arguments)]
async fn render_static_response(
    state: &Arc<AppState>,
    id: &str,
    spec: StaticSpec,
    width: u32,
    height: u32,
    scale: u32,
    format: ImageFormat,
    raw: bool,
    pairs: &[(String, String)],
    headers: &HeaderMap,
) -> Result<Response, ServeError> {
    let binding = state
        .registry
        .get(id)
        .ok_or_else(|| ServeError::not_found(format!("style '{id}' not found")))?;
    if scale == 0 || scale > binding.max_scale_factor {
        return Err(ServeError::not_found("scale out of range"));
    }
    if not_modified(headers, binding.last_modified) {
        return Ok(StatusCode::NOT_MODIFIED.into_response());
    }

    let query = overlay::parse_overlay_query(pairs)?;
    let padding = query.padding.unwrap_or(0.1);

    // Without `raw`, coordinates arrive in the style's declared data CRS
    // and go through the binding's projection; bounds project corner-wise
    // before the zoom solver runs.
    let projection = if raw {
        None
    } else {
        binding.data_projection.as_ref()
    };

    let (lon, lat, zoom, bearing, pitch) = match spec {
        StaticSpec::Center {
            x,
            y,
            zoom,
            bearing,
            pitch,
        } => {
            let (lon, lat) = match projection {
                Some(projection) => projection.apply((x, y)),
                None => (x, y),
            };
            (lon, lat, zoom, bearing, pitch)
        }
        StaticSpec::Bounds(bbox) => {
            let bbox = match projection {
                Some(projection) => project_bbox(projection, bbox),
                None => bbox,
            };
            let zoom = mercator::calc_z_for_bbox(bbox, width, height, padding);
            let (lon, lat) = mercator::bbox_center(bbox, zoom);
            (lon, lat, zoom, 0.0, 0.0)
        }
        StaticSpec::Auto => {
            let bbox = overlay_bbox(&query)
                .ok_or_else(|| ServeError::bad_request("No coordinates provided"))?;
            let mut zoom = mercator::calc_z_for_bbox(bbox, width, height, padding);
            if let Some(maxzoom) = query.maxzoom {
                if maxzoom > 0.0 {
                    zoom = zoom.min(maxzoom);
                }
            }
            let (lon, lat) = mercator::bbox_center(bbox, zoom);
            (lon, lat, zoom, 0.0, 0.0)
        }
    };

    let overlay_image = overlay::render_overlay(
        zoom,
        (lon, lat),
        bearing,
        width,
        height,
        scale,
        &query,
        &state.overlay,
        &state.client,
    )
    .await?;

    let attribution = query
        .attribution_text
        .clone()
        .or_else(|| binding.static_attribution_text.clone());

    let req = ImageRequest {
        z: zoom,
        lon,
        lat,
        bearing,
        pitch,
        width,
        height,
        scale,
        format,
        mode: RenderMode::Static,
    };
    let bytes = pipeline::respond_image(
        &state.pipeline,
        &binding,
        &req,
        overlay_image,
        attribution.as_deref(),
    )
    .await?;
    Ok(image_response(bytes, format, binding.last_modified))
}

fn project_bbox(projection: &crate::projection::WgsToInternal, bbox: [f64; 4]) -> [f64; 4] {
    let (minx, miny) = projection.apply((bbox[0], bbox[1]));
    let (maxx, maxy) = projection.apply((bbox[2], bbox[3]));
    [minx, miny, maxx, maxy]
}

/// Union of every path vertex and marker location.
fn overlay_bbox(query: &OverlayQuery) -> Option<[f64; 4]> {
    let mut bbox: Option<[f64; 4]> = None;
    let mut extend = |(lng, lat): (f64, f64)| {
        bbox = Some(match bbox {
            None => [lng, lat, lng, lat],
            Some([minx, miny, maxx, maxy]) => [
                minx.min(lng),
                miny.min(lat),
                maxx.max(lng),
                maxy.max(lat),
            ],
        });
    };
    for path in &query.paths {
        for point in &path.points {
            extend(*point);
        }
    }
    for marker in &query.markers {
        extend(marker.location);
    }
    bbox
}

// --- TileJSON ---

async fn style_tilejson(
    State(state): State<Arc<AppState>>,
    Path(id_json): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ServeError> {
    let id = id_json
        .strip_suffix(".json")
        .ok_or_else(|| ServeError::not_found("not found"))?;
    let binding = state
        .registry
        .get(id)
        .ok_or_else(|| ServeError::not_found(format!("style '{id}' not found")))?;

    if not_modified(&headers, binding.last_modified) {
        return Ok(StatusCode::NOT_MODIFIED.into_response());
    }

    let base = binding
        .public_url
        .clone()
        .or_else(|| state.config.public_url.clone())
        .unwrap_or_else(|| {
            let host = headers
                .get(header::HOST)
                .and_then(|h| h.to_str().ok())
                .unwrap_or("localhost");
            format!("http://{host}")
        });
    let base = base.trim_end_matches('/');

    let mut tilejson = binding.tilejson.clone();
    if let Some(tiles) = tilejson.get_mut("tiles").and_then(|t| t.as_array_mut()) {
        for tile in tiles {
            if let Some(template) = tile.as_str() {
                *tile = serde_json::Value::String(template.replace("{base}", base));
            }
        }
    }

    let mut body = serde_json::to_vec(&tilejson)
        .map_err(|e| ServeError::Internal(format!("tilejson encode failed: {e}")))?;
    if let Some(decorate) = state.resolver.decorator() {
        body = decorate(&binding.id, "tilejson", body, None);
    }

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (
                header::LAST_MODIFIED,
                format_http_date(binding.last_modified),
            ),
        ],
        body,
    )
        .into_response())
}

// --- Internal resolver routes (renderer-facing) ---

async fn int_sprites(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<Response, ServeError> {
    let resource = state
        .resolver
        .fetch(&SourceSet::new(), &format!("sprites://{path}"))
        .await?;
    Ok(resource_response(resource))
}

async fn int_fonts(
    State(state): State<Arc<AppState>>,
    Path((fontstack, file)): Path<(String, String)>,
) -> Result<Response, ServeError> {
    let resource = state
        .resolver
        .fetch(&SourceSet::new(), &format!("fonts://{fontstack}/{file}"))
        .await?;
    Ok(resource_response(resource))
}

async fn int_tiles(
    State(state): State<Arc<AppState>>,
    Path((id, source, z, x, yext)): Path<(String, String, u32, u32, String)>,
) -> Result<Response, ServeError> {
    let binding = state
        .registry
        .get(&id)
        .ok_or_else(|| ServeError::not_found(format!("style '{id}' not found")))?;
    let scheme = match binding.sources.get(&source) {
        Some(archive) => match archive.kind() {
            crate::models::ArchiveKind::Pmtiles => "pmtiles",
            crate::models::ArchiveKind::Mbtiles => "mbtiles",
        },
        None => return Err(ServeError::not_found(format!("unknown source '{source}'"))),
    };
    let url = format!("{scheme}://{source}/{z}/{x}/{yext}");
    let resource = state.resolver.fetch(&binding.sources, &url).await?;
    Ok(resource_response(resource))
}

// --- Shared helpers ---

fn image_response(bytes: Vec<u8>, format: ImageFormat, last_modified: DateTime<Utc>) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (header::LAST_MODIFIED, format_http_date(last_modified)),
        ],
        bytes,
    )
        .into_response()
}

fn resource_response(resource: ResolvedResource) -> Response {
    let mut builder = Response::builder().status(StatusCode::OK);
    if let Some(content_type) = &resource.content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type.as_str());
    }
    if let Some(modified) = &resource.modified {
        builder = builder.header(header::LAST_MODIFIED, modified.as_str());
    }
    if let Some(expires) = &resource.expires {
        builder = builder.header(header::EXPIRES, expires.as_str());
    }
    if let Some(etag) = &resource.etag {
        builder = builder.header(header::ETAG, etag.as_str());
    }
    builder
        .body(resource.data.into())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// `If-Modified-Since` handling, disabled by `Cache-Control: no-cache`.
fn not_modified(headers: &HeaderMap, last_modified: DateTime<Utc>) -> bool {
    if let Some(cache_control) = headers
        .get(header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
    {
        if cache_control.contains("no-cache") {
            return false;
        }
    }
    let Some(since) = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
    else {
        return false;
    };
    last_modified.timestamp() <= since.timestamp()
}

/// `<y>[@Nx].<format>` from the tile route's final segment.
fn parse_y_scale_format(segment: &str) -> Option<(u32, u32, ImageFormat)> {
    let (rest, ext) = segment.rsplit_once('.')?;
    let format = ImageFormat::from_ext(ext)?;
    let (y_str, scale) = match rest.split_once('@') {
        Some((y, suffix)) => (y, parse_scale_suffix(suffix)?),
        None => (rest, 1),
    };
    let y = y_str.parse().ok()?;
    Some((y, scale, format))
}

/// `<W>x<H>[@Nx].<format>` from a static route's size segment.
fn parse_size_scale_format(segment: &str) -> Option<(u32, u32, u32, ImageFormat)> {
    let (rest, ext) = segment.rsplit_once('.')?;
    let format = ImageFormat::from_ext(ext)?;
    let (size, scale) = match rest.split_once('@') {
        Some((size, suffix)) => (size, parse_scale_suffix(suffix)?),
        None => (rest, 1),
    };
    let (w, h) = size.split_once('x')?;
    Some((w.parse().ok()?, h.parse().ok()?, scale, format))
}

/// `@Nx` with a single digit N of 2..=9.
fn parse_scale_suffix(suffix: &str) -> Option<u32> {
    let digit = suffix.strip_suffix('x')?;
    if digit.len() != 1 {
        return None;
    }
    let n: u32 = digit.parse().ok()?;
    (2..=9).contains(&n).then_some(n)
}

/// `x,y,z[@bearing[,pitch]]` or `minx,miny,maxx,maxy` or `auto`.
fn parse_static_spec(spec: &str) -> Option<StaticSpec> {
    if spec == "auto" {
        return Some(StaticSpec::Auto);
    }
    let (coords, bearing_pitch) = match spec.split_once('@') {
        Some((coords, bp)) => (coords, Some(bp)),
        None => (spec, None),
    };
    let numbers: Vec<f64> = coords
        .split(',')
        .map(|n| n.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .ok()?;
    match numbers.len() {
        3 => {
            let (bearing, pitch) = match bearing_pitch {
                Some(bp) => match bp.split_once(',') {
                    Some((b, p)) => (b.parse().ok()?, p.parse().ok()?),
                    None => (bp.parse().ok()?, 0.0),
                },
                None => (0.0, 0.0),
            };
            Some(StaticSpec::Center {
                x: numbers[0],
                y: numbers[1],
                zoom: numbers[2],
                bearing,
                pitch,
            })
        }
        4 if bearing_pitch.is_none() => {
            Some(StaticSpec::Bounds([numbers[0], numbers[1], numbers[2], numbers[3]]))
        }
        _ => None,
    }
}
