use serde::{Deserialize, Serialize};

/// RGBA color used by overlay styling. Stored straight (not premultiplied).
pub type Rgba = [u8; 4];

/// Default path stroke when neither the query nor the path sets a color.
pub const DEFAULT_STROKE: Rgba = [0, 64, 255, 179];

/// Parameterization handed to the render backend. `zoom` is the renderer's
/// own zoom (512px tiles), already decremented from the request zoom.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderJob {
    pub zoom: f64,
    pub center: (f64, f64),
    pub bearing: f64,
    pub pitch: f64,
    pub width: u32,
    pub height: u32,
}

/// Raw renderer output: premultiplied RGBA, row-major.
#[derive(Debug, Clone)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderMode {
    Tile,
    Static,
}

/// Output encodings accepted on the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Webp,
}

impl ImageFormat {
    /// Parse a URL extension; `jpg` folds into jpeg.
    pub fn from_ext(ext: &str) -> Option<Self> {
        match ext {
            "png" => Some(ImageFormat::Png),
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            "webp" => Some(ImageFormat::Webp),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Webp => "image/webp",
        }
    }

    pub fn ext(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Webp => "webp",
        }
    }
}

/// One `path=` query value: ordered (lng, lat) vertices plus per-path style
/// overrides. A path renders only with two or more vertices; equal first
/// and last coordinates close it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PathSpec {
    pub points: Vec<(f64, f64)>,
    pub fill: Option<Rgba>,
    pub stroke: Option<Rgba>,
    pub width: Option<f64>,
}

impl PathSpec {
    pub fn is_closed(&self) -> bool {
        self.points.len() >= 2 && self.points.first() == self.points.last()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MarkerIcon {
    /// The built-in parameterized pin.
    Default,
    /// Inline `data:` URL, gated by `allow_inline_marker_images`.
    DataUrl(String),
    /// Remote `http(s)` URL, gated by `allow_remote_marker_icons`.
    Remote(String),
    /// Sanitized path under the icons directory.
    Local(String),
}

/// One `marker=` query value. Markers are anchored center-bottom at their
/// location.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerSpec {
    pub location: (f64, f64),
    pub icon: MarkerIcon,
    pub scale: f64,
    pub offset_x: f64,
    pub offset_y: f64,
    pub color: Option<Rgba>,
}

/// Line cap / join keywords accepted from the query string, mapped onto the
/// rasterizer's stroke settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineCap {
    #[default]
    Butt,
    Round,
    Square,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineJoin {
    #[default]
    Miter,
    Round,
    Bevel,
}

/// Parsed overlay portion of the query string for overlay-capable
/// endpoints.
#[derive(Debug, Clone, Default)]
pub struct OverlayQuery {
    pub paths: Vec<PathSpec>,
    pub markers: Vec<MarkerSpec>,
    pub fill: Option<Rgba>,
    pub stroke: Option<Rgba>,
    pub width: Option<f64>,
    pub border: Option<Rgba>,
    pub border_width: Option<f64>,
    pub line_cap: LineCap,
    pub line_join: LineJoin,
    pub padding: Option<f64>,
    pub latlng: bool,
    pub maxzoom: Option<f64>,
    pub attribution_text: Option<String>,
}

impl OverlayQuery {
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.markers.is_empty()
    }
}

/// Parse a color token from query strings or archive metadata: `#rgb`,
/// `#rrggbb`, `#rrggbbaa`, `rgb(r,g,b)`, `rgba(r,g,b,a)` and a handful of
/// CSS keywords.
pub fn parse_color(input: &str) -> Option<Rgba> {
    let input = input.trim();
    if let Some(hex) = input.strip_prefix('#') {
        return match hex.len() {
            3 => {
                let r = u8::from_str_radix(&hex[0..1], 16).ok()?;
                let g = u8::from_str_radix(&hex[1..2], 16).ok()?;
                let b = u8::from_str_radix(&hex[2..3], 16).ok()?;
                Some([r * 17, g * 17, b * 17, 255])
            }
            6 | 8 => {
                let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
                let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
                let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
                let a = if hex.len() == 8 {
                    u8::from_str_radix(&hex[6..8], 16).ok()?
                } else {
                    255
                };
                Some([r, g, b, a])
            }
            _ => None,
        };
    }

    if let Some(body) = input
        .strip_prefix("rgba(")
        .or_else(|| input.strip_prefix("rgb("))
    {
        let body = body.strip_suffix(')')?;
        let parts: Vec<&str> = body.split(',').map(str::trim).collect();
        if parts.len() < 3 {
            return None;
        }
        let r: u8 = parts[0].parse().ok()?;
        let g: u8 = parts[1].parse().ok()?;
        let b: u8 = parts[2].parse().ok()?;
        let a = if parts.len() == 4 {
            (parts[3].parse::<f64>().ok()?.clamp(0.0, 1.0) * 255.0).round() as u8
        } else {
            255
        };
        return Some([r, g, b, a]);
    }

    match input.to_ascii_lowercase().as_str() {
        "black" => Some([0, 0, 0, 255]),
        "white" => Some([255, 255, 255, 255]),
        "red" => Some([255, 0, 0, 255]),
        "green" => Some([0, 128, 0, 255]),
        "blue" => Some([0, 0, 255, 255]),
        "yellow" => Some([255, 255, 0, 255]),
        "orange" => Some([255, 165, 0, 255]),
        "transparent" => Some([0, 0, 0, 0]),
        _ => None,
    }
}

/// Resource returned by the resolver to the renderer.
#[derive(Debug, Clone, Default)]
pub struct ResolvedResource {
    pub data: Vec<u8>,
    pub content_type: Option<String>,
    pub modified: Option<String>,
    pub expires: Option<String>,
    pub etag: Option<String>,
}

/// Archive descriptor produced by the data resolver from a source name.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DataDescriptor {
    pub inputfile: String,
    pub filetype: ArchiveKind,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveKind {
    Pmtiles,
    Mbtiles,
}
