//! Spherical web-mercator math shared by the pipeline and the overlay
//! rasterizer: lng/lat to pixel projection, the fixed-reference-zoom
//! "precise pixel" variant used for overlay geometry, and the zoom solver
//! for bounding-box requests.

use std::f64::consts::PI;

/// Latitude bound of the square web-mercator world.
pub const MAX_MERCATOR_LAT: f64 = 85.05112877980659;

/// Reference zoom for sub-pixel-accurate overlay projection.
const PRECISE_REF_ZOOM: f64 = 20.0;

/// Pixel projection on a `tile_size`-based tile grid. Zoom `z` maps the
/// world to `tile_size * 2^z` pixels on each axis.
#[derive(Debug, Clone, Copy)]
pub struct Mercator {
    tile_size: f64,
}

impl Mercator {
    pub const fn new(tile_size: u32) -> Self {
        Self {
            tile_size: tile_size as f64,
        }
    }

    pub fn world_size(&self, zoom: f64) -> f64 {
        self.tile_size * 2f64.powf(zoom)
    }

    /// Forward projection: (lng, lat) in degrees to pixel coordinates at
    /// `zoom`. Latitude is clamped to the mercator world.
    pub fn px(&self, lnglat: (f64, f64), zoom: f64) -> (f64, f64) {
        let size = self.world_size(zoom);
        let lat = lnglat.1.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
        let x = (lnglat.0 + 180.0) / 360.0 * size;
        let sin_lat = lat.to_radians().sin();
        let y = (0.5 - ((1.0 + sin_lat) / (1.0 - sin_lat)).ln() / (4.0 * PI)) * size;
        (x, y)
    }

    /// Inverse projection: pixel coordinates at `zoom` back to (lng, lat).
    pub fn ll(&self, px: (f64, f64), zoom: f64) -> (f64, f64) {
        let size = self.world_size(zoom);
        let lng = px.0 / size * 360.0 - 180.0;
        let lat = (PI * (1.0 - 2.0 * px.1 / size)).sinh().atan().to_degrees();
        (lng, lat)
    }

    /// Projection at a fixed reference zoom scaled to the target zoom.
    /// Keeps overlay vertices sub-pixel accurate at high zooms where a
    /// direct projection at `zoom` loses precision.
    pub fn precise_px(&self, lnglat: (f64, f64), zoom: f64) -> (f64, f64) {
        let (x, y) = self.px(lnglat, PRECISE_REF_ZOOM);
        let scale = 2f64.powf(zoom - PRECISE_REF_ZOOM);
        (x * scale, y * scale)
    }

    /// Center of a tile in (lng, lat).
    pub fn tile_center(&self, z: u32, x: u32, y: u32) -> (f64, f64) {
        self.ll(
            (
                (x as f64 + 0.5) * self.tile_size,
                (y as f64 + 0.5) * self.tile_size,
            ),
            z as f64,
        )
    }
}

/// Solve the zoom level that fits `bbox` (minx, miny, maxx, maxy in
/// degrees) into a `width` x `height` window with fractional `padding` on
/// each side. Clamped so a single 256px tile never underflows the window.
pub fn calc_z_for_bbox(bbox: [f64; 4], width: u32, height: u32, padding: f64) -> f64 {
    let merc = Mercator::new(256);
    let mut z = 25.0;

    let min = merc.px((bbox[0], bbox[3]), z);
    let max = merc.px((bbox[2], bbox[1]), z);

    let w = width as f64 / (1.0 + 2.0 * padding);
    let h = height as f64 / (1.0 + 2.0 * padding);

    z -= (((max.0 - min.0) / w).ln())
        .max(((max.1 - min.1) / h).ln())
        / std::f64::consts::LN_2;

    z = ((width.max(height) as f64 / 256.0).ln() / std::f64::consts::LN_2).max(z.min(25.0));

    z
}

/// Center of `bbox` computed through the forward-then-inverse projection,
/// which keeps antimeridian-straddling boxes consistent with the solver.
pub fn bbox_center(bbox: [f64; 4], zoom: f64) -> (f64, f64) {
    let merc = Mercator::new(256);
    let min = merc.px((bbox[0], bbox[3]), zoom);
    let max = merc.px((bbox[2], bbox[1]), zoom);
    merc.ll(((min.0 + max.0) / 2.0, (min.1 + max.1) / 2.0), zoom)
}
