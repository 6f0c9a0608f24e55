//! Data projections for styles whose archives are not stored in plain
//! web-mercator. The registration path parses the source's `proj4`
//! definition once and composes it with the EPSG:3857 inverse, yielding the
//! WGS84-to-internal transform applied to static-map centers and bounds.

use std::collections::HashMap;
use std::f64::consts::PI;

use crate::error::ServeError;

const EARTH_RADIUS: f64 = 6378137.0;

/// A parsed `+proj=` definition, limited to the families that show up in
/// packaged tile archives.
#[derive(Debug, Clone)]
enum ProjKind {
    /// Geographic coordinates, no-op forward.
    LongLat,
    Mercator {
        a: f64,
        k: f64,
        lon0: f64,
        x0: f64,
        y0: f64,
    },
    /// Lambert conformal conic on a sphere.
    Lcc {
        a: f64,
        lon0: f64,
        x0: f64,
        y0: f64,
        n: f64,
        f: f64,
        rho0: f64,
    },
}

#[derive(Debug, Clone)]
pub struct DataProjection {
    kind: ProjKind,
    source: String,
}

impl DataProjection {
    /// Parse a proj4 parameter string, e.g.
    /// `+proj=lcc +lat_1=49 +lat_2=77 +lat_0=49 +lon_0=-95 +x_0=0 +y_0=0`.
    pub fn parse(proj4: &str) -> Result<Self, ServeError> {
        let mut params: HashMap<&str, Option<&str>> = HashMap::new();
        for token in proj4.split_whitespace() {
            let token = token.trim_start_matches('+');
            match token.split_once('=') {
                Some((k, v)) => params.insert(k, Some(v)),
                None => params.insert(token, None),
            };
        }

        let num = |key: &str, default: f64| -> f64 {
            params
                .get(key)
                .and_then(|v| *v)
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };

        let kind = match params.get("proj").and_then(|v| *v) {
            Some("longlat") | Some("latlong") => ProjKind::LongLat,
            Some("merc") => ProjKind::Mercator {
                a: num("a", EARTH_RADIUS),
                k: num("k_0", num("k", 1.0)),
                lon0: num("lon_0", 0.0).to_radians(),
                x0: num("x_0", 0.0),
                y0: num("y_0", 0.0),
            },
            Some("lcc") => {
                let a = num("a", EARTH_RADIUS);
                let lat1 = num("lat_1", 0.0).to_radians();
                let lat2 = num("lat_2", num("lat_1", 0.0)).to_radians();
                let lat0 = num("lat_0", 0.0).to_radians();

                let n = if (lat1 - lat2).abs() < 1e-10 {
                    lat1.sin()
                } else {
                    (lat1.cos() / lat2.cos()).ln()
                        / ((PI / 4.0 + lat2 / 2.0).tan() / (PI / 4.0 + lat1 / 2.0).tan()).ln()
                };
                let f = lat1.cos() * (PI / 4.0 + lat1 / 2.0).tan().powf(n) / n;
                let rho0 = a * f / (PI / 4.0 + lat0 / 2.0).tan().powf(n);

                ProjKind::Lcc {
                    a,
                    lon0: num("lon_0", 0.0).to_radians(),
                    x0: num("x_0", 0.0),
                    y0: num("y_0", 0.0),
                    n,
                    f,
                    rho0,
                }
            }
            other => {
                return Err(ServeError::FatalConfig(format!(
                    "unsupported projection {:?} in proj4 definition '{}'",
                    other, proj4
                )))
            }
        };

        Ok(Self {
            kind,
            source: proj4.to_string(),
        })
    }

    /// The proj4 string this projection was built from.
    pub fn definition(&self) -> &str {
        &self.source
    }

    /// Forward transform from WGS84 degrees to projected coordinates.
    pub fn forward(&self, lnglat: (f64, f64)) -> (f64, f64) {
        let (lng, lat) = lnglat;
        match &self.kind {
            ProjKind::LongLat => (lng, lat),
            ProjKind::Mercator { a, k, lon0, x0, y0 } => {
                let lam = lng.to_radians() - lon0;
                let phi = lat.to_radians();
                (
                    a * k * lam + x0,
                    a * k * (PI / 4.0 + phi / 2.0).tan().ln() + y0,
                )
            }
            ProjKind::Lcc {
                a,
                lon0,
                x0,
                y0,
                n,
                f,
                rho0,
            } => {
                let phi = lat.to_radians();
                let theta = n * (lng.to_radians() - lon0);
                let rho = a * f / (PI / 4.0 + phi / 2.0).tan().powf(*n);
                (rho * theta.sin() + x0, rho0 - rho * theta.cos() + y0)
            }
        }
    }
}

/// WGS84 → style-internal transform: the source projection forward,
/// re-interpreted through the EPSG:3857 inverse so the renderer (which
/// assumes web-mercator) draws the archive where the user expects it.
#[derive(Debug, Clone)]
pub struct WgsToInternal {
    proj: DataProjection,
}

impl WgsToInternal {
    pub fn new(proj: DataProjection) -> Self {
        Self { proj }
    }

    pub fn definition(&self) -> &str {
        self.proj.definition()
    }

    pub fn apply(&self, lnglat: (f64, f64)) -> (f64, f64) {
        let (x, y) = self.proj.forward(lnglat);
        epsg3857_inverse(x, y)
    }
}

/// EPSG:3857 inverse: meters to WGS84 degrees.
fn epsg3857_inverse(x: f64, y: f64) -> (f64, f64) {
    let lng = (x / EARTH_RADIUS).to_degrees();
    let lat = (2.0 * (y / EARTH_RADIUS).exp().atan() - PI / 2.0).to_degrees();
    (lng, lat)
}
