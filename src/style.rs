//! Style loading. At registration the style document is read, its archive
//! sources are resolved and opened, archive metadata is merged back into
//! the source objects, and every resource URI the renderer will fetch is
//! rewritten to the server's own resolver routes.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::info;

use crate::archives::{DataResolver, TileSource};
use crate::error::ServeError;
use crate::projection::{DataProjection, WgsToInternal};

pub const SCHEME_PMTILES: &str = "pmtiles://";
pub const SCHEME_MBTILES: &str = "mbtiles://";

/// A style document after source binding and URI rewriting.
pub struct LoadedStyle {
    /// Renderer-facing document (loopback resource URLs).
    pub style_json: Value,
    /// Opened archives keyed by source name.
    pub sources: HashMap<String, Arc<TileSource>>,
    /// WGS84 → internal transform from the first source with a `proj4`
    /// definition.
    pub data_projection: Option<WgsToInternal>,
    /// TileJSON published at the style's info endpoint. The `tiles` entry
    /// holds a `{base}` placeholder expanded per request.
    pub tilejson: Value,
    /// Font stacks referenced by the style's layers.
    pub fonts: HashSet<String>,
}

pub async fn load_style(
    id: &str,
    style_path: &Path,
    resolver: &DataResolver,
    client: &reqwest::Client,
    local_base: &str,
    tilejson_override: Option<&Value>,
) -> Result<LoadedStyle, ServeError> {
    let raw = std::fs::read_to_string(style_path).map_err(|e| {
        ServeError::FatalConfig(format!("cannot read style '{}': {e}", style_path.display()))
    })?;
    let mut style: Value = serde_json::from_str(&raw).map_err(|e| {
        ServeError::FatalConfig(format!("style '{}' is not valid JSON: {e}", style_path.display()))
    })?;

    let mut sources = HashMap::new();
    let mut data_projection: Option<WgsToInternal> = None;
    let mut attributions: Vec<String> = Vec::new();

    if let Some(source_map) = style.get_mut("sources").and_then(|s| s.as_object_mut()) {
        for (name, source) in source_map.iter_mut() {
            let Some(url) = source.get("url").and_then(|u| u.as_str()) else {
                continue;
            };
            let scheme = if url.starts_with(SCHEME_PMTILES) {
                SCHEME_PMTILES
            } else if url.starts_with(SCHEME_MBTILES) {
                SCHEME_MBTILES
            } else {
                continue;
            };

            let data_id = unwrap_name(&url[scheme.len()..]).to_string();
            let descriptor = resolver.resolve(&data_id)?;
            let opened = TileSource::open(&descriptor, client).await?;
            let info = opened.info().clone();

            let obj = source.as_object_mut().ok_or_else(|| {
                ServeError::FatalConfig(format!("source '{name}' is not an object"))
            })?;
            obj.remove("url");

            if let Some(bounds) = info.bounds {
                obj.insert("bounds".into(), json!(bounds));
            }
            if let Some(center) = info.center {
                obj.insert("center".into(), json!(center));
            }
            if let Some(minzoom) = info.minzoom {
                obj.insert("minzoom".into(), json!(minzoom));
            }
            if let Some(maxzoom) = info.maxzoom {
                obj.insert("maxzoom".into(), json!(maxzoom));
            }
            if let Some(extra) = &info.json {
                if let Some(extra) = extra.as_object() {
                    for (k, v) in extra {
                        obj.entry(k.clone()).or_insert_with(|| v.clone());
                    }
                }
            }

            let ext = info.format.clone().unwrap_or_else(|| "pbf".to_string());
            obj.insert(
                "tiles".into(),
                json!([format!(
                    "{local_base}/_int/tiles/{id}/{name}/{{z}}/{{x}}/{{y}}.{ext}"
                )]),
            );

            if let Some(attribution) = &info.attribution {
                if !attribution.is_empty() && !attributions.contains(attribution) {
                    attributions.push(attribution.clone());
                }
            }

            if let Some(proj4) = &info.proj4 {
                let parsed = WgsToInternal::new(DataProjection::parse(proj4)?);
                match &data_projection {
                    None => data_projection = Some(parsed),
                    Some(existing) if existing.definition() == proj4 => {}
                    Some(existing) => {
                        return Err(ServeError::FatalConfig(format!(
                            "style '{id}' declares conflicting projections '{}' and '{proj4}'",
                            existing.definition()
                        )))
                    }
                }
            }

            info!("style {} bound source {} ({})", id, name, data_id);
            sources.insert(name.clone(), Arc::new(opened));
        }
    }

    rewrite_sprite(&mut style, id, style_path, local_base);
    rewrite_glyphs(&mut style, local_base);
    flatten_extrusions(&mut style);

    let tilejson = build_tilejson(id, &style, &attributions, tilejson_override);
    let fonts = collect_fonts(&style);

    Ok(LoadedStyle {
        style_json: style,
        sources,
        data_projection,
        tilejson,
        fonts,
    })
}

/// Every font named in a layer's `text-font` layout property.
fn collect_fonts(style: &Value) -> HashSet<String> {
    let mut fonts = HashSet::new();
    let Some(layers) = style.get("layers").and_then(|l| l.as_array()) else {
        return fonts;
    };
    for layer in layers {
        let Some(entries) = layer
            .get("layout")
            .and_then(|l| l.get("text-font"))
            .and_then(|f| f.as_array())
        else {
            continue;
        };
        for entry in entries {
            if let Some(font) = entry.as_str() {
                fonts.insert(font.to_string());
            }
        }
    }
    fonts
}

/// `pmtiles://{osm}` and `pmtiles://osm` both name the data entry `osm`.
fn unwrap_name(rest: &str) -> &str {
    rest.strip_prefix('{')
        .and_then(|r| r.strip_suffix('}'))
        .unwrap_or(rest)
}

fn rewrite_sprite(style: &mut Value, id: &str, style_path: &Path, local_base: &str) {
    let folder = style_path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_string();

    let rewrite_one = |sprite: &str| -> Option<String> {
        if sprite.starts_with("http://") || sprite.starts_with("https://") {
            return None;
        }
        let expanded = sprite
            .replace("{style}", id)
            .replace("{styleJsonFolder}", &folder);
        Some(format!("{local_base}/_int/sprites/{}", expanded.trim_start_matches('/')))
    };

    match style.get_mut("sprite") {
        Some(Value::String(s)) => {
            if let Some(rewritten) = rewrite_one(s) {
                *s = rewritten;
            }
        }
        Some(Value::Array(entries)) => {
            for entry in entries {
                if let Some(Value::String(s)) = entry.get_mut("url") {
                    if let Some(rewritten) = rewrite_one(s) {
                        *s = rewritten;
                    }
                }
            }
        }
        _ => {}
    }
}

fn rewrite_glyphs(style: &mut Value, local_base: &str) {
    if let Some(Value::String(glyphs)) = style.get_mut("glyphs") {
        if !glyphs.starts_with("http://") && !glyphs.starts_with("https://") {
            *glyphs = format!("{local_base}/_int/fonts/{{fontstack}}/{{range}}.pbf");
        }
    }
}

/// Zero out 3D building extrusions; a raster snapshot has no camera to
/// justify them and they hide labels underneath.
fn flatten_extrusions(style: &mut Value) {
    let Some(layers) = style.get_mut("layers").and_then(|l| l.as_array_mut()) else {
        return;
    };
    for layer in layers {
        let Some(paint) = layer.get_mut("paint").and_then(|p| p.as_object_mut()) else {
            continue;
        };
        for key in ["fill-extrusion-height", "fill-extrusion-base"] {
            if paint.contains_key(key) {
                paint.insert(key.into(), json!(0));
            }
        }
    }
}

fn build_tilejson(
    id: &str,
    style: &Value,
    attributions: &[String],
    overrides: Option<&Value>,
) -> Value {
    let name = style
        .get("name")
        .and_then(|n| n.as_str())
        .unwrap_or(id)
        .to_string();

    let mut tilejson = json!({
        "tilejson": "2.0.0",
        "id": id,
        "name": name,
        "format": "png",
        "tiles": [format!("{{base}}/{id}/{{z}}/{{x}}/{{y}}.png")],
        "minzoom": 0,
        "maxzoom": 22,
    });

    if !attributions.is_empty() {
        tilejson["attribution"] = json!(attributions.join(" | "));
    }
    if let Some(center) = style.get("center").and_then(|c| c.as_array()) {
        if center.len() == 2 {
            let zoom = style.get("zoom").and_then(|z| z.as_f64()).unwrap_or(0.0);
            tilejson["center"] = json!([center[0], center[1], zoom as i64]);
        }
    }

    if let Some(overrides) = overrides.and_then(|o| o.as_object()) {
        for (k, v) in overrides {
            tilejson[k] = v.clone();
        }
    }
    tilejson
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use sqlx::sqlite::SqliteConnectOptions;
    use sqlx::SqlitePool;

    async fn write_fixture_mbtiles(path: &Path, metadata: &[(&str, &str)]) {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(opts).await.unwrap();
        sqlx::query("CREATE TABLE metadata (name TEXT, value TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE tiles (zoom_level INTEGER, tile_column INTEGER, tile_row INTEGER, tile_data BLOB)")
            .execute(&pool)
            .await
            .unwrap();
        for (name, value) in metadata {
            sqlx::query("INSERT INTO metadata (name, value) VALUES (?, ?)")
                .bind(name)
                .bind(value)
                .execute(&pool)
                .await
                .unwrap();
        }
        pool.close().await;
    }

    async fn load_fixture(style_json: Value, metadata: &[(&str, &str)]) -> Result<LoadedStyle, ServeError> {
        let dir = tempfile::tempdir().unwrap();
        write_fixture_mbtiles(&dir.path().join("osm.mbtiles"), metadata).await;
        let style_path = dir.path().join("basic").join("style.json");
        std::fs::create_dir_all(style_path.parent().unwrap()).unwrap();
        std::fs::write(&style_path, serde_json::to_string(&style_json).unwrap()).unwrap();

        let config = Config::from_toml(&format!(
            "[paths]\narchives = \"{}\"\n[data.osm]\nmbtiles = \"osm.mbtiles\"\n",
            dir.path().display()
        ))
        .unwrap();
        let resolver = DataResolver::from_config(&config).unwrap();
        load_style(
            "basic",
            &style_path,
            &resolver,
            &reqwest::Client::new(),
            "http://127.0.0.1:3001",
            None,
        )
        .await
    }

    fn style_with_source(url: &str) -> Value {
        json!({
            "version": 8,
            "name": "Basic",
            "sprite": "sprites/{style}",
            "glyphs": "fonts/{fontstack}/{range}.pbf",
            "sources": {
                "openmaptiles": { "type": "vector", "url": url }
            },
            "layers": [
                {
                    "id": "buildings-3d",
                    "type": "fill-extrusion",
                    "source": "openmaptiles",
                    "paint": { "fill-extrusion-height": ["get", "render_height"], "fill-extrusion-base": 5 }
                },
                {
                    "id": "place-labels",
                    "type": "symbol",
                    "source": "openmaptiles",
                    "layout": { "text-font": ["Open Sans Regular", "Noto Sans Regular"] }
                }
            ]
        })
    }

    #[tokio::test]
    async fn binds_sources_and_rewrites_uris() {
        let loaded = load_fixture(
            style_with_source("mbtiles://{osm}"),
            &[
                ("format", "pbf"),
                ("maxzoom", "14"),
                ("attribution", "© OpenStreetMap"),
            ],
        )
        .await
        .unwrap();

        let source = &loaded.style_json["sources"]["openmaptiles"];
        assert!(source.get("url").is_none());
        assert_eq!(source["type"], "vector");
        assert_eq!(source["maxzoom"], 14);
        assert_eq!(
            source["tiles"][0],
            "http://127.0.0.1:3001/_int/tiles/basic/openmaptiles/{z}/{x}/{y}.pbf"
        );

        assert_eq!(
            loaded.style_json["sprite"],
            "http://127.0.0.1:3001/_int/sprites/sprites/basic"
        );
        assert_eq!(
            loaded.style_json["glyphs"],
            "http://127.0.0.1:3001/_int/fonts/{fontstack}/{range}.pbf"
        );

        assert_eq!(loaded.tilejson["attribution"], "© OpenStreetMap");
        assert_eq!(
            loaded.tilejson["tiles"][0],
            "{base}/basic/{z}/{x}/{y}.png"
        );
        assert!(loaded.sources.contains_key("openmaptiles"));
        assert!(loaded.data_projection.is_none());
    }

    #[tokio::test]
    async fn flattens_extrusions() {
        let loaded = load_fixture(style_with_source("mbtiles://osm"), &[("format", "pbf")])
            .await
            .unwrap();
        let paint = &loaded.style_json["layers"][0]["paint"];
        assert_eq!(paint["fill-extrusion-height"], 0);
        assert_eq!(paint["fill-extrusion-base"], 0);
    }

    #[tokio::test]
    async fn first_proj4_sets_data_projection() {
        let loaded = load_fixture(
            style_with_source("mbtiles://osm"),
            &[
                ("format", "pbf"),
                ("proj4", "+proj=merc +a=6378137"),
            ],
        )
        .await
        .unwrap();
        let projection = loaded.data_projection.expect("projection bound");
        let (lng, lat) = projection.apply((10.0, 50.0));
        assert!((lng - 10.0).abs() < 1e-6);
        assert!((lat - 50.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn unknown_data_source_is_fatal() {
        let result = load_fixture(style_with_source("mbtiles://missing"), &[("format", "pbf")]).await;
        assert!(matches!(result, Err(ServeError::FatalConfig(_))));
    }

    #[tokio::test]
    async fn collects_referenced_fonts() {
        let loaded = load_fixture(style_with_source("mbtiles://osm"), &[("format", "pbf")])
            .await
            .unwrap();
        assert!(loaded.fonts.contains("Open Sans Regular"));
        assert!(loaded.fonts.contains("Noto Sans Regular"));
        assert_eq!(loaded.fonts.len(), 2);
    }

    #[test]
    fn name_unwrapping() {
        assert_eq!(unwrap_name("{osm}"), "osm");
        assert_eq!(unwrap_name("osm"), "osm");
    }
}
