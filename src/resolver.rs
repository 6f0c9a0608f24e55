//! The resolver satisfies every resource fetch the renderer issues during
//! a render: sprites and glyph ranges from disk, tiles from the bound
//! archives, and remote HTTP resources. Upstream failures never fail a
//! render; they degrade to a synthesized empty response so missing tiles
//! show up as blank map, not a 500.

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, Rgba, RgbaImage};
use tracing::warn;

use crate::archives::TileSource;
use crate::error::ServeError;
use crate::fonts::GlyphStore;
use crate::models::{parse_color, ResolvedResource};

/// Upper bound on cached synthesized responses; one entry per
/// (format, fill color) pair actually seen.
const EMPTY_CACHE_CAP: usize = 256;

/// Optional pass-through filter on vector tile data and tilejson.
pub type DataDecorator =
    Arc<dyn Fn(&str, &str, Vec<u8>, Option<(u8, u32, u32)>) -> Vec<u8> + Send + Sync>;

pub type SourceSet = HashMap<String, Arc<TileSource>>;

pub struct ResourceResolver {
    sprites_dir: PathBuf,
    glyphs: Arc<GlyphStore>,
    /// `None` serves every discovered font stack.
    allowed_fonts: Option<HashSet<String>>,
    client: reqwest::Client,
    empty_cache: Mutex<HashMap<(String, String), Vec<u8>>>,
    decorator: Option<DataDecorator>,
}

impl ResourceResolver {
    pub fn new(
        sprites_dir: PathBuf,
        glyphs: Arc<GlyphStore>,
        allowed_fonts: Option<HashSet<String>>,
        client: reqwest::Client,
        decorator: Option<DataDecorator>,
    ) -> Self {
        Self {
            sprites_dir,
            glyphs,
            allowed_fonts,
            client,
            empty_cache: Mutex::new(HashMap::new()),
            decorator,
        }
    }

    pub fn decorator(&self) -> Option<&DataDecorator> {
        self.decorator.as_ref()
    }

    /// Resolve one renderer resource URL. `sources` is the requesting
    /// style's bound archive set; it only matters for archive schemes.
    pub async fn fetch(
        &self,
        sources: &SourceSet,
        url: &str,
    ) -> Result<ResolvedResource, ServeError> {
        if let Some(rest) = url.strip_prefix("sprites://") {
            return self.fetch_sprite(rest).await;
        }
        if let Some(rest) = url.strip_prefix("fonts://") {
            return self.fetch_glyphs(rest).await;
        }
        if let Some(rest) = url.strip_prefix("pmtiles://") {
            return Ok(self.fetch_archive_tile(sources, rest, "pmtiles").await);
        }
        if let Some(rest) = url.strip_prefix("mbtiles://") {
            return Ok(self.fetch_archive_tile(sources, rest, "mbtiles").await);
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            return Ok(self.fetch_http(url).await);
        }
        Err(ServeError::bad_request(format!("unsupported resource scheme: {url}")))
    }

    async fn fetch_sprite(&self, rest: &str) -> Result<ResolvedResource, ServeError> {
        let rel = percent_decode(rest.trim_start_matches('/'));
        if rel.contains("..") {
            return Err(ServeError::bad_request("invalid sprite path"));
        }
        let path = self.sprites_dir.join(&rel);
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| ServeError::not_found(format!("sprite '{rel}': {e}")))?;
        let content_type = if rel.ends_with(".json") {
            "application/json"
        } else {
            "image/png"
        };
        Ok(ResolvedResource {
            data,
            content_type: Some(content_type.to_string()),
            ..Default::default()
        })
    }

    async fn fetch_glyphs(&self, rest: &str) -> Result<ResolvedResource, ServeError> {
        // fonts://<fontstack>/<range>.pbf
        let rest = rest.trim_start_matches('/');
        let (stack, file) = rest
            .rsplit_once('/')
            .ok_or_else(|| ServeError::bad_request("invalid glyph path"))?;
        let range = file
            .strip_suffix(".pbf")
            .ok_or_else(|| ServeError::bad_request("invalid glyph range file"))?;
        let stack = percent_decode(stack);
        let data = self
            .glyphs
            .assemble(&stack, range, self.allowed_fonts.as_ref())
            .await?;
        Ok(ResolvedResource {
            data,
            content_type: Some("application/x-protobuf".to_string()),
            ..Default::default()
        })
    }

    /// Archive dispatch. All failure modes collapse into a synthesized
    /// empty response typed after the source's declared format.
    async fn fetch_archive_tile(
        &self,
        sources: &SourceSet,
        rest: &str,
        scheme: &str,
    ) -> ResolvedResource {
        let parsed = parse_tile_path(rest);
        let (name, z, x, y, ext) = match parsed {
            Some(parts) => parts,
            None => {
                warn!("malformed {} tile url: {}", scheme, rest);
                return self.empty_response("pbf", None);
            }
        };

        let Some(source) = sources.get(name) else {
            warn!("unknown {} source '{}'", scheme, name);
            return self.empty_response(ext, None);
        };
        let fill = source.info().fill_color.clone();

        match source.get_tile(z, x, y).await {
            Ok(tile) => {
                let mut data = tile.data;
                if ext == "pbf" && tile.gzipped {
                    match gunzip(&data) {
                        Ok(plain) => data = plain,
                        Err(e) => {
                            warn!("tile {}/{}/{} inflate failed: {}", z, x, y, e);
                            return self.empty_response(ext, fill.as_deref());
                        }
                    }
                }
                if ext == "pbf" {
                    if let Some(decorate) = &self.decorator {
                        data = decorate(name, "data", data, Some((z, x, y)));
                    }
                }
                ResolvedResource {
                    data,
                    content_type: Some(content_type_for(ext).to_string()),
                    modified: source.last_modified().map(format_http_date),
                    ..Default::default()
                }
            }
            Err(ServeError::UpstreamEmpty) => self.empty_response(ext, fill.as_deref()),
            Err(e) => {
                warn!("{} read error for {}/{}/{}/{}: {}", scheme, name, z, x, y, e);
                self.empty_response(ext, fill.as_deref())
            }
        }
    }

    async fn fetch_http(&self, url: &str) -> ResolvedResource {
        let ext = url.rsplit('.').next().unwrap_or("");
        match self.client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let header = |name: &str| {
                    resp.headers()
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .map(String::from)
                };
                let modified = header("last-modified");
                let expires = header("expires");
                let etag = header("etag");
                let content_type = header("content-type");
                match resp.bytes().await {
                    Ok(bytes) => ResolvedResource {
                        data: bytes.to_vec(),
                        content_type,
                        modified,
                        expires,
                        etag,
                    },
                    Err(e) => {
                        warn!("body read failed for {}: {}", url, e);
                        self.empty_response(ext, None)
                    }
                }
            }
            Ok(resp) => {
                warn!("upstream {} returned {}", url, resp.status());
                self.empty_response(ext, None)
            }
            Err(e) => {
                warn!("fetch failed for {}: {}", url, e);
                self.empty_response(ext, None)
            }
        }
    }

    /// A zero-byte body for vector/unknown formats; a cached 1x1 raster in
    /// the source's fill color otherwise.
    pub fn empty_response(&self, format: &str, color: Option<&str>) -> ResolvedResource {
        let format = match format {
            "png" | "jpg" | "jpeg" | "webp" => format,
            _ => {
                return ResolvedResource {
                    data: Vec::new(),
                    content_type: Some("application/x-protobuf".to_string()),
                    ..Default::default()
                }
            }
        };
        let color = color.unwrap_or("rgba(255,255,255,0)");
        let key = (format.to_string(), color.to_string());

        {
            let cache = self.empty_cache.lock().unwrap();
            if let Some(data) = cache.get(&key) {
                return ResolvedResource {
                    data: data.clone(),
                    content_type: Some(content_type_for(format).to_string()),
                    ..Default::default()
                };
            }
        }

        let rgba = parse_color(color).unwrap_or([255, 255, 255, 0]);
        let data = encode_pixel(format, rgba);

        let mut cache = self.empty_cache.lock().unwrap();
        if cache.len() < EMPTY_CACHE_CAP {
            cache.insert(key, data.clone());
        }
        ResolvedResource {
            data,
            content_type: Some(content_type_for(format).to_string()),
            ..Default::default()
        }
    }

    #[cfg(test)]
    fn empty_cache_len(&self) -> usize {
        self.empty_cache.lock().unwrap().len()
    }
}

fn parse_tile_path(rest: &str) -> Option<(&str, u8, u32, u32, &str)> {
    // <name>/<z>/<x>/<y>.<ext>
    let mut parts = rest.trim_start_matches('/').splitn(4, '/');
    let name = parts.next()?;
    let z: u8 = parts.next()?.parse().ok()?;
    let x: u32 = parts.next()?.parse().ok()?;
    let (y_str, ext) = parts.next()?.split_once('.')?;
    let y: u32 = y_str.parse().ok()?;
    if z > 24 {
        return None;
    }
    Some((name, z, x, y, ext))
}

fn content_type_for(ext: &str) -> &'static str {
    match ext {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        _ => "application/x-protobuf",
    }
}

fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

fn encode_pixel(format: &str, rgba: [u8; 4]) -> Vec<u8> {
    let img = RgbaImage::from_pixel(1, 1, Rgba(rgba));
    match format {
        "webp" => webp::Encoder::from_rgba(img.as_raw(), 1, 1)
            .encode_lossless()
            .to_vec(),
        "jpg" | "jpeg" => {
            let mut out = Cursor::new(Vec::new());
            let mut encoder = image::codecs::jpeg::JpegEncoder::new(&mut out);
            // Alpha is meaningless in jpeg; drop it.
            let rgb = image::DynamicImage::ImageRgba8(img).to_rgb8();
            encoder
                .encode(rgb.as_raw(), 1, 1, ExtendedColorType::Rgb8)
                .expect("1x1 jpeg encode");
            out.into_inner()
        }
        _ => {
            let mut out = Cursor::new(Vec::new());
            PngEncoder::new(&mut out)
                .write_image(img.as_raw(), 1, 1, ExtendedColorType::Rgba8)
                .expect("1x1 png encode");
            out.into_inner()
        }
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub fn format_http_date(when: DateTime<Utc>) -> String {
    when.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ArchiveKind, DataDescriptor};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use sqlx::sqlite::SqliteConnectOptions;
    use sqlx::SqlitePool;
    use std::io::Write;

    fn resolver(dir: &std::path::Path) -> ResourceResolver {
        ResourceResolver::new(
            dir.join("sprites"),
            Arc::new(GlyphStore::scan(&dir.join("fonts"))),
            None,
            reqwest::Client::new(),
            None,
        )
    }

    #[test]
    fn percent_decoding() {
        assert_eq!(percent_decode("Open%20Sans"), "Open Sans");
        assert_eq!(percent_decode("plain"), "plain");
        assert_eq!(percent_decode("bad%2"), "bad%2");
    }

    #[test]
    fn tile_path_parsing() {
        assert_eq!(
            parse_tile_path("osm/3/2/1.pbf"),
            Some(("osm", 3, 2, 1, "pbf"))
        );
        assert_eq!(
            parse_tile_path("hills/12/2048/1362.png"),
            Some(("hills", 12, 2048, 1362, "png"))
        );
        assert_eq!(parse_tile_path("osm/3/2/1"), None);
        assert_eq!(parse_tile_path("osm/99/0/0.pbf"), None);
        assert_eq!(parse_tile_path("osm/x/2/1.pbf"), None);
    }

    #[test]
    fn empty_response_synthesis() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver(dir.path());

        let vector = resolver.empty_response("pbf", None);
        assert!(vector.data.is_empty());

        let raster = resolver.empty_response("png", Some("#ff0000"));
        let img = image::load_from_memory(&raster.data).unwrap().to_rgba8();
        assert_eq!(img.dimensions(), (1, 1));
        assert_eq!(img.get_pixel(0, 0).0, [255, 0, 0, 255]);

        let transparent = resolver.empty_response("png", None);
        let img = image::load_from_memory(&transparent.data).unwrap().to_rgba8();
        assert_eq!(img.get_pixel(0, 0).0[3], 0);
    }

    #[test]
    fn empty_cache_is_keyed_and_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver(dir.path());

        resolver.empty_response("png", Some("#ff0000"));
        resolver.empty_response("png", Some("#ff0000"));
        resolver.empty_response("webp", Some("#ff0000"));
        assert_eq!(resolver.empty_cache_len(), 2);

        // Vector formats never enter the cache.
        resolver.empty_response("pbf", None);
        assert_eq!(resolver.empty_cache_len(), 2);

        for i in 0..2 * EMPTY_CACHE_CAP {
            resolver.empty_response("png", Some(&format!("rgb({},0,0)", i % 255)));
        }
        assert!(resolver.empty_cache_len() <= EMPTY_CACHE_CAP);
    }

    #[tokio::test]
    async fn sprite_fetch_reads_and_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let sprites = dir.path().join("sprites");
        std::fs::create_dir_all(sprites.join("basic")).unwrap();
        std::fs::write(sprites.join("basic/sprite.json"), b"{}").unwrap();
        let resolver = resolver(dir.path());

        let res = resolver
            .fetch(&SourceSet::new(), "sprites://basic/sprite.json")
            .await
            .unwrap();
        assert_eq!(res.data, b"{}");
        assert_eq!(res.content_type.as_deref(), Some("application/json"));

        assert!(resolver
            .fetch(&SourceSet::new(), "sprites://../secret.json")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn unknown_scheme_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver(dir.path());
        assert!(matches!(
            resolver.fetch(&SourceSet::new(), "gopher://x").await,
            Err(ServeError::BadRequest(_))
        ));
    }

    async fn mbtiles_source_with_payload(dir: &std::path::Path, payload: &[u8]) -> Arc<TileSource> {
        let path = dir.join("v.mbtiles");
        let opts = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(opts).await.unwrap();
        sqlx::query("CREATE TABLE metadata (name TEXT, value TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO metadata VALUES ('format', 'pbf')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE tiles (zoom_level INTEGER, tile_column INTEGER, tile_row INTEGER, tile_data BLOB)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO tiles VALUES (0, 0, 0, ?)")
            .bind(payload)
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        let descriptor = DataDescriptor {
            inputfile: path.to_string_lossy().into_owned(),
            filetype: ArchiveKind::Mbtiles,
        };
        Arc::new(
            TileSource::open(&descriptor, &reqwest::Client::new())
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn archive_tiles_are_inflated_and_decorated() {
        let dir = tempfile::tempdir().unwrap();
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(b"vector-tile").unwrap();
        let payload = gz.finish().unwrap();
        let source = mbtiles_source_with_payload(dir.path(), &payload).await;
        let mut sources = SourceSet::new();
        sources.insert("osm".to_string(), source);

        let decorator: DataDecorator = Arc::new(|_, kind, mut data, _| {
            assert_eq!(kind, "data");
            data.extend_from_slice(b"!");
            data
        });
        let resolver = ResourceResolver::new(
            dir.path().join("sprites"),
            Arc::new(GlyphStore::scan(&dir.path().join("fonts"))),
            None,
            reqwest::Client::new(),
            Some(decorator),
        );

        let res = resolver
            .fetch(&sources, "mbtiles://osm/0/0/0.pbf")
            .await
            .unwrap();
        assert_eq!(res.data, b"vector-tile!");

        // A missing tile degrades to an empty body instead of an error.
        let res = resolver
            .fetch(&sources, "mbtiles://osm/5/1/1.pbf")
            .await
            .unwrap();
        assert!(res.data.is_empty());
    }

    #[tokio::test]
    async fn malformed_vector_blob_degrades_to_empty_response() {
        // A stored .pbf that is not actually gzipped must fail inflation
        // and come back as the synthesized empty tile, never as raw bytes.
        let dir = tempfile::tempdir().unwrap();
        let source = mbtiles_source_with_payload(dir.path(), b"not-gzip-data").await;
        let mut sources = SourceSet::new();
        sources.insert("osm".to_string(), source);
        let resolver = resolver(dir.path());

        let res = resolver
            .fetch(&sources, "mbtiles://osm/0/0/0.pbf")
            .await
            .unwrap();
        assert!(res.data.is_empty());
        assert_eq!(
            res.content_type.as_deref(),
            Some("application/x-protobuf")
        );
    }
}
