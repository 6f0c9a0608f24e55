//! Packaged tile archives. A style source resolves, through the data
//! table, to either a PMTiles container (sparse directory + header, local
//! file or remote URL) or an MBTiles database (sqlite, gzipped vector
//! tiles). Both are read through the single `TileSource` dispatch so the
//! resolver never branches on the container format.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use pmtiles::async_reader::AsyncPmTilesReader;
use pmtiles::http::HttpBackend;
use pmtiles::mmap::MmapBackend;
use pmtiles::{Compression, TileType};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::SqlitePool;
use tracing::debug;

use crate::config::Config;
use crate::error::ServeError;
use crate::models::{ArchiveKind, DataDescriptor};

/// Archive metadata merged into the style source at registration.
#[derive(Debug, Clone, Default)]
pub struct ArchiveInfo {
    pub bounds: Option<[f64; 4]>,
    pub center: Option<[f64; 3]>,
    pub minzoom: Option<u8>,
    pub maxzoom: Option<u8>,
    /// Tile payload format: `pbf`, `png`, `jpeg`, `webp`.
    pub format: Option<String>,
    pub attribution: Option<String>,
    pub proj4: Option<String>,
    /// Declared color for synthesized empty raster tiles.
    pub fill_color: Option<String>,
    /// Extra TileJSON keys (`vector_layers` and friends).
    pub json: Option<serde_json::Value>,
}

impl ArchiveInfo {
    fn absorb_metadata_json(&mut self, value: &serde_json::Value) {
        let get_str = |key: &str| value.get(key).and_then(|v| v.as_str()).map(String::from);
        if self.attribution.is_none() {
            self.attribution = get_str("attribution");
        }
        if self.proj4.is_none() {
            self.proj4 = get_str("proj4");
        }
        if self.fill_color.is_none() {
            self.fill_color = get_str("fillColor").or_else(|| get_str("fill_color"));
        }
        if self.json.is_none() {
            if let Some(layers) = value.get("vector_layers") {
                self.json = Some(serde_json::json!({ "vector_layers": layers }));
            }
        }
    }
}

/// One tile read out of an archive. `gzipped` tells the resolver whether a
/// vector payload must be inflated before use: PMTiles declares compression
/// in its header, MBTiles stores vector tiles gzipped by definition.
#[derive(Debug, Clone)]
pub struct TileData {
    pub data: Vec<u8>,
    pub gzipped: bool,
}

/// Maps a style source name to its archive descriptor using the `[data]`
/// config table. A missing name is fatal at registration time.
#[derive(Clone)]
pub struct DataResolver {
    table: HashMap<String, DataDescriptor>,
    archives_dir: PathBuf,
}

impl DataResolver {
    pub fn from_config(config: &Config) -> Result<Self, ServeError> {
        let mut table = HashMap::new();
        for (name, entry) in &config.data {
            let descriptor = match (&entry.pmtiles, &entry.mbtiles) {
                (Some(file), None) => DataDescriptor {
                    inputfile: file.clone(),
                    filetype: ArchiveKind::Pmtiles,
                },
                (None, Some(file)) => DataDescriptor {
                    inputfile: file.clone(),
                    filetype: ArchiveKind::Mbtiles,
                },
                _ => {
                    return Err(ServeError::FatalConfig(format!(
                        "data source '{name}' must set exactly one of pmtiles or mbtiles"
                    )))
                }
            };
            table.insert(name.clone(), descriptor);
        }
        Ok(Self {
            table,
            archives_dir: config.paths.archives.clone(),
        })
    }

    pub fn resolve(&self, id: &str) -> Result<DataDescriptor, ServeError> {
        let mut descriptor = self
            .table
            .get(id)
            .cloned()
            .ok_or_else(|| ServeError::FatalConfig(format!("unknown data source '{id}'")))?;
        if !is_remote(&descriptor.inputfile) {
            descriptor.inputfile = self
                .archives_dir
                .join(&descriptor.inputfile)
                .to_string_lossy()
                .into_owned();
        }
        Ok(descriptor)
    }
}

fn is_remote(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Reject descriptors pointing at missing, non-regular or empty files.
/// Remote inputs are only meaningful for PMTiles.
fn check_local_file(path: &str) -> Result<(), ServeError> {
    let meta = std::fs::metadata(path)
        .map_err(|e| ServeError::FatalConfig(format!("cannot stat archive '{path}': {e}")))?;
    if !meta.is_file() || meta.len() == 0 {
        return Err(ServeError::FatalConfig(format!(
            "archive '{path}' is not a regular non-empty file"
        )));
    }
    Ok(())
}

enum PmtilesBackend {
    File(AsyncPmTilesReader<MmapBackend>),
    Http(AsyncPmTilesReader<HttpBackend>),
}

pub struct PmtilesSource {
    reader: PmtilesBackend,
    info: ArchiveInfo,
    gzipped: bool,
    last_modified: Option<DateTime<Utc>>,
}

pub struct MbtilesSource {
    pool: SqlitePool,
    info: ArchiveInfo,
    last_modified: Option<DateTime<Utc>>,
}

/// A bound style source, dispatching tile reads to the container it wraps.
pub enum TileSource {
    Pmtiles(PmtilesSource),
    Mbtiles(MbtilesSource),
}

impl TileSource {
    pub async fn open(descriptor: &DataDescriptor, client: &reqwest::Client) -> Result<Self, ServeError> {
        match descriptor.filetype {
            ArchiveKind::Pmtiles => {
                Ok(TileSource::Pmtiles(PmtilesSource::open(descriptor, client).await?))
            }
            ArchiveKind::Mbtiles => Ok(TileSource::Mbtiles(MbtilesSource::open(descriptor).await?)),
        }
    }

    pub fn kind(&self) -> ArchiveKind {
        match self {
            TileSource::Pmtiles(_) => ArchiveKind::Pmtiles,
            TileSource::Mbtiles(_) => ArchiveKind::Mbtiles,
        }
    }

    pub fn info(&self) -> &ArchiveInfo {
        match self {
            TileSource::Pmtiles(s) => &s.info,
            TileSource::Mbtiles(s) => &s.info,
        }
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        match self {
            TileSource::Pmtiles(s) => s.last_modified,
            TileSource::Mbtiles(s) => s.last_modified,
        }
    }

    /// Read one tile; `Err(UpstreamEmpty)` when the archive holds nothing
    /// at this address.
    pub async fn get_tile(&self, z: u8, x: u32, y: u32) -> Result<TileData, ServeError> {
        match self {
            TileSource::Pmtiles(s) => s.get_tile(z, x, y).await,
            TileSource::Mbtiles(s) => s.get_tile(z, x, y).await,
        }
    }
}

impl PmtilesSource {
    async fn open(descriptor: &DataDescriptor, client: &reqwest::Client) -> Result<Self, ServeError> {
        let input = &descriptor.inputfile;
        let (reader, last_modified) = if is_remote(input) {
            let reader = AsyncPmTilesReader::new_with_url(client.clone(), input.as_str())
                .await
                .map_err(|e| ServeError::FatalConfig(format!("cannot open '{input}': {e}")))?;
            (PmtilesBackend::Http(reader), None)
        } else {
            check_local_file(input)?;
            let mtime = std::fs::metadata(input)
                .ok()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from);
            let reader = AsyncPmTilesReader::new_with_path(input)
                .await
                .map_err(|e| ServeError::FatalConfig(format!("cannot open '{input}': {e}")))?;
            (PmtilesBackend::File(reader), mtime)
        };

        let (mut info, gzipped) = match &reader {
            PmtilesBackend::File(r) => Self::header_info(r.get_header()),
            PmtilesBackend::Http(r) => Self::header_info(r.get_header()),
        };

        let metadata = match &reader {
            PmtilesBackend::File(r) => r.get_metadata().await.ok(),
            PmtilesBackend::Http(r) => r.get_metadata().await.ok(),
        };
        if let Some(raw) = metadata {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) {
                info.absorb_metadata_json(&value);
            }
        }

        Ok(Self {
            reader,
            info,
            gzipped,
            last_modified,
        })
    }

    fn header_info(header: &pmtiles::Header) -> (ArchiveInfo, bool) {
        let format = match header.tile_type {
            TileType::Mvt => Some("pbf"),
            TileType::Png => Some("png"),
            TileType::Jpeg => Some("jpeg"),
            TileType::Webp => Some("webp"),
            _ => None,
        };
        let info = ArchiveInfo {
            bounds: Some([
                header.min_longitude as f64,
                header.min_latitude as f64,
                header.max_longitude as f64,
                header.max_latitude as f64,
            ]),
            center: Some([
                header.center_longitude as f64,
                header.center_latitude as f64,
                header.center_zoom as f64,
            ]),
            minzoom: Some(header.min_zoom),
            maxzoom: Some(header.max_zoom),
            format: format.map(String::from),
            ..Default::default()
        };
        (info, matches!(header.tile_compression, Compression::Gzip))
    }

    async fn get_tile(&self, z: u8, x: u32, y: u32) -> Result<TileData, ServeError> {
        let tile = match &self.reader {
            PmtilesBackend::File(r) => r.get_tile(z, x as u64, y as u64).await,
            PmtilesBackend::Http(r) => r.get_tile(z, x as u64, y as u64).await,
        };
        match tile {
            Some(bytes) if !bytes.is_empty() => Ok(TileData {
                data: bytes.to_vec(),
                gzipped: self.gzipped,
            }),
            _ => Err(ServeError::UpstreamEmpty),
        }
    }
}

impl MbtilesSource {
    async fn open(descriptor: &DataDescriptor) -> Result<Self, ServeError> {
        let path = &descriptor.inputfile;
        if is_remote(path) {
            return Err(ServeError::FatalConfig(format!(
                "mbtiles source '{path}' must be a local file"
            )));
        }
        check_local_file(path)?;

        let mtime = std::fs::metadata(path)
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);

        let opts = SqliteConnectOptions::new().filename(path).read_only(true);
        let pool = SqlitePool::connect_with(opts)
            .await
            .map_err(|e| ServeError::FatalConfig(format!("cannot open '{path}': {e}")))?;

        let info = Self::read_metadata(&pool).await?;
        debug!("opened mbtiles {} ({:?})", path, info.format);

        Ok(Self {
            pool,
            info,
            last_modified: mtime,
        })
    }

    async fn read_metadata(pool: &SqlitePool) -> Result<ArchiveInfo, ServeError> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT name, value FROM metadata")
            .fetch_all(pool)
            .await
            .map_err(|e| ServeError::FatalConfig(format!("mbtiles metadata read failed: {e}")))?;

        let mut info = ArchiveInfo::default();
        for (name, value) in rows {
            match name.as_str() {
                "bounds" => {
                    let parts: Vec<f64> =
                        value.split(',').filter_map(|p| p.trim().parse().ok()).collect();
                    if parts.len() == 4 {
                        info.bounds = Some([parts[0], parts[1], parts[2], parts[3]]);
                    }
                }
                "center" => {
                    let parts: Vec<f64> =
                        value.split(',').filter_map(|p| p.trim().parse().ok()).collect();
                    if parts.len() == 3 {
                        info.center = Some([parts[0], parts[1], parts[2]]);
                    }
                }
                "minzoom" => info.minzoom = value.parse().ok(),
                "maxzoom" => info.maxzoom = value.parse().ok(),
                "format" => info.format = Some(value),
                "attribution" => info.attribution = Some(value),
                "proj4" => info.proj4 = Some(value),
                "fillColor" | "fill_color" => info.fill_color = Some(value),
                "json" => {
                    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&value) {
                        info.absorb_metadata_json(&value);
                        if info.json.is_none() {
                            info.json = Some(value);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(info)
    }

    async fn get_tile(&self, z: u8, x: u32, y: u32) -> Result<TileData, ServeError> {
        // MBTiles rows are TMS: flipped vertically relative to XYZ.
        let row = (1u32 << z) - 1 - y;
        let data: Option<(Vec<u8>,)> = sqlx::query_as(
            "SELECT tile_data FROM tiles WHERE zoom_level = ? AND tile_column = ? AND tile_row = ?",
        )
        .bind(z as i64)
        .bind(x as i64)
        .bind(row as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ServeError::Upstream(format!("mbtiles read failed: {e}")))?;

        match data {
            Some((bytes,)) if !bytes.is_empty() => Ok(TileData {
                data: bytes,
                // Vector tiles in an mbtiles archive are always stored
                // gzipped; flagging unconditionally makes a malformed blob
                // fail decompression instead of passing through raw.
                gzipped: true,
            }),
            _ => Err(ServeError::UpstreamEmpty),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::io::Write;

    fn resolver_for(toml: &str) -> DataResolver {
        let config = Config::from_toml(toml).unwrap();
        DataResolver::from_config(&config).unwrap()
    }

    #[test]
    fn resolver_joins_archives_dir() {
        let resolver = resolver_for(
            "[paths]\narchives = \"/var/tiles\"\n[data.osm]\nmbtiles = \"osm.mbtiles\"\n",
        );
        let descriptor = resolver.resolve("osm").unwrap();
        assert_eq!(descriptor.filetype, ArchiveKind::Mbtiles);
        assert_eq!(descriptor.inputfile, "/var/tiles/osm.mbtiles");
    }

    #[test]
    fn resolver_keeps_remote_urls() {
        let resolver = resolver_for(
            "[data.world]\npmtiles = \"https://tiles.example.com/world.pmtiles\"\n",
        );
        let descriptor = resolver.resolve("world").unwrap();
        assert_eq!(descriptor.filetype, ArchiveKind::Pmtiles);
        assert_eq!(
            descriptor.inputfile,
            "https://tiles.example.com/world.pmtiles"
        );
    }

    #[test]
    fn resolver_rejects_unknown_source() {
        let resolver = resolver_for("");
        assert!(matches!(
            resolver.resolve("nope"),
            Err(ServeError::FatalConfig(_))
        ));
    }

    #[test]
    fn resolver_rejects_ambiguous_source() {
        let config = Config::from_toml(
            "[data.bad]\nmbtiles = \"a.mbtiles\"\npmtiles = \"a.pmtiles\"\n",
        )
        .unwrap();
        assert!(DataResolver::from_config(&config).is_err());
    }

    #[test]
    fn local_file_check_rejects_empty_files() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(check_local_file(&file.path().to_string_lossy()).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"data").unwrap();
        assert!(check_local_file(&file.path().to_string_lossy()).is_ok());
    }

    async fn fixture_mbtiles(dir: &std::path::Path) -> String {
        let path = dir.join("fixture.mbtiles");
        let opts = SqliteConnectOptions::new()
            .filename(&path)
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
        for (name, value) in [
            ("format", "pbf"),
            ("bounds", "-180,-85,180,85"),
            ("minzoom", "0"),
            ("maxzoom", "14"),
            ("attribution", "© Test Data"),
        ] {
            sqlx::query("INSERT INTO metadata (name, value) VALUES (?, ?)")
                .bind(name)
                .bind(value)
                .execute(&pool)
                .await
                .unwrap();
        }
        // XYZ (1, 0, 0) lives at TMS row 1.
        sqlx::query("INSERT INTO tiles VALUES (1, 0, 1, ?)")
            .bind(&b"tile-bytes"[..])
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn mbtiles_reads_metadata_and_flips_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture_mbtiles(dir.path()).await;
        let descriptor = DataDescriptor {
            inputfile: path,
            filetype: ArchiveKind::Mbtiles,
        };
        let source = TileSource::open(&descriptor, &reqwest::Client::new())
            .await
            .unwrap();

        let info = source.info();
        assert_eq!(info.format.as_deref(), Some("pbf"));
        assert_eq!(info.minzoom, Some(0));
        assert_eq!(info.maxzoom, Some(14));
        assert_eq!(info.attribution.as_deref(), Some("© Test Data"));
        assert_eq!(info.bounds, Some([-180.0, -85.0, 180.0, 85.0]));

        let tile = source.get_tile(1, 0, 0).await.unwrap();
        assert_eq!(tile.data, b"tile-bytes");
        assert!(tile.gzipped, "mbtiles payloads are always flagged compressed");

        // The mirror-image address holds nothing.
        assert!(matches!(
            source.get_tile(1, 0, 1).await,
            Err(ServeError::UpstreamEmpty)
        ));
    }
}
