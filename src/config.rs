use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

fn default_listen() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_max_scale_factor() -> u32 {
    3
}

fn default_max_size() -> u32 {
    2048
}

fn default_min_pool_sizes() -> Vec<usize> {
    vec![8, 4, 2]
}

fn default_max_pool_sizes() -> Vec<usize> {
    vec![16, 8, 4]
}

fn default_true() -> bool {
    true
}

fn default_jpeg_quality() -> u8 {
    80
}

fn default_webp_quality() -> f32 {
    90.0
}

#[derive(Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    pub thread_count: Option<usize>,
    /// Base URL advertised in tilejson `tiles` templates. Defaults to the
    /// request's own host.
    pub public_url: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub options: OptionsConfig,
    #[serde(default)]
    pub format_quality: FormatQuality,
    /// Source name -> archive descriptor table consulted when a style
    /// declares `pmtiles://{name}` or `mbtiles://{name}`.
    #[serde(default)]
    pub data: HashMap<String, DataConfig>,
    #[serde(default)]
    pub styles: HashMap<String, StyleEntry>,
}

#[derive(Deserialize, Clone)]
pub struct PathsConfig {
    #[serde(default = "PathsConfig::default_styles")]
    pub styles: PathBuf,
    #[serde(default = "PathsConfig::default_fonts")]
    pub fonts: PathBuf,
    #[serde(default = "PathsConfig::default_sprites")]
    pub sprites: PathBuf,
    #[serde(default = "PathsConfig::default_icons")]
    pub icons: PathBuf,
    #[serde(default = "PathsConfig::default_archives")]
    pub archives: PathBuf,
}

impl PathsConfig {
    fn default_styles() -> PathBuf {
        "data/styles".into()
    }
    fn default_fonts() -> PathBuf {
        "data/fonts".into()
    }
    fn default_sprites() -> PathBuf {
        "data/sprites".into()
    }
    fn default_icons() -> PathBuf {
        "data/icons".into()
    }
    fn default_archives() -> PathBuf {
        "data/archives".into()
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            styles: Self::default_styles(),
            fonts: Self::default_fonts(),
            sprites: Self::default_sprites(),
            icons: Self::default_icons(),
            archives: Self::default_archives(),
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct OptionsConfig {
    /// Highest `@Nx` pixel ratio served; pools are built for 1..=N.
    #[serde(default = "default_max_scale_factor")]
    pub max_scale_factor: u32,
    /// Cap on `max(width, height) * scale` for any render.
    #[serde(default = "default_max_size")]
    pub max_size: u32,
    /// Extra logical pixels rendered around tiles and cropped away, to keep
    /// labels consistent across tile seams.
    #[serde(default)]
    pub tile_margin: u32,
    #[serde(default = "default_min_pool_sizes")]
    pub min_pool_sizes: Vec<usize>,
    #[serde(default = "default_max_pool_sizes")]
    pub max_pool_sizes: Vec<usize>,
    #[serde(default)]
    pub allow_remote_marker_icons: bool,
    #[serde(default = "default_true")]
    pub allow_inline_marker_images: bool,
    /// Relative icon paths servable from `paths.icons`.
    #[serde(default)]
    pub available_icons: Vec<String>,
    /// TTF used for watermark/attribution text; system sans-serif lookup
    /// when unset.
    #[serde(default)]
    pub watermark_font: Option<PathBuf>,
    /// Serve every font stack found on disk instead of only the ones the
    /// registered styles reference.
    #[serde(default)]
    pub serve_all_fonts: bool,
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            max_scale_factor: default_max_scale_factor(),
            max_size: default_max_size(),
            tile_margin: 0,
            min_pool_sizes: default_min_pool_sizes(),
            max_pool_sizes: default_max_pool_sizes(),
            allow_remote_marker_icons: false,
            allow_inline_marker_images: true,
            available_icons: Vec::new(),
            watermark_font: None,
            serve_all_fonts: false,
        }
    }
}

impl OptionsConfig {
    /// Pool lower bound for pixel ratio `scale`, indexed by `scale - 1` and
    /// clamped to the last configured entry.
    pub fn pool_min(&self, scale: u32) -> usize {
        pick(&self.min_pool_sizes, scale, 4)
    }

    /// Pool upper bound for `scale`; never below the lower bound.
    pub fn pool_max(&self, scale: u32) -> usize {
        pick(&self.max_pool_sizes, scale, 8).max(self.pool_min(scale))
    }
}

fn pick(sizes: &[usize], scale: u32, fallback: usize) -> usize {
    if sizes.is_empty() {
        return fallback;
    }
    let idx = (scale.max(1) as usize - 1).min(sizes.len() - 1);
    sizes[idx]
}

#[derive(Deserialize, Clone)]
pub struct FormatQuality {
    #[serde(default = "default_jpeg_quality")]
    pub jpeg: u8,
    #[serde(default = "default_webp_quality")]
    pub webp: f32,
}

impl Default for FormatQuality {
    fn default() -> Self {
        Self {
            jpeg: default_jpeg_quality(),
            webp: default_webp_quality(),
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct DataConfig {
    pub pmtiles: Option<String>,
    pub mbtiles: Option<String>,
}

#[derive(Deserialize, Clone)]
pub struct StyleEntry {
    /// Style document path, relative to `paths.styles`.
    pub style: String,
    pub watermark: Option<String>,
    pub static_attribution_text: Option<String>,
    pub public_url: Option<String>,
    /// Merged over the generated tilejson (e.g. an `attribution` override).
    #[serde(default)]
    pub tilejson: Option<serde_json::Value>,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let path = if std::path::Path::new("rastile.toml").exists() {
            "rastile.toml"
        } else if std::path::Path::new("rastile.example.toml").exists() {
            "rastile.example.toml"
        } else {
            return Err(anyhow::anyhow!(
                "Configuration file not found. Please create rastile.toml or provide rastile.example.toml."
            ));
        };

        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        // The scale factor bounds the single-digit @Nx URL suffix.
        config.options.max_scale_factor = config.options.max_scale_factor.clamp(1, 9);
        Ok(config)
    }
}
