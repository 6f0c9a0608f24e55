//! Style bindings and their lifecycle. A binding owns the renderer pools
//! for its style; it is created by registration, immutable afterwards, and
//! destroyed by an explicit removal that closes the pools.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::info;
use url::Url;

use crate::archives::DataResolver;
use crate::config::{Config, OptionsConfig, StyleEntry};
use crate::error::ServeError;
use crate::models::RenderMode;
use crate::pool::Pool;
use crate::projection::WgsToInternal;
use crate::renderer::{MlRenderer, RenderBackend};
use crate::resolver::SourceSet;
use crate::style;

/// Builds one renderer instance for a (pixel ratio, mode) pool slot.
pub type BackendFactory =
    Arc<dyn Fn(u32, RenderMode) -> Result<Box<dyn RenderBackend>, ServeError> + Send + Sync>;

/// Everything a binding carries besides its pools.
pub struct BindingParts {
    pub tilejson: Value,
    pub sources: SourceSet,
    pub data_projection: Option<WgsToInternal>,
    pub watermark: Option<String>,
    pub static_attribution_text: Option<String>,
    pub public_url: Option<String>,
}

pub struct StyleBinding {
    pub id: String,
    pub tilejson: Value,
    pub public_url: Option<String>,
    pub sources: SourceSet,
    pub data_projection: Option<WgsToInternal>,
    pub last_modified: DateTime<Utc>,
    pub watermark: Option<String>,
    pub static_attribution_text: Option<String>,
    pub max_scale_factor: u32,
    tile_pools: Vec<Pool<Box<dyn RenderBackend>>>,
    static_pools: Vec<Pool<Box<dyn RenderBackend>>>,
    /// Keeps the renderer-facing style document on disk for the binding's
    /// lifetime.
    _style_file: Option<tempfile::NamedTempFile>,
}

impl StyleBinding {
    /// Build the binding and its `2 * max_scale_factor` pools. The factory
    /// runs eagerly for each pool's `min` instances.
    pub fn assemble(
        id: String,
        parts: BindingParts,
        options: &OptionsConfig,
        factory: BackendFactory,
        style_file: Option<tempfile::NamedTempFile>,
    ) -> Result<Self, ServeError> {
        let max_scale = options.max_scale_factor.clamp(1, 9);

        let mut tile_pools = Vec::with_capacity(max_scale as usize);
        let mut static_pools = Vec::with_capacity(max_scale as usize);
        for scale in 1..=max_scale {
            let make = Arc::clone(&factory);
            tile_pools.push(Pool::new(
                options.pool_min(scale),
                options.pool_max(scale),
                move || make(scale, RenderMode::Tile),
            )?);
            let make = Arc::clone(&factory);
            static_pools.push(Pool::new(
                options.pool_min(scale),
                options.pool_max(scale),
                move || make(scale, RenderMode::Static),
            )?);
        }

        Ok(Self {
            id,
            tilejson: parts.tilejson,
            public_url: parts.public_url,
            sources: parts.sources,
            data_projection: parts.data_projection,
            last_modified: Utc::now(),
            watermark: parts.watermark,
            static_attribution_text: parts.static_attribution_text,
            max_scale_factor: max_scale,
            tile_pools,
            static_pools,
            _style_file: style_file,
        })
    }

    /// Pool selection: margin-free tile renders keep their dedicated
    /// pools, everything else (static maps, margined tiles) shares the
    /// static pools whose render sizes vary.
    pub fn pool(
        &self,
        mode: RenderMode,
        tile_margin: u32,
        scale: u32,
    ) -> Option<&Pool<Box<dyn RenderBackend>>> {
        let pools = if mode == RenderMode::Tile && tile_margin == 0 {
            &self.tile_pools
        } else {
            &self.static_pools
        };
        if scale == 0 {
            return None;
        }
        pools.get(scale as usize - 1)
    }

    /// Close every pool. In-flight renders finish; their instances are
    /// destroyed on release.
    pub fn close(&self) {
        for pool in self.tile_pools.iter().chain(self.static_pools.iter()) {
            pool.close();
        }
    }
}

/// The process-wide style table. Written only by register/remove; request
/// paths take an `Arc` snapshot.
#[derive(Default)]
pub struct StyleRegistry {
    styles: RwLock<HashMap<String, Arc<StyleBinding>>>,
}

impl StyleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Arc<StyleBinding>> {
        self.styles.read().unwrap().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.styles.read().unwrap().keys().cloned().collect()
    }

    /// Insert a binding; a replaced binding has its pools closed.
    pub fn register(&self, binding: StyleBinding) {
        let id = binding.id.clone();
        let previous = self
            .styles
            .write()
            .unwrap()
            .insert(id.clone(), Arc::new(binding));
        if let Some(previous) = previous {
            previous.close();
        }
        info!("registered style {}", id);
    }

    /// Remove and tear down a binding. Returns false for unknown ids.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.styles.write().unwrap().remove(id);
        match removed {
            Some(binding) => {
                binding.close();
                info!("removed style {}", id);
                true
            }
            None => false,
        }
    }
}

/// Load, bind and register one configured style. Returns the font stacks
/// the style references, for the resolver's allow-list.
pub async fn register_style(
    registry: &StyleRegistry,
    config: &Config,
    id: &str,
    entry: &StyleEntry,
    resolver: &DataResolver,
    client: &reqwest::Client,
    local_base: &str,
) -> Result<std::collections::HashSet<String>, ServeError> {
    let style_path = config.paths.styles.join(&entry.style);
    let loaded = style::load_style(
        id,
        &style_path,
        resolver,
        client,
        local_base,
        entry.tilejson.as_ref(),
    )
    .await?;

    let mut style_file = tempfile::Builder::new()
        .suffix(".json")
        .tempfile()
        .map_err(|e| ServeError::Internal(format!("cannot persist style: {e}")))?;
    use std::io::Write as _;
    style_file
        .write_all(serde_json::to_string(&loaded.style_json).unwrap_or_default().as_bytes())
        .map_err(|e| ServeError::Internal(format!("cannot persist style: {e}")))?;
    let style_url = Url::from_file_path(style_file.path())
        .map_err(|_| ServeError::Internal("style tempfile path is not absolute".into()))?;

    let factory: BackendFactory = Arc::new(move |scale, _mode| {
        Ok(Box::new(MlRenderer::new(style_url.clone(), scale as f32)) as Box<dyn RenderBackend>)
    });

    let binding = StyleBinding::assemble(
        id.to_string(),
        BindingParts {
            tilejson: loaded.tilejson,
            sources: loaded.sources,
            data_projection: loaded.data_projection,
            watermark: entry.watermark.clone(),
            static_attribution_text: entry.static_attribution_text.clone(),
            public_url: entry.public_url.clone(),
        },
        &config.options,
        factory,
        Some(style_file),
    )?;

    registry.register(binding);
    Ok(loaded.fonts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::StubRenderer;
    use serde_json::json;

    pub fn stub_binding(id: &str, options: &OptionsConfig) -> StyleBinding {
        let factory: BackendFactory = Arc::new(|scale, _mode| {
            Ok(Box::new(StubRenderer::new([0, 0, 0, 255], scale)) as Box<dyn RenderBackend>)
        });
        StyleBinding::assemble(
            id.to_string(),
            BindingParts {
                tilejson: json!({"tilejson": "2.0.0"}),
                sources: SourceSet::new(),
                data_projection: None,
                watermark: None,
                static_attribution_text: None,
                public_url: None,
            },
            options,
            factory,
            None,
        )
        .unwrap()
    }

    fn small_options() -> OptionsConfig {
        OptionsConfig {
            max_scale_factor: 2,
            min_pool_sizes: vec![1],
            max_pool_sizes: vec![2],
            ..OptionsConfig::default()
        }
    }

    #[test]
    fn pools_exist_per_scale_and_mode() {
        let binding = stub_binding("a", &small_options());
        for scale in 1..=2 {
            assert!(binding.pool(RenderMode::Tile, 0, scale).is_some());
            assert!(binding.pool(RenderMode::Static, 0, scale).is_some());
        }
        assert!(binding.pool(RenderMode::Tile, 0, 3).is_none());
        assert!(binding.pool(RenderMode::Tile, 0, 0).is_none());
    }

    #[test]
    fn margined_tiles_use_static_pools() {
        let binding = stub_binding("a", &small_options());
        let tile_pool = binding.pool(RenderMode::Tile, 0, 1).unwrap() as *const _;
        let margined = binding.pool(RenderMode::Tile, 32, 1).unwrap() as *const _;
        let static_pool = binding.pool(RenderMode::Static, 0, 1).unwrap() as *const _;
        assert!(std::ptr::eq(margined, static_pool));
        assert!(!std::ptr::eq(tile_pool, static_pool));
    }

    #[tokio::test]
    async fn remove_closes_pools_even_for_held_arcs() {
        let registry = StyleRegistry::new();
        registry.register(stub_binding("a", &small_options()));

        let held = registry.get("a").unwrap();
        assert!(registry.remove("a"));
        assert!(registry.get("a").is_none());
        assert!(!registry.remove("a"));

        // A request still holding the binding cannot acquire anymore.
        let pool = held.pool(RenderMode::Tile, 0, 1).unwrap();
        assert!(pool.acquire().await.is_err());
    }

    #[tokio::test]
    async fn re_registration_closes_the_replaced_binding() {
        let registry = StyleRegistry::new();
        registry.register(stub_binding("a", &small_options()));
        let old = registry.get("a").unwrap();
        registry.register(stub_binding("a", &small_options()));
        assert!(old.pool(RenderMode::Tile, 0, 1).unwrap().acquire().await.is_err());
        let new = registry.get("a").unwrap();
        assert!(new.pool(RenderMode::Tile, 0, 1).unwrap().acquire().await.is_ok());
    }
}
