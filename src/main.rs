use axum::{
    http::Request,
    middleware::{self, Next},
    response::Response,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use rastile::archives::DataResolver;
use rastile::config::Config;
use rastile::fonts::GlyphStore;
use rastile::handlers::{self, AppState};
use rastile::overlay::OverlaySettings;
use rastile::pipeline::PipelineSettings;
use rastile::registry::{self, StyleRegistry};
use rastile::resolver::ResourceResolver;

fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::load()?;
    let workers = config.thread_count.unwrap_or_else(num_cpus::get);
    info!("rastile {} booting on {} worker threads", env!("CARGO_PKG_VERSION"), workers);

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()?
        .block_on(serve(config))
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();
}

/// One access-log line per request, emitted after the handler so the
/// status and latency land on the same line.
async fn access_log(req: Request<axum::body::Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = std::time::Instant::now();
    let response = next.run(req).await;
    info!(
        "{} {} -> {} ({:?})",
        method,
        path,
        response.status(),
        started.elapsed()
    );
    response
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("rastile/", env!("CARGO_PKG_VERSION")))
        .build()?;

    // Bind first: registration rewrites style resource URIs to this
    // listener so the renderers can fetch tiles, sprites and glyphs back
    // through the resolver routes.
    let listener = TcpListener::bind(&config.listen).await?;
    let local_addr = listener.local_addr()?;
    let local_base = format!("http://127.0.0.1:{}", local_addr.port());

    let registry = StyleRegistry::new();
    let data_resolver = DataResolver::from_config(&config)?;
    let mut referenced_fonts = HashSet::new();
    for (id, entry) in &config.styles {
        match registry::register_style(
            &registry,
            &config,
            id,
            entry,
            &data_resolver,
            &client,
            &local_base,
        )
        .await
        {
            Ok(fonts) => referenced_fonts.extend(fonts),
            Err(e) => {
                error!("style '{}' did not register, aborting startup: {}", id, e);
                return Err(e.into());
            }
        }
    }

    let glyphs = Arc::new(GlyphStore::scan(&config.paths.fonts));
    let allowed_fonts = if config.options.serve_all_fonts {
        None
    } else {
        Some(referenced_fonts)
    };
    let resolver = ResourceResolver::new(
        config.paths.sprites.clone(),
        glyphs,
        allowed_fonts,
        client.clone(),
        None,
    );

    let pipeline = PipelineSettings::from_config(&config);
    let overlay = OverlaySettings {
        icons_dir: config.paths.icons.clone(),
        available_icons: config.options.available_icons.clone(),
        allow_remote_marker_icons: config.options.allow_remote_marker_icons,
        allow_inline_marker_images: config.options.allow_inline_marker_images,
    };

    let state = Arc::new(AppState {
        config,
        registry,
        resolver,
        pipeline,
        overlay,
        client,
    });

    let app = handlers::router(state).layer(middleware::from_fn(access_log));

    info!("serving tiles on {}", local_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
