pub mod cli;
pub mod io_util;
pub mod logging;
pub mod origin;
pub mod proxy;
pub mod settings;
pub mod util;

use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use rustls::crypto::ring;
use rustls::{RootCertStore, client::ClientConfig};
use rustls_native_certs as native_certs;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::origin::{Origin, Scheme};
use crate::proxy::cache::ResponseCache;
use crate::proxy::http::upstream::UpstreamPool;
use crate::settings::Settings;

pub async fn run(settings: Settings) -> Result<()> {
    let app = build_app(settings).await?;
    proxy::run(app).await
}

/// Like [`run`], but serves on a listener the caller already bound.
pub async fn run_with_listener(settings: Settings, listener: TcpListener) -> Result<()> {
    let app = build_app(settings).await?;
    proxy::run_with_listener(app, listener).await
}

pub async fn build_app(settings: Settings) -> Result<proxy::AppContext> {
    settings.validate()?;
    let origin = settings.origin()?;
    let cache = ResponseCache::open(&settings.cache_dir, settings.cache_max_entry_size)
        .await
        .with_context(|| format!("failed to open cache directory {}", settings.cache_dir.display()))?;
    info!(
        origin = %origin,
        cache_dir = %settings.cache_dir.display(),
        "cache store ready"
    );
    let upstreams = UpstreamPool::new(settings.upstream_pool_capacity_nonzero()?);
    let tls = match origin.scheme() {
        Scheme::Https => Some(build_tls_client_config(&origin)?),
        Scheme::Http => None,
    };

    Ok(proxy::AppContext::new(
        Arc::new(settings),
        Arc::new(origin),
        Arc::new(cache),
        Arc::new(upstreams),
        tls,
    ))
}

fn build_tls_client_config(origin: &Origin) -> Result<Arc<ClientConfig>> {
    let provider = ring::default_provider();
    let builder = ClientConfig::builder_with_provider(provider.into());
    let builder = builder.with_safe_default_protocol_versions()?;

    let mut root_store = RootCertStore::empty();
    let native = native_certs::load_native_certs();
    for err in &native.errors {
        warn!(error = %err, "failed to load some system trust anchors");
    }
    let (added, ignored) = root_store.add_parsable_certificates(native.certs);
    if ignored > 0 {
        warn!(ignored, "ignored {ignored} invalid system trust anchors");
    }
    ensure!(
        added > 0,
        "no trust anchors available for HTTPS origin {}; install system certificates",
        origin.authority()
    );

    let mut config = builder
        .with_root_certificates(Arc::new(root_store))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
