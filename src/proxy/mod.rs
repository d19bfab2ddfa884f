pub mod cache;
pub mod forward_error;
pub mod forward_limits;
pub mod headers;
pub mod http;
pub mod listener;
pub mod request;
pub mod request_pipeline;
pub mod upstream;

use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::{origin::Origin, settings::Settings};
use self::cache::ResponseCache;
use self::http::upstream::UpstreamPool;
use rustls::client::ClientConfig;

/// Shared state handed to every connection task.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub origin: Arc<Origin>,
    pub cache: Arc<ResponseCache>,
    pub upstreams: Arc<UpstreamPool>,
    /// Present only when the origin is served over HTTPS.
    pub tls: Option<Arc<ClientConfig>>,
}

impl AppContext {
    pub fn new(
        settings: Arc<Settings>,
        origin: Arc<Origin>,
        cache: Arc<ResponseCache>,
        upstreams: Arc<UpstreamPool>,
        tls: Option<Arc<ClientConfig>>,
    ) -> Self {
        Self {
            settings,
            origin,
            cache,
            upstreams,
            tls,
        }
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    listener::start_listener(app).await
}

/// Serves on an already bound listener; used when the caller needs the bound address first.
pub async fn run_with_listener(app: AppContext, listener: TcpListener) -> Result<()> {
    listener::serve(app, listener).await
}
