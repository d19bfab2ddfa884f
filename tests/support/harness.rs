use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::Result;
use cacheproxy::cli::LogFormat;
use cacheproxy::proxy::cache::CacheKey;
use cacheproxy::settings::Settings;
use http::Method;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use super::dirs::TestDirs;
use super::net::wait_for_listener;

pub fn default_test_settings(origin: &str, dirs: &TestDirs) -> Settings {
    Settings {
        listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        origin: origin.to_string(),
        cache_dir: dirs.cache_dir().to_path_buf(),
        log: LogFormat::Text,
        log_queries: false,
        client_timeout: 5,
        upstream_connect_timeout: 2,
        upstream_timeout: 5,
        upstream_pool_capacity: 4,
        max_request_header_size: 16 * 1024,
        max_response_header_size: 16 * 1024,
        max_request_body_size: 64 * 1024,
        cache_max_entry_size: 1024 * 1024,
    }
}

pub struct ProxyHarness {
    pub dirs: TestDirs,
    pub addr: SocketAddr,
    pub settings: Settings,
    handle: JoinHandle<()>,
}

impl ProxyHarness {
    /// Where the store keeps the entry for a request, whether or not it exists yet.
    pub fn entry_path(&self, method: &Method, path: &str, raw_query: &str) -> PathBuf {
        let key = CacheKey::derive(method, path, raw_query);
        self.dirs.cache_dir().join(format!("{}.json", key.as_str()))
    }
}

impl Drop for ProxyHarness {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct ProxyHarnessBuilder {
    dirs: TestDirs,
    origin: String,
    configure: Option<Box<dyn FnOnce(&mut Settings)>>,
}

impl ProxyHarnessBuilder {
    pub fn new(origin: impl Into<String>) -> Result<Self> {
        Ok(Self {
            dirs: TestDirs::new()?,
            origin: origin.into(),
            configure: None,
        })
    }

    pub fn with_dirs(mut self, dirs: TestDirs) -> Self {
        self.dirs = dirs;
        self
    }

    pub fn with_settings(mut self, configure: impl FnOnce(&mut Settings) + 'static) -> Self {
        self.configure = Some(Box::new(configure));
        self
    }

    pub async fn spawn(self) -> Result<ProxyHarness> {
        let mut settings = default_test_settings(&self.origin, &self.dirs);
        if let Some(configure) = self.configure {
            configure(&mut settings);
        }

        let listener = TcpListener::bind(settings.listen).await?;
        let addr = listener.local_addr()?;
        settings.listen = addr;

        let app = cacheproxy::build_app(settings.clone()).await?;
        let handle = tokio::spawn(async move {
            if let Err(err) = cacheproxy::proxy::run_with_listener(app, listener).await {
                tracing::error!(error = ?err, "proxy run failed");
            }
        });

        wait_for_listener(addr).await?;

        Ok(ProxyHarness {
            dirs: self.dirs,
            addr,
            settings,
            handle,
        })
    }
}
