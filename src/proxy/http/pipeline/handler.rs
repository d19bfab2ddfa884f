use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

use crate::logging::AccessLogBuilder;
use crate::proxy::{
    AppContext,
    cache::{CacheEntry, CacheKey, Disposition},
    forward_limits::RequestLogTracker,
    request::ParsedRequest,
    request_pipeline::RequestHandler,
};

use super::ClientDisposition;
use super::forward::forward_and_respond;
use super::hit::serve_hit;

use super::super::body::BodyPlan;
use super::super::codec::Http1HeaderAccumulator;
use super::super::forward::CapturePlan;

pub(super) struct Http1RequestHandler<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub(super) reader: &'a mut BufReader<S>,
    pub(super) app: &'a AppContext,
    pub(super) headers: Http1HeaderAccumulator,
    pub(super) body_plan: BodyPlan,
    pub(super) close_requested: bool,
    pub(super) log_tracker: RequestLogTracker,
    pub(super) peer: SocketAddr,
    pub(super) parsed: &'a ParsedRequest,
    pub(super) expect_continue: bool,
}

impl<S> Http1RequestHandler<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub(super) fn access_log(&self) -> AccessLogBuilder {
        self.parsed
            .access_log_builder(self.peer, self.app.settings.log_queries)
    }
}

#[async_trait]
impl<'a, S> RequestHandler for Http1RequestHandler<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    type Output = ClientDisposition;

    async fn on_hit(&mut self, _key: CacheKey, entry: CacheEntry) -> Result<Self::Output> {
        serve_hit(self, entry).await
    }

    async fn on_miss(&mut self, key: CacheKey) -> Result<Self::Output> {
        forward_and_respond(self, CapturePlan::Capture(key), Disposition::Miss).await
    }

    async fn on_skip(&mut self) -> Result<Self::Output> {
        forward_and_respond(self, CapturePlan::Bypass, Disposition::Skip).await
    }
}
