use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::util::timeout_with_context;

pub async fn write_all_with_timeout<W>(
    writer: &mut W,
    bytes: &[u8],
    timeout_dur: Duration,
    context: &str,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    timeout_with_context(timeout_dur, writer.write_all(bytes), context).await
}
