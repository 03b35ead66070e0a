mod body;
mod forward;
mod line;
mod request;
mod response;

pub use body::{BodyPlan, ChunkedFrameTracker};
pub use forward::handle_http;
pub use request::{HeaderLine, MalformedRequest, ProxyRequest, RequestHead, read_request_head};
pub use response::{UpstreamResponseHead, read_response_head};

#[cfg(feature = "fuzzing")]
pub mod fuzzing {
    use std::net::SocketAddr;
    use std::time::Duration;

    use anyhow::Result;
    use tokio::io::{AsyncRead, BufReader};

    pub use super::body::ChunkedFrameTracker;

    pub async fn parse_request_head<S>(
        reader: &mut BufReader<S>,
        peer: SocketAddr,
        timeout: Duration,
        max_header_bytes: usize,
    ) -> Result<()>
    where
        S: AsyncRead + Unpin,
    {
        if let Some(head) =
            super::request::read_request_head(reader, timeout, peer, max_header_bytes).await?
        {
            let _ = head.is_get();
            if let Ok(request) = head.resolve() {
                let _ = request.encode_upstream();
                let _ = request.upstream_addr();
            }
        }
        Ok(())
    }

    pub async fn parse_response_head<S>(
        reader: &mut BufReader<S>,
        timeout: Duration,
        peer: SocketAddr,
        max_header_bytes: usize,
    ) -> Result<()>
    where
        S: AsyncRead + Unpin,
    {
        let head =
            super::response::read_response_head(reader, timeout, peer, max_header_bytes).await?;
        let _ = head.body_plan();
        let _ = head.cache_meta();
        Ok(())
    }
}
