use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration as StdDuration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::read_until_double_crlf;

#[derive(Clone)]
enum UpstreamBehavior {
    Close,
    HttpResponse {
        response: Arc<Vec<u8>>,
        delay: Option<StdDuration>,
    },
    /// Builds the response from the received request head.
    Respond(Arc<dyn Fn(&str) -> Vec<u8> + Send + Sync>),
}

/// Origin server stub that counts connections and records request heads.
pub struct TestUpstream {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl TestUpstream {
    pub async fn close() -> Result<Self> {
        Self::spawn(UpstreamBehavior::Close).await
    }

    pub async fn http_response(response: impl Into<Vec<u8>>) -> Result<Self> {
        Self::spawn(UpstreamBehavior::HttpResponse {
            response: Arc::new(response.into()),
            delay: None,
        })
        .await
    }

    pub async fn delayed_response(response: impl Into<Vec<u8>>, delay: StdDuration) -> Result<Self> {
        Self::spawn(UpstreamBehavior::HttpResponse {
            response: Arc::new(response.into()),
            delay: Some(delay),
        })
        .await
    }

    pub async fn respond_with<F>(respond: F) -> Result<Self>
    where
        F: Fn(&str) -> Vec<u8> + Send + Sync + 'static,
    {
        Self::spawn(UpstreamBehavior::Respond(Arc::new(respond))).await
    }

    pub async fn http_ok(body: &str) -> Result<Self> {
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        Self::http_response(response.into_bytes()).await
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    async fn spawn(behavior: UpstreamBehavior) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handle = {
            let hits = hits.clone();
            let requests = requests.clone();
            tokio::spawn(async move {
                loop {
                    let (mut stream, _) = match listener.accept().await {
                        Ok(conn) => conn,
                        Err(_) => break,
                    };
                    hits.fetch_add(1, Ordering::SeqCst);
                    let behavior = behavior.clone();
                    let requests = requests.clone();
                    tokio::spawn(async move {
                        let _ = handle_connection(&mut stream, behavior, requests).await;
                    });
                }
            })
        };
        Ok(Self {
            addr,
            hits,
            requests,
            handle,
        })
    }
}

impl Drop for TestUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Address nothing listens on.
pub fn unused_addr() -> Result<SocketAddr> {
    let port = super::find_free_port()?;
    Ok(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
}

async fn handle_connection(
    stream: &mut TcpStream,
    behavior: UpstreamBehavior,
    requests: Arc<Mutex<Vec<String>>>,
) -> Result<()> {
    match behavior {
        UpstreamBehavior::Close => {
            stream.shutdown().await.ok();
        }
        UpstreamBehavior::HttpResponse { response, delay } => {
            let head = read_until_double_crlf(stream).await?;
            requests.lock().push(head);
            if let Some(delay) = delay {
                sleep(delay).await;
            }
            stream.write_all(&response).await?;
            stream.shutdown().await.ok();
        }
        UpstreamBehavior::Respond(respond) => {
            let head = read_until_double_crlf(stream).await?;
            let response = respond(&head);
            requests.lock().push(head);
            stream.write_all(&response).await?;
            stream.shutdown().await.ok();
        }
    }
    Ok(())
}
