use std::future::Future;
use std::net::SocketAddr;
use std::thread::JoinHandle;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use crate::core::Model;
use crate::error::{Result, RunnerError};
use crate::format::human_bytes;
use crate::protocol::{read_frame, write_frame};
use crate::session::Session;

/// Requests waiting for the session worker. Connections block on a full
/// queue instead of buffering without bound.
const QUEUE_DEPTH: usize = 64;

struct Job {
    request: Vec<u8>,
    reply: oneshot::Sender<Vec<u8>>,
}

/// Cloneable front door to the one session worker.
///
/// The worker is a dedicated OS thread that owns the `Session` and takes
/// jobs off a channel one at a time, so model steps never run on the async
/// runtime and two requests never touch the session at once.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Job>,
}

impl SessionHandle {
    pub fn spawn<M: Model>(mut session: Session<M>) -> Result<(Self, JoinHandle<()>)> {
        let (tx, mut rx) = mpsc::channel::<Job>(QUEUE_DEPTH);

        let worker = std::thread::Builder::new()
            .name("ssmprov-session".to_string())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    let reply = session.handle(&job.request);
                    if job.reply.send(reply).is_err() {
                        tracing::debug!("client went away before its reply was ready");
                    }
                }
                tracing::info!("session worker stopped");
            })?;

        Ok((Self { tx }, worker))
    }

    /// Queues one request frame and waits for its reply frame.
    pub async fn submit(&self, request: Vec<u8>) -> Result<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Job { request, reply })
            .await
            .map_err(|_| RunnerError::model("session worker is not running"))?;
        rx.await
            .map_err(|_| RunnerError::model("session worker dropped the request"))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub max_frame_bytes: usize,
    /// Serve further frames on the same socket instead of closing after one.
    pub keep_alive: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_frame_bytes: 16 * 1024 * 1024,
            keep_alive: false,
        }
    }
}

pub struct Server {
    listener: TcpListener,
    session: SessionHandle,
    options: ConnectionOptions,
}

impl Server {
    pub async fn bind(addr: &str, session: SessionHandle, options: ConnectionOptions) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(
            "Server listening on {} (frame limit {}, keep-alive {})",
            listener.local_addr()?,
            human_bytes(options.max_frame_bytes as u64),
            options.keep_alive
        );
        Ok(Self {
            listener,
            session,
            options,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accepts connections until `shutdown` resolves. In-flight requests
    /// keep running on the worker; only the accept loop stops.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!("accept failed: {}", e);
                            continue;
                        }
                    };
                    let session = self.session.clone();
                    let options = self.options;
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, session, options).await {
                            tracing::warn!("connection {} dropped: {}", peer, e);
                        }
                    });
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    session: SessionHandle,
    options: ConnectionOptions,
) -> Result<()> {
    tracing::debug!("connection from {}", peer);
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    loop {
        let request = match read_frame(&mut reader, options.max_frame_bytes).await? {
            Some(request) => request,
            None => break,
        };
        tracing::debug!("{} sent {} bytes", peer, request.len());

        let reply = session.submit(request).await?;
        write_frame(&mut write, &reply).await?;

        if !options.keep_alive {
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStore;
    use crate::core::NgramModel;
    use crate::session::TurnLimits;

    #[tokio::test]
    async fn test_handle_serves_requests_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        let session = Session::new(NgramModel::new(b"abcabc", 3), store, TurnLimits::default(), 1);
        let (handle, worker) = SessionHandle::spawn(session).unwrap();

        assert_eq!(handle.submit(b"/t 0.5".to_vec()).await.unwrap(), b"0.5");
        assert_eq!(handle.submit(b"/t".to_vec()).await.unwrap(), b"0.5");
        assert!(handle.submit(Vec::new()).await.unwrap().is_empty());

        drop(handle);
        worker.join().unwrap();
    }
}
