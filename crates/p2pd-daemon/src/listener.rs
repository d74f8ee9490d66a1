//! Connection acceptor. Binds the control endpoint and spawns one
//! dispatcher task per client connection.

use crate::dispatcher::Dispatcher;
use crate::endpoint::Endpoint;
use crate::error::{DaemonError, DaemonResult};
use p2pd_host::PeerStream;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

enum ControlListener {
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
    Tcp(TcpListener),
}

impl ControlListener {
    async fn accept(&self) -> std::io::Result<PeerStream> {
        match self {
            #[cfg(unix)]
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// A running control endpoint.
pub struct Daemon {
    endpoint: Endpoint,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl Daemon {
    /// Bind `endpoint` and start accepting connections.
    pub async fn start(endpoint: &Endpoint, dispatcher: Dispatcher) -> DaemonResult<Self> {
        let (listener, bound) = bind(endpoint).await?;
        info!(endpoint = %bound, "Control endpoint listening");

        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(accept_loop(
            listener,
            bound.clone(),
            dispatcher,
            shutdown.clone(),
        ));
        Ok(Self {
            endpoint: bound,
            shutdown,
            task,
        })
    }

    /// The bound endpoint. For TCP port 0 this carries the assigned port.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Stop accepting connections and remove the Unix socket file.
    ///
    /// Connections already accepted keep running until their clients close.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Accept loop ended abnormally");
        }
    }
}

async fn accept_loop(
    listener: ControlListener,
    endpoint: Endpoint,
    dispatcher: Dispatcher,
    shutdown: Arc<Notify>,
) {
    let mut next_id: u64 = 0;
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            accepted = listener.accept() => match accepted {
                Ok(io) => {
                    next_id += 1;
                    let dispatcher = dispatcher.clone();
                    let span = tracing::debug_span!("conn", id = next_id);
                    tokio::spawn(
                        async move {
                            debug!("Client connected");
                            dispatcher.serve(io).await;
                            debug!("Connection finished");
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
    drop(listener);
    cleanup(&endpoint);
    info!(endpoint = %endpoint, "Control endpoint closed");
}

async fn bind(endpoint: &Endpoint) -> DaemonResult<(ControlListener, Endpoint)> {
    let bind_error = |reason: String| DaemonError::Bind {
        addr: endpoint.to_string(),
        reason,
    };
    match endpoint {
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            clear_stale_socket(path).await.map_err(bind_error)?;
            let listener =
                tokio::net::UnixListener::bind(path).map_err(|e| bind_error(e.to_string()))?;
            Ok((ControlListener::Unix(listener), endpoint.clone()))
        }
        #[cfg(not(unix))]
        Endpoint::Unix(_) => Err(bind_error(
            "unix sockets are not supported on this platform".into(),
        )),
        Endpoint::Tcp(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| bind_error(e.to_string()))?;
            let local = listener
                .local_addr()
                .map_err(|e| bind_error(e.to_string()))?;
            Ok((ControlListener::Tcp(listener), Endpoint::Tcp(local)))
        }
    }
}

/// Remove a socket file left behind by a daemon that is no longer running.
///
/// A live socket or a path that is not a socket is refused.
#[cfg(unix)]
async fn clear_stale_socket(path: &std::path::Path) -> Result<(), String> {
    use std::os::unix::fs::FileTypeExt;

    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.to_string()),
    };
    if !metadata.file_type().is_socket() {
        return Err(format!("{} exists and is not a socket", path.display()));
    }
    match tokio::net::UnixStream::connect(path).await {
        Ok(_) => Err(format!("{} is in use by a running daemon", path.display())),
        Err(e)
            if e.kind() == std::io::ErrorKind::ConnectionRefused
                || e.kind() == std::io::ErrorKind::NotFound =>
        {
            info!(path = %path.display(), "Removing stale control socket");
            std::fs::remove_file(path).map_err(|e| e.to_string())
        }
        Err(e) => Err(e.to_string()),
    }
}

fn cleanup(endpoint: &Endpoint) {
    let Endpoint::Unix(path) = endpoint else {
        return;
    };
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(error = %e, path = %path.display(), "Failed to remove control socket");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p2pd.sock");
        // A bound-then-dropped std listener leaves its file behind.
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        clear_stale_socket(&path).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_live_socket_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p2pd.sock");
        let _live = tokio::net::UnixListener::bind(&path).unwrap();

        let err = clear_stale_socket(&path).await.unwrap_err();
        assert!(err.contains("in use"));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_regular_file_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p2pd.sock");
        std::fs::write(&path, b"not a socket").unwrap();

        let err = clear_stale_socket(&path).await.unwrap_err();
        assert!(err.contains("not a socket"));
    }
}
