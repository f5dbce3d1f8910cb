//! Local stream-socket server and client
//!
//! A client connects, optionally writes one request line (the status
//! section it wants), and reads until the server closes. Clients that send
//! nothing get the full payload once the request window passes.

use crate::error::AgentError;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long the server waits for a request line before answering anyway
pub const REQUEST_WINDOW: Duration = Duration::from_millis(250);

/// Total time a single response may take
pub const RESPONSE_BUDGET: Duration = Duration::from_secs(1);

/// Produces the payload for one connection from its request line
pub type Handler = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Bind `path` and answer connections one at a time until `cancel` fires.
/// The socket file is removed on exit.
#[cfg(unix)]
pub fn serve(
    path: &Path,
    handler: Handler,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>, AgentError> {
    use std::os::unix::fs::PermissionsExt;
    use tokio::net::UnixListener;

    let context = |what: &str| format!("{} diagnostics socket {}", what, path.display());

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AgentError::io(context("creating dir for"), e))?;
        }
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed stale socket file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(AgentError::io(context("removing stale"), e)),
    }

    let listener = UnixListener::bind(path).map_err(|e| AgentError::io(context("binding"), e))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| AgentError::io(context("setting mode on"), e))?;

    info!(path = %path.display(), "Diagnostics socket listening");
    let path = path.to_path_buf();

    Ok(tokio::spawn(async move {
        loop {
            let stream = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Diagnostics accept failed");
                        continue;
                    }
                },
            };

            if timeout(RESPONSE_BUDGET, respond(stream, &handler)).await.is_err() {
                warn!(path = %path.display(), "Diagnostics response exceeded its budget");
            }
        }
        remove_socket(&path);
        debug!(path = %path.display(), "Diagnostics socket closed");
    }))
}

#[cfg(not(unix))]
pub fn serve(
    path: &Path,
    _handler: Handler,
    _cancel: CancellationToken,
) -> Result<JoinHandle<()>, AgentError> {
    Err(AgentError::io(
        format!("binding diagnostics socket {}", path.display()),
        std::io::Error::new(std::io::ErrorKind::Unsupported, "local sockets need a unix host"),
    ))
}

async fn respond<S>(stream: S, handler: &Handler) -> std::io::Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (read, mut write) = tokio::io::split(stream);
    let mut reader = BufReader::new(read);

    let mut request = String::new();
    // A silent client is treated as asking for everything
    match timeout(REQUEST_WINDOW, reader.read_line(&mut request)).await {
        Ok(Ok(_)) | Err(_) => {}
        Ok(Err(e)) => debug!(error = %e, "Could not read diagnostics request"),
    }

    let payload = handler(request.trim());
    write.write_all(payload.as_bytes()).await?;
    write.shutdown().await
}

fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Could not remove socket file");
        }
    }
}

/// Ask `path` for the full payload
pub async fn read_socket(path: &Path) -> Result<Vec<u8>, AgentError> {
    request(path, "").await
}

/// Send `section` as the request line and read the reply to EOF
#[cfg(unix)]
pub async fn request(path: &Path, section: &str) -> Result<Vec<u8>, AgentError> {
    use tokio::net::UnixStream;

    let context = || format!("reading diagnostics socket {}", path.display());
    let exchange = async {
        let mut stream = UnixStream::connect(path).await?;
        stream.write_all(format!("{}\n", section).as_bytes()).await?;
        stream.shutdown().await?;

        let mut body = Vec::new();
        stream.read_to_end(&mut body).await?;
        Ok::<_, std::io::Error>(body)
    };

    match timeout(REQUEST_WINDOW + RESPONSE_BUDGET, exchange).await {
        Ok(result) => result.map_err(|e| AgentError::io(context(), e)),
        Err(_) => Err(AgentError::io(
            context(),
            std::io::Error::new(std::io::ErrorKind::TimedOut, "no reply in time"),
        )),
    }
}

#[cfg(not(unix))]
pub async fn request(path: &Path, _section: &str) -> Result<Vec<u8>, AgentError> {
    Err(AgentError::io(
        format!("reading diagnostics socket {}", path.display()),
        std::io::Error::new(std::io::ErrorKind::Unsupported, "local sockets need a unix host"),
    ))
}
