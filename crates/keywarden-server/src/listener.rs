//! The two accept loops: TLS TCP for clients, unix socket for operators.
//!
//! Each connection is handled on its own task: read one request frame,
//! dispatch into the service, write one response frame, repeat until the
//! peer hangs up. Request errors are answered, never fatal to the loop.

use crate::service::{KeyService, Peer};
use crate::tls::peer_identity;
use keywarden_core::error::{KeywardenError, KeywardenResult};
use keywarden_core::keydb::RecordStore;
use keywarden_proto::{read_frame_async, write_frame_async, Request, Response};
use log::{debug, info, warn};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Accept TLS client connections until `shutdown` flips.
pub async fn serve_tcp<S>(
    service: Arc<KeyService<S>>,
    listener: TcpListener,
    acceptor: TlsAcceptor,
    mut shutdown: watch::Receiver<bool>,
) -> KeywardenResult<()>
where
    S: RecordStore + 'static,
{
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!("TCP accept failed: {err}");
                        continue;
                    }
                };
                let service = service.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let ip = addr.ip().to_string();
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            let identity = {
                                let (_, conn) = tls_stream.get_ref();
                                conn.peer_certificates().and_then(peer_identity)
                            };
                            let peer = Peer::tls(ip.clone(), identity);
                            if let Err(err) = serve_connection(service, tls_stream, peer).await {
                                debug!("connection from {ip} ended: {err}");
                            }
                        }
                        Err(err) => warn!("TLS handshake with {ip} failed: {err}"),
                    }
                });
            }
            _ = shutdown.changed() => {
                info!("TCP listener shutting down");
                return Ok(());
            }
        }
    }
}

/// Accept privileged operator connections on the local socket.
pub async fn serve_unix<S>(
    service: Arc<KeyService<S>>,
    listener: UnixListener,
    mut shutdown: watch::Receiver<bool>,
) -> KeywardenResult<()>
where
    S: RecordStore + 'static,
{
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!("operator socket accept failed: {err}");
                        continue;
                    }
                };
                let service = service.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_connection(service, stream, Peer::local()).await {
                        debug!("operator connection ended: {err}");
                    }
                });
            }
            _ = shutdown.changed() => {
                info!("operator socket shutting down");
                return Ok(());
            }
        }
    }
}

/// Bind the operator socket, replacing a stale one, permissioned to the
/// service user only.
pub fn bind_operator_socket(path: &Path) -> KeywardenResult<UnixListener> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
        #[cfg(unix)]
        fs::set_permissions(parent, fs::Permissions::from_mode(0o700))?;
    }
    match fs::remove_file(path) {
        Ok(()) => debug!("removed stale operator socket {}", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(KeywardenError::Io(err)),
    }
    let listener = UnixListener::bind(path)?;
    #[cfg(unix)]
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

async fn serve_connection<S, T>(
    service: Arc<KeyService<S>>,
    mut stream: T,
    peer: Peer,
) -> KeywardenResult<()>
where
    S: RecordStore,
    T: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let request: Request = match read_frame_async(&mut stream).await {
            Ok(request) => request,
            // A clean disconnect between calls is the normal end of life.
            Err(KeywardenError::Io(err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                return Ok(())
            }
            Err(err) => return Err(err),
        };
        let response: Response = service.handle(&peer, request);
        write_frame_async(&mut stream, &response).await?;
    }
}
