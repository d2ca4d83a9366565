//! Typed, connection-per-call RPC client.
//!
//! Every call dials, writes one request frame, reads one response frame, and
//! drops the connection. The workload is a few calls per minute per host, so
//! the handshake cost is irrelevant and pooling is not worth its failure
//! modes.

use keywarden_core::config::{ClientConfig, SOCKET_PATH};
use keywarden_core::error::{KeywardenError, KeywardenResult};
use keywarden_core::record::{PendingCommand, Record};
use keywarden_proto::{
    read_frame, write_frame, CreateKeyRequest, Request, Response, RetrieveResponse,
};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConnection, RootCertStore, StreamOwned};
use std::fs;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Socket timeout applied to every outbound call.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

enum Endpoint {
    Tls {
        host: String,
        port: u16,
        tls: Arc<rustls::ClientConfig>,
        server_name: ServerName<'static>,
    },
    Unix {
        path: PathBuf,
    },
}

/// Handle to the key server. Cheap to clone behind an `Arc`; holds no open
/// connection.
pub struct KeyClient {
    endpoint: Endpoint,
}

impl KeyClient {
    /// TLS client towards the configured key server. The CA bundle is
    /// mandatory; deployments run on a self-signed CA generated at
    /// `init-server` time.
    pub fn from_client_config(config: &ClientConfig) -> KeywardenResult<Self> {
        let ca_path = config.tls_ca.as_deref().ok_or_else(|| {
            KeywardenError::Invalid("TLS_CA is required to reach the key server".into())
        })?;

        let mut roots = RootCertStore::empty();
        for cert in load_pem_certs(ca_path)? {
            roots.add(cert).map_err(|err| {
                KeywardenError::Invalid(format!(
                    "bad CA certificate in {}: {err}",
                    ca_path.display()
                ))
            })?;
        }

        let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
        let tls = match (&config.tls_cert, &config.tls_key) {
            (Some(cert_path), Some(key_path)) => {
                let certs = load_pem_certs(cert_path)?;
                let key = load_pem_private_key(key_path)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|err| {
                        KeywardenError::Invalid(format!("client identity rejected: {err}"))
                    })?
            }
            _ => builder.with_no_client_auth(),
        };

        let server_name = ServerName::try_from(config.verification_name().to_string())
            .map_err(|err| {
                KeywardenError::Invalid(format!(
                    "`{}` is not a valid server name: {err}",
                    config.verification_name()
                ))
            })?;

        Ok(KeyClient {
            endpoint: Endpoint::Tls {
                host: config.server_host.clone(),
                port: config.server_port,
                tls: Arc::new(tls),
                server_name,
            },
        })
    }

    /// Client for the privileged operator socket on the server host.
    pub fn over_unix(path: impl Into<PathBuf>) -> Self {
        KeyClient {
            endpoint: Endpoint::Unix { path: path.into() },
        }
    }

    /// Operator socket at its well-known path.
    pub fn over_local_socket() -> Self {
        Self::over_unix(SOCKET_PATH)
    }

    fn call(&self, request: &Request) -> KeywardenResult<Response> {
        match &self.endpoint {
            Endpoint::Tls {
                host,
                port,
                tls,
                server_name,
            } => {
                let addr = (host.as_str(), *port)
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| {
                        KeywardenError::Rpc(format!("{host}:{port} did not resolve"))
                    })?;
                let socket = TcpStream::connect_timeout(&addr, CALL_TIMEOUT)?;
                socket.set_read_timeout(Some(CALL_TIMEOUT))?;
                socket.set_write_timeout(Some(CALL_TIMEOUT))?;
                let conn = ClientConnection::new(tls.clone(), server_name.clone())
                    .map_err(|err| KeywardenError::Rpc(format!("TLS setup failed: {err}")))?;
                let mut stream = StreamOwned::new(conn, socket);
                exchange(&mut stream, request)
            }
            Endpoint::Unix { path } => {
                let mut stream = UnixStream::connect(path)?;
                stream.set_read_timeout(Some(CALL_TIMEOUT))?;
                stream.set_write_timeout(Some(CALL_TIMEOUT))?;
                exchange(&mut stream, request)
            }
        }
    }

    pub fn ping(&self, password: Option<&str>) -> KeywardenResult<()> {
        match self.call(&Request::Ping {
            password: password.map(str::to_string),
        })? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub fn create_key(&self, request: CreateKeyRequest) -> KeywardenResult<Record> {
        match self.call(&Request::CreateKey(request))? {
            Response::Created { record } => Ok(record),
            other => Err(unexpected(other)),
        }
    }

    pub fn auto_retrieve(
        &self,
        hostname: &str,
        uuids: &[String],
    ) -> KeywardenResult<RetrieveResponse> {
        match self.call(&Request::AutoRetrieve {
            hostname: hostname.to_string(),
            uuids: uuids.to_vec(),
        })? {
            Response::Retrieved(resp) => Ok(resp),
            other => Err(unexpected(other)),
        }
    }

    pub fn manual_retrieve(
        &self,
        hostname: &str,
        uuids: &[String],
        password: &str,
    ) -> KeywardenResult<RetrieveResponse> {
        match self.call(&Request::ManualRetrieve {
            hostname: hostname.to_string(),
            uuids: uuids.to_vec(),
            password: password.to_string(),
        })? {
            Response::Retrieved(resp) => Ok(resp),
            other => Err(unexpected(other)),
        }
    }

    /// Returns the UUIDs the server rejected for this host.
    pub fn report_alive(&self, hostname: &str, uuids: &[String]) -> KeywardenResult<Vec<String>> {
        match self.call(&Request::ReportAlive {
            hostname: hostname.to_string(),
            uuids: uuids.to_vec(),
        })? {
            Response::Alive { rejected } => Ok(rejected),
            other => Err(unexpected(other)),
        }
    }

    pub fn erase_key(&self, uuid: &str, hostname: &str, password: &str) -> KeywardenResult<()> {
        match self.call(&Request::EraseKey {
            uuid: uuid.to_string(),
            hostname: hostname.to_string(),
            password: password.to_string(),
        })? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub fn poll_command(
        &self,
        uuid: &str,
        hostname: &str,
    ) -> KeywardenResult<Option<PendingCommand>> {
        match self.call(&Request::PollCommand {
            uuid: uuid.to_string(),
            hostname: hostname.to_string(),
        })? {
            Response::Command { command } => Ok(command),
            other => Err(unexpected(other)),
        }
    }

    pub fn save_result(&self, uuid: &str, command_id: u64, text: &str) -> KeywardenResult<()> {
        match self.call(&Request::SaveResult {
            uuid: uuid.to_string(),
            command_id,
            text: text.to_string(),
        })? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub fn reload_record(&self, uuid: &str, password: &str) -> KeywardenResult<()> {
        match self.call(&Request::ReloadRecord {
            uuid: uuid.to_string(),
            password: password.to_string(),
        })? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn exchange<T: Read + Write>(stream: &mut T, request: &Request) -> KeywardenResult<Response> {
    write_frame(&mut *stream, request)?;
    let response: Response = read_frame(stream)?;
    if let Response::Error(err) = response {
        return Err(err.into());
    }
    Ok(response)
}

fn unexpected(response: Response) -> KeywardenError {
    KeywardenError::Rpc(format!("unexpected response variant: {response:?}"))
}

fn load_pem_certs(path: &Path) -> KeywardenResult<Vec<CertificateDer<'static>>> {
    let pem = fs::read(path)?;
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut pem.as_slice()).collect();
    let certs = certs.map_err(KeywardenError::Io)?;
    if certs.is_empty() {
        return Err(KeywardenError::Invalid(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_pem_private_key(
    path: &Path,
) -> KeywardenResult<rustls::pki_types::PrivateKeyDer<'static>> {
    let pem = fs::read(path)?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(KeywardenError::Io)?
        .ok_or_else(|| {
            KeywardenError::Invalid(format!("no private key found in {}", path.display()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use keywarden_core::sysconfig::Sysconfig;

    #[test]
    fn tls_client_requires_a_ca_bundle() {
        let mut sysconfig = Sysconfig::default();
        sysconfig.set("KEY_SERVER_HOST", "keys.example.com");
        let config = ClientConfig::from_sysconfig(&sysconfig).unwrap();
        assert!(matches!(
            KeyClient::from_client_config(&config),
            Err(KeywardenError::Invalid(_))
        ));
    }

    #[test]
    fn unix_client_surfaces_dial_errors() {
        let client = KeyClient::over_unix("/nonexistent/keywarden.sock");
        assert!(client.ping(None).is_err());
    }
}
