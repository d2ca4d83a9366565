//! Typed views over the server and client sysconfig files.

use crate::error::{KeywardenError, KeywardenResult};
use crate::secret::{HASH_LEN, SALT_LEN};
use crate::sysconfig::Sysconfig;
use std::path::PathBuf;

pub const SERVER_CONFIG_PATH: &str = "/etc/sysconfig/keywarden-server";
pub const CLIENT_CONFIG_PATH: &str = "/etc/sysconfig/keywarden";

/// Well-known path of the privileged operator socket.
pub const SOCKET_PATH: &str = "/run/keywarden/keywarden.sock";

pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_LISTEN_PORT: u16 = 3737;
pub const DEFAULT_KEYDB_DIR: &str = "/var/lib/keywarden/keydb";
pub const DEFAULT_CERT_DIR: &str = "/var/lib/keywarden/certs";

// Server sysconfig keys.
pub const CFG_PASSWORD_HASH: &str = "PASSWORD_HASH";
pub const CFG_PASSWORD_SALT: &str = "PASSWORD_SALT";
pub const CFG_LISTEN_ADDRESS: &str = "LISTEN_ADDRESS";
pub const CFG_LISTEN_PORT: &str = "LISTEN_PORT";
pub const CFG_TLS_CERT: &str = "TLS_CERT";
pub const CFG_TLS_KEY: &str = "TLS_KEY";
pub const CFG_TLS_VALIDATE_CLIENT: &str = "TLS_VALIDATE_CLIENT";
pub const CFG_TLS_CA: &str = "TLS_CA";
pub const CFG_KEYDB_DIR: &str = "KEYDB_DIR";
pub const CFG_CERT_DIR: &str = "CERT_DIR";
pub const CFG_KMIP_SERVER_ADDRS: &str = "KMIP_SERVER_ADDRS";
pub const CFG_KMIP_USER: &str = "KMIP_USER";
pub const CFG_KMIP_PASS: &str = "KMIP_PASS";
pub const CFG_KMIP_TLS_CA: &str = "KMIP_TLS_CA";
pub const CFG_KMIP_TLS_CERT: &str = "KMIP_TLS_CERT";
pub const CFG_KMIP_TLS_KEY: &str = "KMIP_TLS_KEY";

// Client sysconfig keys.
pub const CFG_KEY_SERVER_HOST: &str = "KEY_SERVER_HOST";
pub const CFG_KEY_SERVER_PORT: &str = "KEY_SERVER_PORT";
pub const CFG_CLIENT_TLS_CA: &str = "TLS_CA";
pub const CFG_CLIENT_TLS_CERT: &str = "TLS_CERT";
pub const CFG_CLIENT_TLS_KEY: &str = "TLS_KEY";
pub const CFG_CLIENT_TLS_DOMAIN: &str = "TLS_DOMAIN_NAME";

/// Connection details for an external KMIP vault. The vault adapter itself
/// ships separately; this build keeps key material in the directory store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmipConfig {
    pub server_addrs: Vec<String>,
    pub username: String,
    pub password: String,
    pub tls_ca: Option<PathBuf>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

/// Validated server configuration snapshot.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// PBKDF2 hash of the access password; empty until `init-server` ran.
    pub password_hash: Vec<u8>,
    pub password_salt: Vec<u8>,
    pub listen_address: String,
    pub listen_port: u16,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub tls_validate_client: bool,
    pub tls_ca: Option<PathBuf>,
    pub keydb_dir: PathBuf,
    pub cert_dir: PathBuf,
    pub kmip: Option<KmipConfig>,
}

impl ServerConfig {
    pub fn from_sysconfig(cfg: &Sysconfig) -> KeywardenResult<Self> {
        let password_hash = decode_hex_field(cfg, CFG_PASSWORD_HASH, HASH_LEN)?;
        let password_salt = decode_hex_field(cfg, CFG_PASSWORD_SALT, SALT_LEN)?;
        if password_hash.is_empty() != password_salt.is_empty() {
            return Err(KeywardenError::Invalid(format!(
                "{CFG_PASSWORD_HASH} and {CFG_PASSWORD_SALT} must be set together"
            )));
        }

        let kmip_addrs = cfg.get_str_list(CFG_KMIP_SERVER_ADDRS);
        let kmip = if kmip_addrs.is_empty() {
            None
        } else {
            Some(KmipConfig {
                server_addrs: kmip_addrs,
                username: cfg.get_str(CFG_KMIP_USER, ""),
                password: cfg.get_str(CFG_KMIP_PASS, ""),
                tls_ca: optional_path(cfg, CFG_KMIP_TLS_CA),
                tls_cert: optional_path(cfg, CFG_KMIP_TLS_CERT),
                tls_key: optional_path(cfg, CFG_KMIP_TLS_KEY),
            })
        };

        let config = ServerConfig {
            password_hash,
            password_salt,
            listen_address: cfg.get_str(CFG_LISTEN_ADDRESS, DEFAULT_LISTEN_ADDRESS),
            listen_port: cfg.get_int(CFG_LISTEN_PORT, DEFAULT_LISTEN_PORT),
            tls_cert: optional_path(cfg, CFG_TLS_CERT),
            tls_key: optional_path(cfg, CFG_TLS_KEY),
            tls_validate_client: cfg.get_bool(CFG_TLS_VALIDATE_CLIENT, false),
            tls_ca: optional_path(cfg, CFG_TLS_CA),
            keydb_dir: PathBuf::from(cfg.get_str(CFG_KEYDB_DIR, DEFAULT_KEYDB_DIR)),
            cert_dir: PathBuf::from(cfg.get_str(CFG_CERT_DIR, DEFAULT_CERT_DIR)),
            kmip,
        };

        if config.tls_validate_client && config.tls_ca.is_none() {
            return Err(KeywardenError::Invalid(format!(
                "{CFG_TLS_VALIDATE_CLIENT} is enabled but {CFG_TLS_CA} is not set"
            )));
        }

        Ok(config)
    }

    /// Whether `init-server` has stored an access password yet.
    pub fn is_initialised(&self) -> bool {
        !self.password_hash.is_empty()
    }
}

/// Validated client configuration snapshot.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_host: String,
    pub server_port: u16,
    pub tls_ca: Option<PathBuf>,
    /// Client certificate presented for mTLS, with its key.
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Host name to verify the server certificate against; defaults to
    /// `server_host`.
    pub tls_domain_name: Option<String>,
}

impl ClientConfig {
    pub fn from_sysconfig(cfg: &Sysconfig) -> KeywardenResult<Self> {
        let server_host = cfg.get_str(CFG_KEY_SERVER_HOST, "");
        if server_host.is_empty() {
            return Err(KeywardenError::Invalid(format!(
                "{CFG_KEY_SERVER_HOST} is not configured"
            )));
        }
        let tls_cert = optional_path(cfg, CFG_CLIENT_TLS_CERT);
        let tls_key = optional_path(cfg, CFG_CLIENT_TLS_KEY);
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(KeywardenError::Invalid(format!(
                "{CFG_CLIENT_TLS_CERT} and {CFG_CLIENT_TLS_KEY} must be set together"
            )));
        }
        Ok(ClientConfig {
            server_host,
            server_port: cfg.get_int(CFG_KEY_SERVER_PORT, DEFAULT_LISTEN_PORT),
            tls_ca: optional_path(cfg, CFG_CLIENT_TLS_CA),
            tls_cert,
            tls_key,
            tls_domain_name: non_empty(cfg.get_str(CFG_CLIENT_TLS_DOMAIN, "")),
        })
    }

    pub fn verification_name(&self) -> &str {
        self.tls_domain_name.as_deref().unwrap_or(&self.server_host)
    }
}

fn optional_path(cfg: &Sysconfig, key: &str) -> Option<PathBuf> {
    non_empty(cfg.get_str(key, "")).map(PathBuf::from)
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn decode_hex_field(cfg: &Sysconfig, key: &str, expect_len: usize) -> KeywardenResult<Vec<u8>> {
    let raw = cfg.get_str(key, "");
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    let bytes = hex::decode(raw.trim())
        .map_err(|err| KeywardenError::Invalid(format!("{key} is not valid hex: {err}")))?;
    if bytes.len() != expect_len {
        return Err(KeywardenError::Invalid(format!(
            "{key} must decode to {expect_len} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}
