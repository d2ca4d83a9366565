//! Request and response types for the key service protocol.

use keywarden_core::error::KeywardenError;
use keywarden_core::record::{PendingCommand, Record};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Parameters of a `CreateKey` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateKeyRequest {
    pub uuid: String,
    pub hostname: String,
    pub mapped_name: String,
    pub mount_point: String,
    pub mount_options: Vec<String>,
    pub max_active: u32,
    pub allowed_clients: BTreeSet<String>,
    pub auto_encryption: bool,
    pub file_system: String,
    pub password: String,
}

/// All calls a client or operator can make.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Credential check. Callers without a password must arrive over an
    /// authenticated transport (client certificate or the operator socket).
    Ping { password: Option<String> },
    CreateKey(CreateKeyRequest),
    AutoRetrieve {
        hostname: String,
        uuids: Vec<String>,
    },
    ManualRetrieve {
        hostname: String,
        uuids: Vec<String>,
        password: String,
    },
    ReportAlive {
        hostname: String,
        uuids: Vec<String>,
    },
    EraseKey {
        uuid: String,
        hostname: String,
        password: String,
    },
    PollCommand {
        uuid: String,
        hostname: String,
    },
    SaveResult {
        uuid: String,
        command_id: u64,
        text: String,
    },
    /// Operator-only: re-read one record from disk.
    ReloadRecord {
        uuid: String,
        password: String,
    },
}

/// Per-UUID outcome of a retrieval call. The three parts form a disjoint
/// union of the requested UUID set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrieveResponse {
    /// Granted records, including the volume key.
    pub granted: BTreeMap<String, Record>,
    pub rejected: Vec<String>,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Created { record: Record },
    Retrieved(RetrieveResponse),
    Alive { rejected: Vec<String> },
    Command { command: Option<PendingCommand> },
    Error(RpcError),
}

/// Error taxonomy carried over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcErrorKind {
    Auth,
    Access,
    NotFound,
    Conflict,
    Invalid,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct RpcError {
    pub kind: RpcErrorKind,
    pub message: String,
}

impl From<&KeywardenError> for RpcError {
    fn from(err: &KeywardenError) -> Self {
        let kind = match err {
            KeywardenError::Auth(_) => RpcErrorKind::Auth,
            KeywardenError::Access(_) => RpcErrorKind::Access,
            KeywardenError::NotFound(_) => RpcErrorKind::NotFound,
            KeywardenError::Conflict(_) => RpcErrorKind::Conflict,
            KeywardenError::Invalid(_) => RpcErrorKind::Invalid,
            KeywardenError::Io(_) | KeywardenError::Rpc(_) => RpcErrorKind::Internal,
        };
        RpcError {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<RpcError> for KeywardenError {
    fn from(err: RpcError) -> Self {
        match err.kind {
            RpcErrorKind::Auth => KeywardenError::Auth(err.message),
            RpcErrorKind::Access => KeywardenError::Access(err.message),
            RpcErrorKind::NotFound => KeywardenError::NotFound(err.message),
            RpcErrorKind::Conflict => KeywardenError::Conflict(err.message),
            RpcErrorKind::Invalid => KeywardenError::Invalid(err.message),
            RpcErrorKind::Internal => KeywardenError::Rpc(err.message),
        }
    }
}
