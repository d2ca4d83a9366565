#![forbid(unsafe_code)]

//! Client side of the key service: typed RPC calls plus the long-running
//! control loops (auto-unlock retry, alive reporting, command polling) and
//! the encrypt/unlock/erase orchestration around `cryptsetup`.

pub mod daemon;
pub mod retry;
pub mod routines;
pub mod rpc;

pub use daemon::{run_client_daemon, AliveExit};
pub use retry::FailureLog;
pub use routines::{
    auto_online_unlock, encrypt_device, erase_volume, lock_volume, offline_unlock, online_unlock,
    unlock_volume, EncryptMode, EncryptOptions, OnlineUnlockSummary, UnlockReport,
};
pub use rpc::KeyClient;
