//! Execution wrapper for invoking `cryptsetup`.
//!
//! Key material is always fed through stdin (`--key-file -`); it never
//! appears on a command line.

use crate::exec::{run_checked, run_success};
use keywarden_core::error::{KeywardenError, KeywardenResult};
use std::env;
use std::path::{Path, PathBuf};

const KNOWN_CRYPTSETUP_PATHS: &[&str] = &[
    "/usr/sbin/cryptsetup",
    "/usr/bin/cryptsetup",
    "/sbin/cryptsetup",
    "/bin/cryptsetup",
    "/usr/local/sbin/cryptsetup",
];

/// Extra headroom `cryptsetup reencrypt` needs to move data during in-place
/// encryption.
const REENCRYPT_RESERVE: &str = "32M";

#[derive(Debug, Clone)]
pub struct Cryptsetup {
    binary: PathBuf,
}

impl Cryptsetup {
    /// Resolve the host `cryptsetup` binary from the usual locations, then
    /// PATH.
    pub fn system() -> KeywardenResult<Self> {
        for candidate in KNOWN_CRYPTSETUP_PATHS {
            let path = Path::new(candidate);
            if path.exists() {
                return Ok(Self {
                    binary: path.to_path_buf(),
                });
            }
        }
        find_in_path("cryptsetup")
            .map(|binary| Self { binary })
            .ok_or_else(|| {
                KeywardenError::Invalid(format!(
                    "unable to locate cryptsetup; tried {KNOWN_CRYPTSETUP_PATHS:?} and PATH"
                ))
            })
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Whether `device` carries a LUKS header. `cryptsetup isLuks` signals
    /// "no" through its exit status, so that case is not an error.
    pub fn is_luks(&self, device: &str) -> KeywardenResult<bool> {
        run_success(self.binary.as_os_str(), ["isLuks", device])
    }

    /// `luksFormat` the device with `key` as the sole key slot.
    pub fn format(&self, device: &str, key: &[u8]) -> KeywardenResult<()> {
        run_checked(
            self.binary.as_os_str(),
            [
                "luksFormat",
                "--batch-mode",
                "--type",
                "luks2",
                "--key-file",
                "-",
                device,
            ],
            Some(key),
        )?;
        Ok(())
    }

    /// Open `device` as `/dev/mapper/<name>`.
    pub fn open(&self, device: &str, name: &str, key: &[u8]) -> KeywardenResult<()> {
        run_checked(
            self.binary.as_os_str(),
            ["open", "--key-file", "-", device, name],
            Some(key),
        )?;
        Ok(())
    }

    pub fn close(&self, name: &str) -> KeywardenResult<()> {
        run_checked(self.binary.as_os_str(), ["close", name], None)?;
        Ok(())
    }

    /// Destroy all key slots on the device, rendering its data irrecoverable.
    pub fn erase(&self, device: &str) -> KeywardenResult<()> {
        run_checked(
            self.binary.as_os_str(),
            ["erase", "--batch-mode", device],
            None,
        )?;
        Ok(())
    }

    /// Stamp a known UUID onto a LUKS header so device discovery by record
    /// identifier keeps working after (re)formatting.
    pub fn set_luks_uuid(&self, device: &str, uuid: &str) -> KeywardenResult<()> {
        run_checked(
            self.binary.as_os_str(),
            ["luksUUID", "--batch-mode", "--uuid", uuid, device],
            None,
        )?;
        Ok(())
    }

    /// Encrypt an existing file system in place. The file system must have
    /// been shrunk (or have room) by the reserve `cryptsetup` moves data
    /// into.
    pub fn reencrypt_inplace(&self, device: &str, key: &[u8]) -> KeywardenResult<()> {
        run_checked(
            self.binary.as_os_str(),
            [
                "reencrypt",
                "--encrypt",
                "--batch-mode",
                "--type",
                "luks2",
                "--reduce-device-size",
                REENCRYPT_RESERVE,
                "--key-file",
                "-",
                device,
            ],
            Some(key),
        )?;
        Ok(())
    }
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(binary);
        if candidate.exists() {
            Some(candidate)
        } else {
            None
        }
    })
}
