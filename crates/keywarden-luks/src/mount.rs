//! Mounting, file-system creation, and device-mapper naming.

use crate::exec::run_checked;
use keywarden_core::error::{KeywardenError, KeywardenResult};
use keywarden_core::record::FILE_SYSTEM_CHOICES;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

/// Path of the unlocked view of a mapping.
pub fn mapper_path(name: &str) -> PathBuf {
    Path::new("/dev/mapper").join(name)
}

/// Derive a device-mapper name from a device path when the record does not
/// supply one: `/dev/disk/by-id/x-y` becomes `keywarden-x-y`.
pub fn make_mapper_name(device_path: &str) -> String {
    let tail: String = device_path
        .trim_start_matches('/')
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '-'
            }
        })
        .collect();
    format!("keywarden-{tail}")
}

/// Mount `device` at `mount_point`, creating the directory first.
pub fn mount(device: &str, options: &[String], mount_point: &str) -> KeywardenResult<()> {
    fs::create_dir_all(mount_point)?;
    let mut args: Vec<String> = Vec::new();
    if !options.is_empty() {
        args.push("-o".into());
        args.push(options.join(","));
    }
    args.push(device.into());
    args.push(mount_point.into());
    run_checked(&OsString::from("mount"), args, None)?;
    Ok(())
}

pub fn umount(mount_point: &str) -> KeywardenResult<()> {
    run_checked(&OsString::from("umount"), [mount_point], None)?;
    Ok(())
}

/// Create a file system on `device`. Only the small allow-list of types a
/// record may request is accepted.
pub fn mkfs(fstype: &str, device: &str) -> KeywardenResult<()> {
    if !FILE_SYSTEM_CHOICES.contains(&fstype) {
        return Err(KeywardenError::Invalid(format!(
            "unsupported file system `{fstype}` (choose one of {FILE_SYSTEM_CHOICES:?})"
        )));
    }
    let binary = OsString::from(format!("mkfs.{fstype}"));
    // xfs and btrfs refuse to overwrite an existing signature without force.
    let args: Vec<&str> = match fstype {
        "xfs" => vec!["-f", device],
        "btrfs" => vec!["-f", device],
        _ => vec![device],
    };
    run_checked(&binary, args, None)?;
    Ok(())
}
