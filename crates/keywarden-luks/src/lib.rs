#![forbid(unsafe_code)]

//! System facade for LUKS-backed volumes.
//!
//! Integrates with the host via:
//! - `cryptsetup` (format/open/close/erase/reencrypt)
//! - `lsblk` for block-device discovery
//! - `mount`/`umount`/`mkfs.*`

mod blockdev;
mod cryptsetup;
mod exec;
mod mount;

pub use blockdev::{
    device_id_of, find_by_device_id, list_block_devices, BlockDevice, LSBLK_SNAPSHOT_ENV,
};
pub use cryptsetup::Cryptsetup;
pub use mount::{make_mapper_name, mapper_path, mkfs, mount, umount};
