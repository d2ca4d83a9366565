//! Block-device discovery via `lsblk`.

use crate::exec::run_checked;
use keywarden_core::error::{KeywardenError, KeywardenResult};
use keywarden_core::record::SERIAL_ID_PREFIX;
use std::env;
use std::ffi::OsString;
use std::fs;

/// Env var pointing at a captured `lsblk -P` snapshot; used by tests and by
/// diagnostics on hosts where lsblk is unavailable.
pub const LSBLK_SNAPSHOT_ENV: &str = "KEYWARDEN_LSBLK_SNAPSHOT";

const LSBLK_COLUMNS: &str = "PATH,TYPE,UUID,SERIAL,FSTYPE,MOUNTPOINT,SIZE";

/// One row of the host block-device table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockDevice {
    pub path: String,
    /// Kernel device type: disk, part, crypt, loop, ...
    pub kernel_type: String,
    pub uuid: String,
    pub serial: String,
    pub fstype: String,
    pub mount_point: String,
    pub size_bytes: u64,
}

impl BlockDevice {
    /// Whether the device carries a LUKS header.
    pub fn is_luks(&self) -> bool {
        self.fstype == "crypto_LUKS"
    }

    /// Whether this row is an unlocked device-mapper view.
    pub fn is_mapper(&self) -> bool {
        self.kernel_type == "crypt"
    }
}

/// Enumerate block devices. Honors [`LSBLK_SNAPSHOT_ENV`].
pub fn list_block_devices() -> KeywardenResult<Vec<BlockDevice>> {
    let payload = match env::var(LSBLK_SNAPSHOT_ENV) {
        Ok(path) => fs::read_to_string(path)?,
        Err(_) => run_checked(
            &OsString::from("lsblk"),
            ["-P", "-b", "-o", LSBLK_COLUMNS],
            None,
        )?,
    };
    Ok(parse_lsblk_pairs(&payload))
}

/// Look a device up by record identifier: a file-system UUID, or
/// `SERIAL:<serial>` for devices without one. When both a raw device and its
/// unlocked mapper carry the identifier, the raw device wins.
pub fn find_by_device_id<'a>(devices: &'a [BlockDevice], id: &str) -> Option<&'a BlockDevice> {
    devices
        .iter()
        .find(|dev| id_matches(dev, id) && !dev.is_mapper())
        .or_else(|| devices.iter().find(|dev| id_matches(dev, id)))
}

fn id_matches(dev: &BlockDevice, id: &str) -> bool {
    match id.strip_prefix(SERIAL_ID_PREFIX) {
        Some(serial) => !dev.serial.is_empty() && dev.serial == serial,
        None => !dev.uuid.is_empty() && dev.uuid == id,
    }
}

/// Record identifier of a device: its UUID, falling back to the serial form.
pub fn device_id_of(dev: &BlockDevice) -> KeywardenResult<String> {
    if !dev.uuid.is_empty() {
        return Ok(dev.uuid.clone());
    }
    if !dev.serial.is_empty() {
        return Ok(format!("{SERIAL_ID_PREFIX}{}", dev.serial));
    }
    Err(KeywardenError::Invalid(format!(
        "device {} has neither a UUID nor a serial number",
        dev.path
    )))
}

/// Parse `lsblk -P` output: one device per line, `KEY="value"` pairs with
/// `\xNN` escapes inside values.
fn parse_lsblk_pairs(payload: &str) -> Vec<BlockDevice> {
    payload
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_pairs_line)
        .collect()
}

fn parse_pairs_line(line: &str) -> BlockDevice {
    let mut dev = BlockDevice::default();
    let mut rest = line.trim();
    while let Some(eq) = rest.find("=\"") {
        let key = rest[..eq].trim().to_string();
        let after = &rest[eq + 2..];
        let Some(end) = after.find('"') else { break };
        let value = unescape_lsblk(&after[..end]);
        match key.as_str() {
            "PATH" => dev.path = value,
            "TYPE" => dev.kernel_type = value,
            "UUID" => dev.uuid = value,
            "SERIAL" => dev.serial = value,
            "FSTYPE" => dev.fstype = value,
            "MOUNTPOINT" => dev.mount_point = value,
            "SIZE" => dev.size_bytes = value.parse().unwrap_or(0),
            _ => {}
        }
        rest = &after[end + 1..];
    }
    dev
}

fn unescape_lsblk(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.peek() {
            Some('x') => {
                chars.next();
                let hi = chars.next();
                let lo = chars.next();
                match (hi, lo) {
                    (Some(hi), Some(lo)) => {
                        let pair = [hi, lo].iter().collect::<String>();
                        match u8::from_str_radix(&pair, 16) {
                            Ok(byte) => out.push(byte as char),
                            Err(_) => {
                                out.push_str("\\x");
                                out.push_str(&pair);
                            }
                        }
                    }
                    _ => out.push_str("\\x"),
                }
            }
            Some('\\') => {
                chars.next();
                out.push('\\');
            }
            _ => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNAPSHOT: &str = concat!(
        "PATH=\"/dev/sda\" TYPE=\"disk\" UUID=\"\" SERIAL=\"3600140585b053f00\" FSTYPE=\"\" MOUNTPOINT=\"\" SIZE=\"512110190592\"\n",
        "PATH=\"/dev/sda1\" TYPE=\"part\" UUID=\"2f3a01f1-5a6c-4a3b-9d11-aa11bb22cc33\" SERIAL=\"\" FSTYPE=\"crypto_LUKS\" MOUNTPOINT=\"\" SIZE=\"511000000000\"\n",
        "PATH=\"/dev/mapper/secure\" TYPE=\"crypt\" UUID=\"9c7a44aa-0b1c-4d88-8f55-dd44ee55ff66\" SERIAL=\"\" FSTYPE=\"ext4\" MOUNTPOINT=\"/srv/data\\x20dir\" SIZE=\"510000000000\"\n",
    );

    #[test]
    fn parses_pairs_output() {
        let devices = parse_lsblk_pairs(SNAPSHOT);
        assert_eq!(devices.len(), 3);

        let part = &devices[1];
        assert_eq!(part.path, "/dev/sda1");
        assert!(part.is_luks());
        assert!(!part.is_mapper());
        assert_eq!(part.size_bytes, 511_000_000_000);

        let mapper = &devices[2];
        assert!(mapper.is_mapper());
        assert_eq!(mapper.mount_point, "/srv/data dir");
    }

    #[test]
    fn lookup_by_uuid_and_serial_prefix() {
        let devices = parse_lsblk_pairs(SNAPSHOT);

        let by_uuid = find_by_device_id(&devices, "2f3a01f1-5a6c-4a3b-9d11-aa11bb22cc33");
        assert_eq!(by_uuid.unwrap().path, "/dev/sda1");

        let by_serial = find_by_device_id(&devices, "SERIAL:3600140585b053f00");
        assert_eq!(by_serial.unwrap().path, "/dev/sda");

        assert!(find_by_device_id(&devices, "no-such-id").is_none());
    }

    #[test]
    fn device_id_prefers_uuid_over_serial() {
        let devices = parse_lsblk_pairs(SNAPSHOT);
        assert_eq!(
            device_id_of(&devices[1]).unwrap(),
            "2f3a01f1-5a6c-4a3b-9d11-aa11bb22cc33"
        );
        assert_eq!(
            device_id_of(&devices[0]).unwrap(),
            "SERIAL:3600140585b053f00"
        );

        let anonymous = BlockDevice {
            path: "/dev/loop0".into(),
            ..BlockDevice::default()
        };
        assert!(device_id_of(&anonymous).is_err());
    }

    #[test]
    fn unescape_handles_hex_and_backslash() {
        assert_eq!(unescape_lsblk("a\\x20b"), "a b");
        assert_eq!(unescape_lsblk("a\\\\b"), "a\\b");
        assert_eq!(unescape_lsblk("plain"), "plain");
        assert_eq!(unescape_lsblk("bad\\xzz"), "bad\\xzz");
    }
}
