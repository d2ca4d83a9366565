//! Volume orchestration: unlock state machine, auto-unlock retry, encrypt,
//! erase, and the online/offline unlock entry points.

use crate::retry::{FailureLog, FailureVerdict};
use crate::rpc::KeyClient;
use keywarden_core::error::{KeywardenError, KeywardenResult};
use keywarden_core::host::{hostname_and_ip, unix_now};
use keywarden_core::record::Record;
use keywarden_luks::{
    device_id_of, find_by_device_id, list_block_devices, make_mapper_name, mapper_path, mkfs,
    mount, umount, BlockDevice, Cryptsetup,
};
use keywarden_proto::CreateKeyRequest;
use log::{info, warn};
use std::collections::BTreeSet;
use std::path::Path;
use std::thread;
use std::time::Duration;

/// Pause between auto-unlock attempts.
pub const AUTO_UNLOCK_RETRY_INTERVAL_SEC: u64 = 5;
/// How long auto-unlock keeps retrying by default (24 hours).
pub const DEFAULT_MAX_RETRY_SEC: i64 = 86_400;
/// Pause between attempts of the unlock state machine, to ride out udev and
/// blkid races.
const UNLOCK_ATTEMPT_PAUSE: Duration = Duration::from_secs(1);

/// Outcome of a successful run of the unlock state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockReport {
    pub mapper_name: String,
    pub mounted: bool,
    /// The device was LUKS-formatted on this run (auto-encryption).
    pub formatted: bool,
}

/// Drive one volume from discovered to opened to mounted.
///
/// Each transition is retried up to `max_attempts` times with a short pause;
/// a mapping or mount left behind by an earlier run is picked up rather than
/// recreated.
pub fn unlock_volume(rec: &Record, max_attempts: u32) -> KeywardenResult<UnlockReport> {
    let devices = list_block_devices()?;
    let dev = find_by_device_id(&devices, &rec.uuid)
        .ok_or_else(|| {
            KeywardenError::NotFound(format!("no block device matches {}", rec.uuid))
        })?
        .clone();

    let cryptsetup = Cryptsetup::system()?;
    let mapper_name = if rec.mapped_name.is_empty() {
        make_mapper_name(&dev.path)
    } else {
        rec.mapped_name.clone()
    };

    let mut formatted = false;
    if !cryptsetup.is_luks(&dev.path)? {
        if !rec.auto_encryption {
            return Err(KeywardenError::Invalid(format!(
                "device {} ({}) is not LUKS formatted and auto encryption is off",
                dev.path, rec.uuid
            )));
        }
        info!("auto-encrypting {} for {}", dev.path, rec.uuid);
        cryptsetup.format(&dev.path, &rec.key)?;
        formatted = true;
    }

    let mut needs_mkfs = formatted && !rec.file_system.is_empty();
    let mut last_err: Option<KeywardenError> = None;

    for attempt in 1..=max_attempts.max(1) {
        match unlock_step(&cryptsetup, rec, &dev.path, &mapper_name, &mut needs_mkfs) {
            Ok(mounted) => {
                return Ok(UnlockReport {
                    mapper_name,
                    mounted,
                    formatted,
                })
            }
            Err(err) => {
                warn!(
                    "unlock attempt {attempt} for {} failed: {err}",
                    rec.uuid
                );
                last_err = Some(err);
                thread::sleep(UNLOCK_ATTEMPT_PAUSE);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        KeywardenError::Invalid(format!("unlock of {} made no attempts", rec.uuid))
    }))
}

fn unlock_step(
    cryptsetup: &Cryptsetup,
    rec: &Record,
    device_path: &str,
    mapper_name: &str,
    needs_mkfs: &mut bool,
) -> KeywardenResult<bool> {
    let mapper = mapper_path(mapper_name);
    if !mapper.exists() {
        cryptsetup.open(device_path, mapper_name, &rec.key)?;
    }
    if *needs_mkfs {
        mkfs(&rec.file_system, &mapper.to_string_lossy())?;
        *needs_mkfs = false;
    }
    if rec.mount_point.is_empty() {
        return Ok(false);
    }
    if mapper_mounted_at(&mapper, &rec.mount_point)? {
        return Ok(true);
    }
    mount(
        &mapper.to_string_lossy(),
        &rec.mount_options,
        &rec.mount_point,
    )?;
    Ok(true)
}

fn mapper_mounted_at(mapper: &Path, mount_point: &str) -> KeywardenResult<bool> {
    let devices = list_block_devices()?;
    let mapper = mapper.to_string_lossy();
    Ok(devices
        .iter()
        .any(|dev| dev.path == mapper && dev.mount_point == mount_point))
}

/// Undo an unlock: umount the mapper if mounted, then close the mapping.
pub fn lock_volume(rec: &Record) -> KeywardenResult<()> {
    let cryptsetup = Cryptsetup::system()?;
    let devices = list_block_devices()?;

    let mapper_name = if rec.mapped_name.is_empty() {
        let dev = find_by_device_id(&devices, &rec.uuid).ok_or_else(|| {
            KeywardenError::NotFound(format!("no block device matches {}", rec.uuid))
        })?;
        make_mapper_name(&dev.path)
    } else {
        rec.mapped_name.clone()
    };

    let mapper = mapper_path(&mapper_name);
    let mapper_str = mapper.to_string_lossy();
    if let Some(row) = devices.iter().find(|dev| dev.path == mapper_str) {
        if !row.mount_point.is_empty() {
            info!("umounting {}", row.mount_point);
            umount(&row.mount_point)?;
        }
    }
    if mapper.exists() {
        info!("closing {mapper_name}");
        cryptsetup.close(&mapper_name)?;
    }
    Ok(())
}

/// Keep asking the server for the key of `uuid` until it grants, the record
/// turns out to be missing, or `max_retry_secs` elapses. On grant the unlock
/// state machine runs; the granted record is returned so the caller can
/// start the alive reporter and command poller.
pub fn auto_online_unlock(
    client: &KeyClient,
    uuid: &str,
    max_retry_secs: i64,
) -> KeywardenResult<Record> {
    let begin = unix_now();
    let mut failures = FailureLog::new();
    let uuids = vec![uuid.to_string()];

    loop {
        // Hostname is re-read every round; it can change while we wait.
        let (hostname, _) = hostname_and_ip();
        let failure: KeywardenError = match client.auto_retrieve(&hostname, &uuids) {
            Ok(resp) => {
                if let Some(rec) = resp.granted.get(uuid) {
                    unlock_volume(rec, 3)?;
                    return Ok(rec.clone());
                }
                if resp.missing.iter().any(|item| item == uuid) {
                    // The server does not even have the key; retrying is
                    // pointless.
                    return Err(KeywardenError::NotFound(format!(
                        "server has no encryption key for {uuid}"
                    )));
                }
                KeywardenError::Access(format!(
                    "server rejected the request for {uuid} (allow-list or MaxActive)"
                ))
            }
            Err(err) => err,
        };

        if unix_now() - begin > max_retry_secs {
            return Err(KeywardenError::Rpc(format!(
                "giving up on {uuid} after {max_retry_secs} seconds: {failure}"
            )));
        }
        match failures.failure() {
            FailureVerdict::Report => warn!(
                "failed to unlock {uuid}, retrying in {AUTO_UNLOCK_RETRY_INTERVAL_SEC} seconds: {failure}"
            ),
            FailureVerdict::AnnounceSuppression => {
                warn!("suppressing further unlock failures for {uuid} until success")
            }
            FailureVerdict::Silent => {}
        }
        thread::sleep(Duration::from_secs(AUTO_UNLOCK_RETRY_INTERVAL_SEC));
    }
}

/// What `online_unlock` did for each locked volume it found.
#[derive(Debug, Default)]
pub struct OnlineUnlockSummary {
    pub unlocked: Vec<String>,
    pub missing: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Manually unlock every locked LUKS volume on this host, authorised by the
/// server password.
pub fn online_unlock(client: &KeyClient, password: &str) -> KeywardenResult<OnlineUnlockSummary> {
    let devices = list_block_devices()?;
    let mut ids = Vec::new();
    for dev in devices.iter().filter(|dev| locked_luks_device(dev)) {
        match device_id_of(dev) {
            Ok(id) => ids.push(id),
            Err(err) => warn!("skipping {}: {err}", dev.path),
        }
    }
    if ids.is_empty() {
        return Err(KeywardenError::NotFound(
            "no locked encrypted file systems were found".into(),
        ));
    }

    let (hostname, _) = hostname_and_ip();
    let resp = client.manual_retrieve(&hostname, &ids, password)?;

    let mut summary = OnlineUnlockSummary {
        missing: resp.missing.clone(),
        ..OnlineUnlockSummary::default()
    };
    for (uuid, rec) in &resp.granted {
        match unlock_volume(rec, 2) {
            Ok(_) => summary.unlocked.push(uuid.clone()),
            Err(err) => summary.failed.push((uuid.clone(), err.to_string())),
        }
    }
    Ok(summary)
}

fn locked_luks_device(dev: &BlockDevice) -> bool {
    dev.is_luks() && dev.mount_point.is_empty()
}

/// Unlock a single volume from an exported key record file, without any
/// server round trip.
pub fn offline_unlock(record_file: &Path) -> KeywardenResult<UnlockReport> {
    let payload = std::fs::read(record_file)?;
    let rec: Record = serde_json::from_slice(&payload).map_err(|err| {
        KeywardenError::Invalid(format!(
            "parse key record {}: {err}",
            record_file.display()
        ))
    })?;
    rec.validate()?;
    unlock_volume(&rec, 3)
}

/// Whether `encrypt` formats a fresh file system or converts an existing one
/// in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptMode {
    /// `luksFormat` + `mkfs`: everything on the device is discarded.
    Fresh,
    /// `cryptsetup reencrypt --encrypt`: the existing file system is
    /// preserved (it must have been shrunk to leave header room).
    InPlace,
}

#[derive(Debug, Clone)]
pub struct EncryptOptions {
    pub device_path: String,
    pub mapped_name: String,
    pub mount_point: String,
    pub mount_options: Vec<String>,
    pub max_active: u32,
    pub allowed_clients: BTreeSet<String>,
    pub auto_encryption: bool,
    pub file_system: String,
    pub mode: EncryptMode,
}

/// Set a device up for encryption: register a key on the server, encrypt the
/// device with it, then open and mount.
pub fn encrypt_device(
    client: &KeyClient,
    opts: &EncryptOptions,
    password: &str,
) -> KeywardenResult<Record> {
    let devices = list_block_devices()?;
    let dev = devices
        .iter()
        .find(|dev| dev.path == opts.device_path)
        .ok_or_else(|| {
            KeywardenError::NotFound(format!("no block device at {}", opts.device_path))
        })?
        .clone();

    if !dev.mount_point.is_empty() {
        return Err(KeywardenError::Invalid(format!(
            "{} is mounted on {}; umount it first",
            dev.path, dev.mount_point
        )));
    }
    let cryptsetup = Cryptsetup::system()?;
    if cryptsetup.is_luks(&dev.path)? {
        return Err(KeywardenError::Invalid(format!(
            "{} already carries a LUKS header",
            dev.path
        )));
    }
    if matches!(opts.mode, EncryptMode::InPlace) && dev.fstype.is_empty() {
        return Err(KeywardenError::Invalid(format!(
            "{} has no file system to encrypt in place",
            dev.path
        )));
    }

    // Stable identifier for the record: the device serial when there is
    // one, otherwise a fresh UUID stamped onto the LUKS header below.
    let uuid = if !dev.serial.is_empty() {
        device_id_of(&dev)?
    } else {
        generate_uuid()?
    };

    let (hostname, _) = hostname_and_ip();
    let rec = client.create_key(CreateKeyRequest {
        uuid: uuid.clone(),
        hostname,
        mapped_name: opts.mapped_name.clone(),
        mount_point: opts.mount_point.clone(),
        mount_options: opts.mount_options.clone(),
        max_active: opts.max_active,
        allowed_clients: opts.allowed_clients.clone(),
        auto_encryption: opts.auto_encryption,
        file_system: opts.file_system.clone(),
        password: password.to_string(),
    })?;

    match opts.mode {
        EncryptMode::Fresh => cryptsetup.format(&dev.path, &rec.key)?,
        EncryptMode::InPlace => cryptsetup.reencrypt_inplace(&dev.path, &rec.key)?,
    }
    if !uuid.starts_with(keywarden_core::record::SERIAL_ID_PREFIX) {
        cryptsetup.set_luks_uuid(&dev.path, &uuid)?;
    }

    let mapper_name = if rec.mapped_name.is_empty() {
        make_mapper_name(&dev.path)
    } else {
        rec.mapped_name.clone()
    };
    cryptsetup.open(&dev.path, &mapper_name, &rec.key)?;
    let mapper = mapper_path(&mapper_name);
    if matches!(opts.mode, EncryptMode::Fresh) && !rec.file_system.is_empty() {
        mkfs(&rec.file_system, &mapper.to_string_lossy())?;
    }
    if !rec.mount_point.is_empty() {
        mount(
            &mapper.to_string_lossy(),
            &rec.mount_options,
            &rec.mount_point,
        )?;
    }
    info!("device {} is now encrypted as {}", dev.path, rec.uuid);
    Ok(rec)
}

/// Destroy a volume: umount, close, wipe the LUKS header, then have the
/// server forget the key. The local wipe comes first so the data is already
/// unrecoverable when the record disappears.
pub fn erase_volume(
    client: &KeyClient,
    uuid: &str,
    mapped_name: Option<&str>,
    password: &str,
) -> KeywardenResult<()> {
    let devices = list_block_devices()?;
    let dev = find_by_device_id(&devices, uuid)
        .ok_or_else(|| KeywardenError::NotFound(format!("no block device matches {uuid}")))?
        .clone();

    let cryptsetup = Cryptsetup::system()?;
    let mapper_name = match mapped_name {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => make_mapper_name(&dev.path),
    };
    let mapper = mapper_path(&mapper_name);
    let mapper_str = mapper.to_string_lossy();
    if let Some(row) = devices.iter().find(|row| row.path == mapper_str) {
        if !row.mount_point.is_empty() {
            info!("umounting {}", row.mount_point);
            umount(&row.mount_point)?;
        }
    }
    if mapper.exists() {
        info!("closing {mapper_name}");
        cryptsetup.close(&mapper_name)?;
    }

    cryptsetup.erase(&dev.path)?;
    info!(
        "encryption header of {} wiped; data on {uuid} is irreversibly lost",
        dev.path
    );

    let (hostname, _) = hostname_and_ip();
    client.erase_key(uuid, &hostname, password)
}

/// Random version-4 UUID for records of devices that have neither a
/// file-system UUID nor a serial number yet.
fn generate_uuid() -> KeywardenResult<String> {
    let mut bytes = [0u8; 16];
    getrandom::getrandom(&mut bytes)
        .map_err(|err| KeywardenError::Io(std::io::Error::other(format!("rng failure: {err}"))))?;
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    Ok(format!(
        "{}-{}-{}-{}-{}",
        hex::encode(&bytes[0..4]),
        hex::encode(&bytes[4..6]),
        hex::encode(&bytes[6..8]),
        hex::encode(&bytes[8..10]),
        hex::encode(&bytes[10..16]),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keywarden_core::record::KEY_LEN;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn generated_uuids_are_v4_shaped() {
        let uuid = generate_uuid().unwrap();
        let parts: Vec<&str> = uuid.split('-').collect();
        assert_eq!(parts.len(), 5);
        assert_eq!(
            parts.iter().map(|p| p.len()).collect::<Vec<_>>(),
            vec![8, 4, 4, 4, 12]
        );
        assert!(parts[2].starts_with('4'));
        assert_ne!(uuid, generate_uuid().unwrap());
    }

    #[test]
    fn offline_unlock_rejects_bad_record_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("record");
        fs::write(&path, b"{}").unwrap();
        assert!(offline_unlock(&path).is_err());

        // A valid record for a device this host does not have fails at
        // discovery, not at parsing.
        let rec = Record::new("no-such-device", vec![0x11; KEY_LEN]);
        fs::write(&path, serde_json::to_vec(&rec).unwrap()).unwrap();
        std::env::set_var(
            keywarden_luks::LSBLK_SNAPSHOT_ENV,
            dir.path().join("empty-snapshot").display().to_string(),
        );
        fs::write(dir.path().join("empty-snapshot"), "").unwrap();
        let err = offline_unlock(&path).unwrap_err();
        std::env::remove_var(keywarden_luks::LSBLK_SNAPSHOT_ENV);
        assert!(matches!(err, KeywardenError::NotFound(_)));
    }

    #[test]
    fn locked_luks_detection() {
        let locked = BlockDevice {
            path: "/dev/sda1".into(),
            fstype: "crypto_LUKS".into(),
            ..BlockDevice::default()
        };
        assert!(locked_luks_device(&locked));

        let mounted = BlockDevice {
            mount_point: "/srv".into(),
            ..locked.clone()
        };
        assert!(!locked_luks_device(&mounted));

        let plain = BlockDevice {
            fstype: "ext4".into(),
            ..BlockDevice::default()
        };
        assert!(!locked_luks_device(&plain));
    }
}
