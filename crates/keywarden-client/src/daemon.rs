//! The client daemon: one supervisor per encrypted volume, each running the
//! auto-unlock retry, the alive reporter, and the command poller.

use crate::retry::{FailureLog, FailureVerdict};
use crate::routines::{
    auto_online_unlock, lock_volume, unlock_volume, DEFAULT_MAX_RETRY_SEC,
};
use crate::rpc::KeyClient;
use keywarden_core::error::KeywardenResult;
use keywarden_core::host::hostname_and_ip;
use keywarden_core::record::{CommandContent, Record, ALIVE_INTERVAL_SEC};
use keywarden_luks::{device_id_of, list_block_devices};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How often the daemon rescans the host for LUKS devices to manage.
const DEVICE_SCAN_INTERVAL: Duration = Duration::from_secs(30);
/// Cadence of the pending-command poller.
const POLL_COMMAND_INTERVAL: Duration = Duration::from_secs(30);

/// Why the alive reporter stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliveExit {
    /// The server rejected this host; the volume must be torn down.
    Revoked,
    /// Shutdown was requested.
    Stopped,
}

/// Run the client daemon until `shutdown` flips.
///
/// Every LUKS device discovered on the host gets a supervisor task; devices
/// appearing later (hotplug) are picked up by periodic rescans. A supervisor
/// that ends (revocation, missing key) is retried on a later scan.
pub async fn run_client_daemon(
    client: Arc<KeyClient>,
    mut shutdown: watch::Receiver<bool>,
) -> KeywardenResult<()> {
    let mut supervisors: HashMap<String, JoinHandle<()>> = HashMap::new();

    loop {
        supervisors.retain(|_, handle| !handle.is_finished());

        match list_block_devices() {
            Ok(devices) => {
                for dev in devices.iter().filter(|dev| dev.is_luks()) {
                    let uuid = match device_id_of(dev) {
                        Ok(uuid) => uuid,
                        Err(err) => {
                            warn!("ignoring {}: {err}", dev.path);
                            continue;
                        }
                    };
                    if supervisors.contains_key(&uuid) {
                        continue;
                    }
                    info!("managing encrypted volume {uuid} ({})", dev.path);
                    let handle = tokio::spawn(supervise_volume(
                        client.clone(),
                        uuid.clone(),
                        shutdown.clone(),
                    ));
                    supervisors.insert(uuid, handle);
                }
            }
            Err(err) => warn!("block device scan failed: {err}"),
        }

        tokio::select! {
            _ = tokio::time::sleep(DEVICE_SCAN_INTERVAL) => {}
            _ = shutdown.changed() => break,
        }
    }

    for (uuid, handle) in supervisors {
        if let Err(err) = handle.await {
            warn!("supervisor for {uuid} ended abnormally: {err}");
        }
    }
    Ok(())
}

/// Unlock one volume, then keep it alive and responsive to operator
/// commands until shutdown or revocation.
async fn supervise_volume(
    client: Arc<KeyClient>,
    uuid: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let unlock = {
        let client = client.clone();
        let uuid = uuid.clone();
        tokio::task::spawn_blocking(move || {
            auto_online_unlock(&client, &uuid, DEFAULT_MAX_RETRY_SEC)
        })
    };
    let rec = tokio::select! {
        joined = unlock => match joined {
            Ok(Ok(rec)) => rec,
            Ok(Err(err)) => {
                warn!("giving up on volume {uuid}: {err}");
                return;
            }
            Err(err) => {
                warn!("unlock task for {uuid} panicked: {err}");
                return;
            }
        },
        _ = shutdown.changed() => return,
    };

    let (volume_tx, volume_rx) = watch::channel(false);
    let reporter = tokio::spawn(report_alive_loop(
        client.clone(),
        uuid.clone(),
        volume_rx.clone(),
    ));
    let poller = tokio::spawn(poll_command_loop(client.clone(), rec.clone(), volume_rx));

    tokio::select! {
        exit = reporter => {
            if matches!(exit, Ok(AliveExit::Revoked)) {
                warn!("server revoked {uuid}; locking the volume");
                let rec = rec.clone();
                let locked = tokio::task::spawn_blocking(move || lock_volume(&rec)).await;
                match locked {
                    Ok(Ok(())) => info!("volume {uuid} locked after revocation"),
                    Ok(Err(err)) => warn!("failed to lock revoked volume {uuid}: {err}"),
                    Err(err) => warn!("lock task for {uuid} panicked: {err}"),
                }
            }
        }
        _ = shutdown.changed() => {}
    }

    let _ = volume_tx.send(true);
    let _ = poller.await;
}

/// Tell the server every ten seconds that this host still holds the volume.
/// Ends with [`AliveExit::Revoked`] as soon as the server rejects the UUID.
pub async fn report_alive_loop(
    client: Arc<KeyClient>,
    uuid: String,
    mut shutdown: watch::Receiver<bool>,
) -> AliveExit {
    info!("sending alive reports for {uuid}");
    let mut failures = FailureLog::new();
    let uuids = vec![uuid.clone()];

    loop {
        let call = {
            let client = client.clone();
            let uuids = uuids.clone();
            tokio::task::spawn_blocking(move || {
                let (hostname, _) = hostname_and_ip();
                client.report_alive(&hostname, &uuids)
            })
        };
        match call.await {
            Ok(Ok(rejected)) => {
                if rejected.iter().any(|item| item == &uuid) {
                    return AliveExit::Revoked;
                }
                if failures.success() {
                    info!("alive reports for {uuid} succeed again");
                }
            }
            Ok(Err(err)) => match failures.failure() {
                FailureVerdict::Report => {
                    warn!("alive report for {uuid} failed: {err}")
                }
                FailureVerdict::AnnounceSuppression => {
                    warn!("suppressing further alive-report failures for {uuid} until success")
                }
                FailureVerdict::Silent => {}
            },
            Err(err) => warn!("alive report task for {uuid} panicked: {err}"),
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(ALIVE_INTERVAL_SEC as u64)) => {}
            _ = shutdown.changed() => return AliveExit::Stopped,
        }
    }
}

/// Low-frequency poll for operator commands addressed to this host.
pub async fn poll_command_loop(
    client: Arc<KeyClient>,
    rec: Record,
    mut shutdown: watch::Receiver<bool>,
) {
    let uuid = rec.uuid.clone();
    let mut current = rec;
    let mut failures = FailureLog::new();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(POLL_COMMAND_INTERVAL) => {}
            _ = shutdown.changed() => return,
        }

        let poll = {
            let client = client.clone();
            let uuid = uuid.clone();
            tokio::task::spawn_blocking(move || {
                let (hostname, _) = hostname_and_ip();
                client.poll_command(&uuid, &hostname)
            })
        };
        let command = match poll.await {
            Ok(Ok(command)) => {
                failures.success();
                command
            }
            Ok(Err(err)) => {
                if matches!(failures.failure(), FailureVerdict::Report) {
                    warn!("command poll for {uuid} failed: {err}");
                }
                continue;
            }
            Err(err) => {
                warn!("command poll task for {uuid} panicked: {err}");
                continue;
            }
        };
        let Some(command) = command else { continue };

        info!("executing pending command {} for {uuid}", command.content);
        let outcome = match command.content {
            CommandContent::Mount => {
                let client = client.clone();
                let uuid = uuid.clone();
                let result = tokio::task::spawn_blocking(move || {
                    let (hostname, _) = hostname_and_ip();
                    let resp = client.auto_retrieve(&hostname, &[uuid.clone()])?;
                    match resp.granted.get(&uuid) {
                        Some(rec) => {
                            unlock_volume(rec, 3)?;
                            Ok(rec.clone())
                        }
                        None => Err(keywarden_core::error::KeywardenError::Access(format!(
                            "server declined to re-grant {uuid} for the mount command"
                        ))),
                    }
                })
                .await;
                match result {
                    Ok(Ok(rec)) => {
                        current = rec;
                        "mounted".to_string()
                    }
                    Ok(Err(err)) => format!("mount failed: {err}"),
                    Err(err) => format!("mount task panicked: {err}"),
                }
            }
            CommandContent::Umount => {
                let rec = current.clone();
                match tokio::task::spawn_blocking(move || lock_volume(&rec)).await {
                    Ok(Ok(())) => "umounted".to_string(),
                    Ok(Err(err)) => format!("umount failed: {err}"),
                    Err(err) => format!("umount task panicked: {err}"),
                }
            }
        };

        let post = {
            let client = client.clone();
            let uuid = uuid.clone();
            let outcome = outcome.clone();
            tokio::task::spawn_blocking(move || {
                client.save_result(&uuid, command.id, &outcome)
            })
        };
        match post.await {
            Ok(Ok(())) => info!("command {} on {uuid}: {outcome}", command.id),
            Ok(Err(err)) => warn!("failed to post command result for {uuid}: {err}"),
            Err(err) => warn!("result post task for {uuid} panicked: {err}"),
        }
    }
}
