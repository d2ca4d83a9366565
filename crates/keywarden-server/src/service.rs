//! Request handling and admission control for the key service.

use crate::mail::Mailer;
use keywarden_core::config::ServerConfig;
use keywarden_core::error::{KeywardenError, KeywardenResult};
use keywarden_core::host::unix_now;
use keywarden_core::keydb::RecordStore;
use keywarden_core::record::{self, PendingCommand, Record};
use keywarden_core::secret;
use keywarden_proto::{CreateKeyRequest, Request, Response, RetrieveResponse, RpcError};
use log::{error, info, warn};

/// Who is on the other end of a connection.
#[derive(Debug, Clone)]
pub struct Peer {
    pub ip: String,
    /// Identity taken from the peer certificate's SANs, when client
    /// verification is on.
    pub identity: Option<String>,
    /// Connections over the operator socket are privileged.
    pub privileged: bool,
}

impl Peer {
    pub fn tls(ip: impl Into<String>, identity: Option<String>) -> Self {
        Peer {
            ip: ip.into(),
            identity,
            privileged: false,
        }
    }

    /// Peer for a connection on the local operator socket.
    pub fn local() -> Self {
        Peer {
            ip: "127.0.0.1".into(),
            identity: None,
            privileged: true,
        }
    }
}

/// The key service: one instance owns the record store and is shared by all
/// connection handlers.
pub struct KeyService<S: RecordStore> {
    config: ServerConfig,
    store: S,
    mailer: Option<Mailer>,
}

impl<S: RecordStore> KeyService<S> {
    pub fn new(config: ServerConfig, store: S, mailer: Option<Mailer>) -> Self {
        KeyService {
            config,
            store,
            mailer,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Err when `init-server` has not stored an access password yet.
    pub fn check_initial_setup(&self) -> KeywardenResult<()> {
        if self.config.is_initialised() {
            Ok(())
        } else {
            Err(KeywardenError::Invalid(
                "no access password is configured; run `keywarden init-server`".into(),
            ))
        }
    }

    /// Dispatch one request. Every failure is packaged into the response;
    /// nothing here terminates the server.
    pub fn handle(&self, peer: &Peer, request: Request) -> Response {
        let outcome = match request {
            Request::Ping { password } => self.ping(peer, password.as_deref()).map(|()| Response::Ok),
            Request::CreateKey(req) => self
                .create_key(peer, req)
                .map(|record| Response::Created { record }),
            Request::AutoRetrieve { hostname, uuids } => {
                Ok(Response::Retrieved(self.auto_retrieve(peer, &hostname, &uuids)))
            }
            Request::ManualRetrieve {
                hostname,
                uuids,
                password,
            } => self
                .manual_retrieve(peer, &hostname, &uuids, &password)
                .map(Response::Retrieved),
            Request::ReportAlive { hostname, uuids } => Ok(Response::Alive {
                rejected: self.report_alive(peer, &hostname, &uuids),
            }),
            Request::EraseKey {
                uuid,
                hostname,
                password,
            } => self
                .erase_key(peer, &uuid, &hostname, &password)
                .map(|()| Response::Ok),
            Request::PollCommand { uuid, hostname: _ } => self
                .poll_command(peer, &uuid)
                .map(|command| Response::Command { command }),
            Request::SaveResult {
                uuid,
                command_id,
                text,
            } => self
                .save_result(peer, &uuid, command_id, &text)
                .map(|()| Response::Ok),
            Request::ReloadRecord { uuid, password } => self
                .reload_record(peer, &uuid, &password)
                .map(|()| Response::Ok),
        };

        match outcome {
            Ok(response) => response,
            Err(err) => {
                info!("request from {} failed: {err}", peer.ip);
                Response::Error(RpcError::from(&err))
            }
        }
    }

    fn verify_password(&self, password: &str) -> KeywardenResult<()> {
        self.check_initial_setup()
            .map_err(|_| KeywardenError::Auth("server has no access password yet".into()))?;
        if secret::verify_access_password(
            &self.config.password_salt,
            &self.config.password_hash,
            password,
        ) {
            Ok(())
        } else {
            Err(KeywardenError::Auth("access password mismatch".into()))
        }
    }

    fn ping(&self, peer: &Peer, password: Option<&str>) -> KeywardenResult<()> {
        match password {
            Some(password) => self.verify_password(password),
            None if peer.privileged || peer.identity.is_some() => Ok(()),
            None => Err(KeywardenError::Auth(
                "a password or a client certificate is required".into(),
            )),
        }
    }

    fn create_key(&self, peer: &Peer, req: CreateKeyRequest) -> KeywardenResult<Record> {
        self.verify_password(&req.password)?;
        if req.uuid.trim().is_empty() {
            return Err(KeywardenError::Invalid("device UUID is empty".into()));
        }
        if self.store.get_by_uuid(&req.uuid).is_some() {
            return Err(KeywardenError::Conflict(format!(
                "a key record for {} already exists",
                req.uuid
            )));
        }
        if req.auto_encryption && req.file_system.is_empty() {
            return Err(KeywardenError::Invalid(
                "auto encryption requires a file system choice".into(),
            ));
        }
        if !req.file_system.is_empty()
            && !record::FILE_SYSTEM_CHOICES.contains(&req.file_system.as_str())
        {
            return Err(KeywardenError::Invalid(format!(
                "unsupported file system `{}`",
                req.file_system
            )));
        }

        let key = secret::generate_volume_key()?;
        let mut rec = Record::new(req.uuid.clone(), key.to_vec());
        rec.mapped_name = req.mapped_name;
        rec.mount_point = req.mount_point;
        rec.mount_options = req.mount_options;
        rec.max_active = req.max_active;
        rec.allowed_clients = req.allowed_clients;
        rec.auto_encryption = req.auto_encryption;
        rec.file_system = req.file_system;

        let stored = self.store.upsert(rec)?;
        info!(
            "created key record {} for host {} ({})",
            stored.uuid, req.hostname, peer.ip
        );
        self.notify_creation(&stored.uuid, &req.hostname, &peer.ip);
        Ok(stored)
    }

    /// Certificate-based retrieval with admission control.
    fn auto_retrieve(&self, peer: &Peer, hostname: &str, uuids: &[String]) -> RetrieveResponse {
        let now = unix_now();
        let mut resp = RetrieveResponse::default();

        for uuid in uuids {
            let Some(mut rec) = self.store.get_by_uuid(uuid) else {
                resp.missing.push(uuid.clone());
                continue;
            };
            rec.remove_dead_hosts(now);

            if !rec.allowed_clients.is_empty() {
                let admitted = peer
                    .identity
                    .as_deref()
                    .map(|id| rec.allowed_clients.contains(id))
                    .unwrap_or(false);
                if !admitted {
                    info!(
                        "rejecting {uuid} for {} ({hostname}): not an allowed client",
                        peer.ip
                    );
                    resp.rejected.push(uuid.clone());
                    continue;
                }
            }

            if rec.max_active > 0
                && rec.active_host_count() >= rec.max_active as usize
                && !rec.is_host_active(&peer.ip)
            {
                info!(
                    "rejecting {uuid} for {} ({hostname}): {} active hosts reached the limit of {}",
                    peer.ip,
                    rec.active_host_count(),
                    rec.max_active
                );
                resp.rejected.push(uuid.clone());
                continue;
            }

            rec.push_alive(&peer.ip, hostname, now);
            rec.touch_retrieval(&peer.ip, hostname, now);
            match self.store.upsert(rec) {
                Ok(stored) => {
                    resp.granted.insert(uuid.clone(), stored);
                }
                Err(err) => {
                    error!("failed to persist grant of {uuid} to {}: {err}", peer.ip);
                    resp.rejected.push(uuid.clone());
                }
            }
        }

        if !resp.granted.is_empty() {
            let granted: Vec<String> = resp.granted.keys().cloned().collect();
            self.notify_retrieval(&granted, hostname, &peer.ip);
        }
        resp
    }

    /// Password-based retrieval; overrides the allow-list and MaxActive.
    fn manual_retrieve(
        &self,
        peer: &Peer,
        hostname: &str,
        uuids: &[String],
        password: &str,
    ) -> KeywardenResult<RetrieveResponse> {
        self.verify_password(password)?;
        let now = unix_now();
        let mut resp = RetrieveResponse::default();

        for uuid in uuids {
            let Some(mut rec) = self.store.get_by_uuid(uuid) else {
                resp.missing.push(uuid.clone());
                continue;
            };
            rec.remove_dead_hosts(now);
            rec.push_alive(&peer.ip, hostname, now);
            rec.touch_retrieval(&peer.ip, hostname, now);
            match self.store.upsert(rec) {
                Ok(stored) => {
                    resp.granted.insert(uuid.clone(), stored);
                }
                Err(err) => {
                    error!("failed to persist grant of {uuid} to {}: {err}", peer.ip);
                    resp.rejected.push(uuid.clone());
                }
            }
        }

        if !resp.granted.is_empty() {
            let granted: Vec<String> = resp.granted.keys().cloned().collect();
            self.notify_retrieval(&granted, hostname, &peer.ip);
        }
        Ok(resp)
    }

    /// Record liveness for hosts still holding a grant. The returned UUIDs
    /// are the ones this host no longer holds; its reporter stops on them.
    fn report_alive(&self, peer: &Peer, hostname: &str, uuids: &[String]) -> Vec<String> {
        let now = unix_now();
        let mut rejected = Vec::new();

        for uuid in uuids {
            let Some(mut rec) = self.store.get_by_uuid(uuid) else {
                rejected.push(uuid.clone());
                continue;
            };
            rec.remove_dead_hosts(now);
            if !rec.is_host_active(&peer.ip) {
                rejected.push(uuid.clone());
                continue;
            }
            rec.push_alive(&peer.ip, hostname, now);
            if let Err(err) = self.store.upsert(rec) {
                error!("failed to persist alive report for {uuid}: {err}");
            }
        }
        rejected
    }

    fn erase_key(
        &self,
        peer: &Peer,
        uuid: &str,
        hostname: &str,
        password: &str,
    ) -> KeywardenResult<()> {
        self.verify_password(password)?;
        self.store.erase(uuid)?;
        info!("erased key record {uuid} on request of {hostname} ({})", peer.ip);
        Ok(())
    }

    /// Hand out the next visible pending command for the caller's IP and
    /// mark it as fetched.
    fn poll_command(&self, peer: &Peer, uuid: &str) -> KeywardenResult<Option<PendingCommand>> {
        let mut rec = self
            .store
            .get_by_uuid(uuid)
            .ok_or_else(|| KeywardenError::NotFound(format!("no key record for {uuid}")))?;
        let now = unix_now();

        let before: usize = rec.pending_commands.values().map(Vec::len).sum();
        rec.remove_expired_commands(now);
        let after: usize = rec.pending_commands.values().map(Vec::len).sum();

        let command = rec.take_visible_command(&peer.ip, now);
        if command.is_some() || before != after {
            self.store.upsert(rec)?;
        }
        Ok(command)
    }

    fn save_result(
        &self,
        peer: &Peer,
        uuid: &str,
        command_id: u64,
        text: &str,
    ) -> KeywardenResult<()> {
        let mut rec = self
            .store
            .get_by_uuid(uuid)
            .ok_or_else(|| KeywardenError::NotFound(format!("no key record for {uuid}")))?;
        if rec.save_command_result(&peer.ip, command_id, text) {
            self.store.upsert(rec)?;
        } else {
            warn!(
                "{} reported a result for unknown command {command_id} on {uuid}",
                peer.ip
            );
        }
        Ok(())
    }

    /// Operator-only: refresh one record from disk after an out-of-process
    /// edit.
    fn reload_record(&self, peer: &Peer, uuid: &str, password: &str) -> KeywardenResult<()> {
        if !peer.privileged {
            return Err(KeywardenError::Access(
                "record reload is limited to the operator socket".into(),
            ));
        }
        self.verify_password(password)?;
        match self.store.reload(uuid)? {
            Some(_) => info!("reloaded key record {uuid} from disk"),
            None => info!("key record {uuid} vanished from disk; dropped from memory"),
        }
        Ok(())
    }

    fn notify_creation(&self, uuid: &str, hostname: &str, ip: &str) {
        let Some(mailer) = self.mailer.clone() else {
            return;
        };
        let subject = mailer.creation_subject.clone();
        let body = format!(
            "{}\n\nUUID: {uuid}\nRequested by: {hostname} ({ip})",
            mailer.creation_text
        );
        std::thread::spawn(move || {
            if let Err(err) = mailer.send(&subject, &body) {
                warn!("key-creation notification failed: {err}");
            }
        });
    }

    fn notify_retrieval(&self, uuids: &[String], hostname: &str, ip: &str) {
        let Some(mailer) = self.mailer.clone() else {
            return;
        };
        let subject = mailer.retrieval_subject.clone();
        let body = format!(
            "{}\n\nUUIDs: {}\nRetrieved by: {hostname} ({ip})",
            mailer.retrieval_text,
            uuids.join(", ")
        );
        std::thread::spawn(move || {
            if let Err(err) = mailer.send(&subject, &body) {
                warn!("key-retrieval notification failed: {err}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keywarden_core::config::{CFG_PASSWORD_HASH, CFG_PASSWORD_SALT};
    use keywarden_core::keydb::DirStore;
    use keywarden_core::record::{CommandContent, KEY_LEN};
    use keywarden_core::sysconfig::Sysconfig;
    use std::collections::BTreeSet;
    use std::sync::OnceLock;
    use tempfile::{tempdir, TempDir};

    const PASSWORD: &str = "correct horse battery staple";

    /// Hashing the access password is deliberately slow; do it once for the
    /// whole test module.
    fn password_material() -> &'static (Vec<u8>, Vec<u8>) {
        static MATERIAL: OnceLock<(Vec<u8>, Vec<u8>)> = OnceLock::new();
        MATERIAL.get_or_init(|| {
            let salt = vec![0x24u8; secret::SALT_LEN];
            let hash = secret::hash_access_password(&salt, PASSWORD).to_vec();
            (salt, hash)
        })
    }

    fn service() -> (KeyService<DirStore>, TempDir) {
        let dir = tempdir().unwrap();
        let (salt, hash) = password_material().clone();
        let mut sysconfig = Sysconfig::default();
        sysconfig.set(CFG_PASSWORD_SALT, hex::encode(salt));
        sysconfig.set(CFG_PASSWORD_HASH, hex::encode(hash));
        let config = ServerConfig::from_sysconfig(&sysconfig).unwrap();
        let store = DirStore::open(dir.path()).unwrap();
        (KeyService::new(config, store, None), dir)
    }

    fn create_request(uuid: &str) -> CreateKeyRequest {
        CreateKeyRequest {
            uuid: uuid.into(),
            hostname: "h1".into(),
            mapped_name: format!("crypt-{uuid}"),
            mount_point: "/secure".into(),
            mount_options: vec!["noatime".into()],
            max_active: 0,
            allowed_clients: BTreeSet::new(),
            auto_encryption: false,
            file_system: String::new(),
            password: PASSWORD.into(),
        }
    }

    fn peer(ip: &str, identity: Option<&str>) -> Peer {
        Peer::tls(ip, identity.map(|id| id.to_string()))
    }

    fn retrieve(service: &KeyService<DirStore>, peer: &Peer, host: &str, uuid: &str) -> RetrieveResponse {
        service.auto_retrieve(peer, host, &[uuid.to_string()])
    }

    #[test]
    fn ping_credential_paths() {
        let (service, _dir) = service();

        assert!(service.ping(&Peer::local(), None).is_ok());
        assert!(service
            .ping(&peer("10.0.0.1", Some("h1")), None)
            .is_ok());
        assert!(matches!(
            service.ping(&peer("10.0.0.1", None), None),
            Err(KeywardenError::Auth(_))
        ));
        assert!(service.ping(&peer("10.0.0.1", None), Some(PASSWORD)).is_ok());
        assert!(matches!(
            service.ping(&peer("10.0.0.1", None), Some("wrong")),
            Err(KeywardenError::Auth(_))
        ));
    }

    #[test]
    fn create_then_retrieve_grants_key() {
        let (service, _dir) = service();
        let caller = peer("10.0.0.1", Some("H1"));

        let record = service.create_key(&caller, create_request("a1")).unwrap();
        assert_eq!(record.key.len(), KEY_LEN);
        assert_eq!(record.mapped_name, "crypt-a1");

        let resp = retrieve(&service, &caller, "H1", "a1");
        assert!(resp.rejected.is_empty() && resp.missing.is_empty());
        let granted = &resp.granted["a1"];
        assert_eq!(granted.key.len(), KEY_LEN);
        assert_eq!(granted.key, record.key);
        assert_eq!(granted.last_retrieval.hostname, "H1");
        assert_eq!(granted.last_retrieval.ip, "10.0.0.1");
    }

    #[test]
    fn create_rejects_duplicates_and_bad_credentials() {
        let (service, _dir) = service();
        let caller = peer("10.0.0.1", None);

        service.create_key(&caller, create_request("dup")).unwrap();
        assert!(matches!(
            service.create_key(&caller, create_request("dup")),
            Err(KeywardenError::Conflict(_))
        ));

        let mut bad = create_request("other");
        bad.password = "nope".into();
        assert!(matches!(
            service.create_key(&caller, bad),
            Err(KeywardenError::Auth(_))
        ));

        let mut fs = create_request("fs");
        fs.auto_encryption = true;
        assert!(matches!(
            service.create_key(&caller, fs),
            Err(KeywardenError::Invalid(_))
        ));
    }

    #[test]
    fn retrieval_outcomes_partition_the_request() {
        let (service, _dir) = service();
        let caller = peer("10.0.0.1", None);
        service.create_key(&caller, create_request("known")).unwrap();

        let resp = service.auto_retrieve(
            &caller,
            "h1",
            &["known".to_string(), "unknown".to_string()],
        );
        assert_eq!(resp.granted.len(), 1);
        assert_eq!(resp.missing, vec!["unknown".to_string()]);
        assert!(resp.rejected.is_empty());
        let total = resp.granted.len() + resp.rejected.len() + resp.missing.len();
        assert_eq!(total, 2);
    }

    #[test]
    fn max_active_admission_and_liveness_expiry() {
        let (service, _dir) = service();
        let mut req = create_request("b2");
        req.max_active = 1;
        service.create_key(&peer("10.0.0.1", None), req).unwrap();
        // Tighten the window to interval * minimum count.
        let mut rec = service.store.get_by_uuid("b2").unwrap();
        rec.alive_count = 2;
        service.store.upsert(rec).unwrap();

        let h1 = peer("10.0.0.1", None);
        let h2 = peer("10.0.0.2", None);

        assert_eq!(retrieve(&service, &h1, "H1", "b2").granted.len(), 1);
        // Second host bounces off the MaxActive limit...
        assert_eq!(retrieve(&service, &h2, "H2", "b2").rejected, vec!["b2"]);
        // ...while the holder itself may re-retrieve.
        assert_eq!(retrieve(&service, &h1, "H1", "b2").granted.len(), 1);

        // Age H1 beyond the 20 second window (no alive reports for 25 s).
        let mut rec = service.store.get_by_uuid("b2").unwrap();
        for messages in rec.alive_messages.values_mut() {
            for msg in messages.iter_mut() {
                msg.timestamp -= 25;
            }
        }
        service.store.upsert(rec).unwrap();

        let resp = retrieve(&service, &h2, "H2", "b2");
        assert_eq!(resp.granted.len(), 1, "dead holder must free the slot");
    }

    #[test]
    fn allow_list_rejects_unlisted_peers_and_manual_overrides() {
        let (service, _dir) = service();
        let mut req = create_request("c3");
        req.allowed_clients = ["H1".to_string()].into_iter().collect();
        service.create_key(&peer("10.0.0.1", None), req).unwrap();

        // Listed identity is admitted.
        let resp = retrieve(&service, &peer("10.0.0.1", Some("H1")), "H1", "c3");
        assert_eq!(resp.granted.len(), 1);

        // Unlisted identity and anonymous peers are rejected.
        let resp = retrieve(&service, &peer("10.0.0.2", Some("H2")), "H2", "c3");
        assert_eq!(resp.rejected, vec!["c3"]);
        let resp = retrieve(&service, &peer("10.0.0.3", None), "H3", "c3");
        assert_eq!(resp.rejected, vec!["c3"]);

        // The password overrides the allow-list.
        let resp = service
            .manual_retrieve(&peer("10.0.0.2", Some("H2")), "H2", &["c3".to_string()], PASSWORD)
            .unwrap();
        assert_eq!(resp.granted.len(), 1);

        assert!(matches!(
            service.manual_retrieve(&peer("10.0.0.2", None), "H2", &["c3".to_string()], "bad"),
            Err(KeywardenError::Auth(_))
        ));
    }

    #[test]
    fn manual_retrieval_ignores_max_active() {
        let (service, _dir) = service();
        let mut req = create_request("m1");
        req.max_active = 1;
        service.create_key(&peer("10.0.0.1", None), req).unwrap();

        assert_eq!(retrieve(&service, &peer("10.0.0.1", None), "H1", "m1").granted.len(), 1);
        let resp = service
            .manual_retrieve(&peer("10.0.0.2", None), "H2", &["m1".to_string()], PASSWORD)
            .unwrap();
        assert_eq!(resp.granted.len(), 1);
    }

    #[test]
    fn alive_reports_track_holders_and_reject_strangers() {
        let (service, _dir) = service();
        service
            .create_key(&peer("10.0.0.1", None), create_request("r1"))
            .unwrap();

        let holder = peer("10.0.0.1", None);
        let stranger = peer("10.0.0.9", None);

        retrieve(&service, &holder, "H1", "r1");
        assert!(service.report_alive(&holder, "H1", &["r1".to_string()]).is_empty());
        assert_eq!(
            service.report_alive(&stranger, "H9", &["r1".to_string()]),
            vec!["r1"]
        );
        assert_eq!(
            service.report_alive(&holder, "H1", &["gone".to_string()]),
            vec!["gone"]
        );
    }

    #[test]
    fn pending_command_lifecycle() {
        let (service, _dir) = service();
        service
            .create_key(&peer("10.0.0.5", None), create_request("a1"))
            .unwrap();

        // Operator queues an umount for 10.0.0.5 with a ten-minute validity.
        let mut rec = service.store.get_by_uuid("a1").unwrap();
        let id = rec.add_pending_command(
            "10.0.0.5",
            CommandContent::Umount,
            unix_now(),
            600,
        );
        service.store.upsert(rec).unwrap();

        let addressee = peer("10.0.0.5", None);
        let other = peer("10.0.0.6", None);

        // Only the addressed host sees it, exactly once.
        assert!(service.poll_command(&other, "a1").unwrap().is_none());
        let cmd = service.poll_command(&addressee, "a1").unwrap().unwrap();
        assert_eq!(cmd.id, id);
        assert_eq!(cmd.content, CommandContent::Umount);
        assert!(service.poll_command(&addressee, "a1").unwrap().is_none());

        // Fetch state and the posted result both persist.
        service
            .save_result(&addressee, "a1", id, "umounted cleanly")
            .unwrap();
        let rec = service.store.get_by_uuid("a1").unwrap();
        let stored = &rec.pending_commands["10.0.0.5"][0];
        assert!(stored.seen_by_client);
        assert_eq!(stored.client_result, "umounted cleanly");

        assert!(matches!(
            service.poll_command(&addressee, "missing"),
            Err(KeywardenError::NotFound(_))
        ));
    }

    #[test]
    fn erase_requires_the_password() {
        let (service, _dir) = service();
        service
            .create_key(&peer("10.0.0.1", None), create_request("e1"))
            .unwrap();

        assert!(matches!(
            service.erase_key(&peer("10.0.0.1", None), "e1", "h1", "wrong"),
            Err(KeywardenError::Auth(_))
        ));
        service
            .erase_key(&peer("10.0.0.1", None), "e1", "h1", PASSWORD)
            .unwrap();
        assert!(service.store.get_by_uuid("e1").is_none());
        assert!(matches!(
            service.erase_key(&peer("10.0.0.1", None), "e1", "h1", PASSWORD),
            Err(KeywardenError::NotFound(_))
        ));
    }

    #[test]
    fn reload_is_operator_only() {
        let (service, dir) = service();
        service
            .create_key(&peer("10.0.0.1", None), create_request("rl"))
            .unwrap();

        assert!(matches!(
            service.reload_record(&peer("10.0.0.1", None), "rl", PASSWORD),
            Err(KeywardenError::Access(_))
        ));

        // Simulate the CLI editing the file out of process.
        let other = DirStore::open_one(dir.path(), "rl").unwrap();
        let mut edited = other.get_by_uuid("rl").unwrap();
        edited.max_active = 3;
        other.upsert(edited).unwrap();

        service
            .reload_record(&Peer::local(), "rl", PASSWORD)
            .unwrap();
        assert_eq!(service.store.get_by_uuid("rl").unwrap().max_active, 3);
    }

    #[test]
    fn handle_wraps_errors_into_responses() {
        let (service, _dir) = service();
        let response = service.handle(
            &peer("10.0.0.1", None),
            Request::EraseKey {
                uuid: "nope".into(),
                hostname: "h1".into(),
                password: "wrong".into(),
            },
        );
        match response {
            Response::Error(err) => {
                assert_eq!(err.kind, keywarden_proto::RpcErrorKind::Auth)
            }
            other => panic!("expected an error response, got {other:?}"),
        }
    }
}
