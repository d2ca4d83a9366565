//! Full-stack exercise over the operator socket: real listener, codec, and
//! key database, driven through the typed client.

use keywarden_client::KeyClient;
use keywarden_core::config::{ServerConfig, CFG_PASSWORD_HASH, CFG_PASSWORD_SALT};
use keywarden_core::host::unix_now;
use keywarden_core::keydb::{DirStore, RecordStore};
use keywarden_core::record::{CommandContent, KEY_LEN};
use keywarden_core::secret;
use keywarden_core::sysconfig::Sysconfig;
use keywarden_proto::CreateKeyRequest;
use keywarden_server::{bind_operator_socket, serve_unix, KeyService};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

const PASSWORD: &str = "correct horse battery staple";

struct Harness {
    client: Arc<KeyClient>,
    keydb_dir: PathBuf,
    shutdown: watch::Sender<bool>,
    server: tokio::task::JoinHandle<keywarden_core::error::KeywardenResult<()>>,
    _dir: tempfile::TempDir,
}

async fn start_server() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let keydb_dir = dir.path().join("keydb");
    let socket_path = dir.path().join("keywarden.sock");

    let salt = vec![0x42u8; secret::SALT_LEN];
    let hash = secret::hash_access_password(&salt, PASSWORD);
    let mut sysconfig = Sysconfig::default();
    sysconfig.set(CFG_PASSWORD_SALT, hex::encode(&salt));
    sysconfig.set(CFG_PASSWORD_HASH, hex::encode(hash));
    let config = ServerConfig::from_sysconfig(&sysconfig).unwrap();

    let store = DirStore::open(&keydb_dir).unwrap();
    let service = Arc::new(KeyService::new(config, store, None));
    let listener = bind_operator_socket(&socket_path).unwrap();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(serve_unix(service, listener, shutdown_rx));

    Harness {
        client: Arc::new(KeyClient::over_unix(&socket_path)),
        keydb_dir,
        shutdown,
        server,
        _dir: dir,
    }
}

async fn call<T, F>(client: &Arc<KeyClient>, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce(&KeyClient) -> T + Send + 'static,
{
    let client = client.clone();
    tokio::task::spawn_blocking(move || f(&client)).await.unwrap()
}

fn create_request(uuid: &str) -> CreateKeyRequest {
    CreateKeyRequest {
        uuid: uuid.into(),
        hostname: "client-host".into(),
        mapped_name: format!("crypt-{uuid}"),
        mount_point: "/srv/secure".into(),
        mount_options: vec!["noatime".into()],
        max_active: 0,
        allowed_clients: BTreeSet::new(),
        auto_encryption: false,
        file_system: String::new(),
        password: PASSWORD.into(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_retrieve_alive_and_command_flow() {
    let harness = start_server().await;
    let client = &harness.client;

    // Credential check without a password succeeds on the operator socket.
    call(client, |c| c.ping(None)).await.unwrap();

    // Create a key and fetch it back; key material survives byte-exact.
    let created = call(client, |c| c.create_key(create_request("a1"))).await.unwrap();
    assert_eq!(created.key.len(), KEY_LEN);

    let resp = call(client, |c| {
        c.auto_retrieve("client-host", &["a1".to_string(), "ghost".to_string()])
    })
    .await
    .unwrap();
    assert_eq!(resp.granted["a1"].key, created.key);
    assert_eq!(resp.granted["a1"].last_retrieval.hostname, "client-host");
    assert_eq!(resp.missing, vec!["ghost".to_string()]);
    assert!(resp.rejected.is_empty());

    // The holder's alive reports are accepted; an unknown UUID is rejected.
    let rejected = call(client, |c| {
        c.report_alive("client-host", &["a1".to_string(), "ghost".to_string()])
    })
    .await
    .unwrap();
    assert_eq!(rejected, vec!["ghost".to_string()]);

    // Operator queues a command on disk and has the server reload the
    // record, exactly like send-command does.
    {
        let store = DirStore::open_one(&harness.keydb_dir, "a1").unwrap();
        let mut rec = store.get_by_uuid("a1").unwrap();
        rec.add_pending_command("127.0.0.1", CommandContent::Umount, unix_now(), 600);
        store.upsert(rec).unwrap();
    }
    call(client, |c| c.reload_record("a1", PASSWORD)).await.unwrap();

    // The client polls it exactly once and posts a result.
    let cmd = call(client, |c| c.poll_command("a1", "client-host"))
        .await
        .unwrap()
        .expect("one pending command");
    assert_eq!(cmd.content, CommandContent::Umount);
    assert!(call(client, |c| c.poll_command("a1", "client-host"))
        .await
        .unwrap()
        .is_none());
    call(client, move |c| c.save_result("a1", cmd.id, "umounted"))
        .await
        .unwrap();

    // Erase needs the right password, then the record is gone durably.
    assert!(call(client, |c| c.erase_key("a1", "client-host", "wrong"))
        .await
        .is_err());
    call(client, |c| c.erase_key("a1", "client-host", PASSWORD))
        .await
        .unwrap();
    let reopened = DirStore::open(&harness.keydb_dir).unwrap();
    assert!(reopened.get_by_uuid("a1").is_none());

    harness.shutdown.send(true).unwrap();
    harness.server.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_create_is_a_conflict() {
    let harness = start_server().await;
    let client = &harness.client;

    call(client, |c| c.create_key(create_request("dup"))).await.unwrap();
    let err = call(client, |c| c.create_key(create_request("dup")))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        keywarden_core::error::KeywardenError::Conflict(_)
    ));

    harness.shutdown.send(true).unwrap();
    harness.server.await.unwrap().unwrap();
}
