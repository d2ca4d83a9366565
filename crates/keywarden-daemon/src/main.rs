//! Key server daemon: loads the sysconfig, opens the key database, and
//! serves the RPC surface on TLS TCP and the local operator socket.

use anyhow::{Context, Result};
use keywarden_core::config::{ServerConfig, SERVER_CONFIG_PATH, SOCKET_PATH};
use keywarden_core::host;
use keywarden_core::keydb::DirStore;
use keywarden_core::logging;
use keywarden_core::sysconfig::Sysconfig;
use keywarden_server::{bind_operator_socket, serve_tcp, serve_unix, tls, KeyService, Mailer};
use log::{error, info, warn};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

/// Entry point for the Tokio runtime; logs failures before exit.
#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = run().await {
        error!("daemon exit: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    logging::init("info");
    host::lock_process_memory();

    let config_path =
        std::env::var("KEYWARDEN_SERVER_CONFIG").unwrap_or_else(|_| SERVER_CONFIG_PATH.to_string());
    let sysconfig = Sysconfig::load(&config_path)
        .with_context(|| format!("read configuration {config_path}"))?;
    let config = ServerConfig::from_sysconfig(&sysconfig)
        .with_context(|| format!("load configuration {config_path}"))?;

    info!("keywarden server booting (config: {config_path})");

    let store = DirStore::open(&config.keydb_dir)
        .with_context(|| format!("open key database {}", config.keydb_dir.display()))?;
    info!(
        "key database holds {} records ({})",
        store.len(),
        config.keydb_dir.display()
    );
    if let Some(kmip) = &config.kmip {
        warn!(
            "KMIP vault {:?} is configured; this build keeps key material in the directory store and leaves vault delegation to the external adapter",
            kmip.server_addrs
        );
    }

    let mailer = {
        let mailer = Mailer::from_sysconfig(&sysconfig);
        match mailer.validate() {
            Ok(()) => {
                info!(
                    "email notifications go from {} to {:?} via {}",
                    mailer.from_address, mailer.recipients, mailer.agent_address_port
                );
                Some(mailer)
            }
            Err(err) => {
                info!("email notifications are disabled: {err}");
                None
            }
        }
    };

    let acceptor = tls::build_acceptor(&config).context("prepare TLS listener identity")?;
    let listen_addr = format!("{}:{}", config.listen_address, config.listen_port);

    let service = Arc::new(KeyService::new(config, store, mailer));
    if service.check_initial_setup().is_err() {
        warn!("no access password is set yet; run `keywarden init-server` to finish setup");
    }

    let tcp_listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("listen on {listen_addr}"))?;
    info!("serving clients on {listen_addr} (TLS)");

    let unix_listener = bind_operator_socket(Path::new(SOCKET_PATH))
        .with_context(|| format!("bind operator socket {SOCKET_PATH}"))?;
    info!("serving operators on {SOCKET_PATH}");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tcp_task = tokio::spawn(serve_tcp(
        service.clone(),
        tcp_listener,
        acceptor,
        shutdown_rx.clone(),
    ));
    let unix_task = tokio::spawn(serve_unix(service, unix_listener, shutdown_rx));

    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received interrupt"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }

    // Stop accepting; in-flight handlers drain on their own tasks.
    let _ = shutdown_tx.send(true);
    let _ = tcp_task.await;
    let _ = unix_task.await;
    info!("key server stopped");
    Ok(())
}
