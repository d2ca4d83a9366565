//! keywarden command-line interface: server administration and client-side
//! encrypt/unlock tooling.

use anyhow::{ensure, Context, Result};
use clap::{Parser, Subcommand};
use keywarden_client::{
    auto_online_unlock, encrypt_device, erase_volume, offline_unlock, online_unlock,
    run_client_daemon, EncryptMode, EncryptOptions, KeyClient,
};
use keywarden_core::config::{
    ClientConfig, ServerConfig, CFG_CERT_DIR, CFG_KEYDB_DIR, CFG_LISTEN_ADDRESS, CFG_LISTEN_PORT,
    CFG_PASSWORD_HASH, CFG_PASSWORD_SALT, CFG_TLS_CA, CFG_TLS_CERT, CFG_TLS_KEY,
    CFG_TLS_VALIDATE_CLIENT, CLIENT_CONFIG_PATH, SERVER_CONFIG_PATH,
};
use keywarden_core::host;
use keywarden_core::keydb::{DirStore, RecordStore};
use keywarden_core::logging;
use keywarden_core::record::{
    split_comma_list, CommandContent, Record, ALIVE_INTERVAL_SEC, MIN_ALIVE_COUNT,
};
use keywarden_core::secret::{self, MIN_PASSWORD_LEN};
use keywarden_core::sysconfig::Sysconfig;
use keywarden_proto::CreateKeyRequest;
use log::warn;
use rpassword::prompt_password;
use std::path::PathBuf;
use std::sync::Arc;

const SERVER_UNIT: &str = "keywarden-server.service";

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "keywarden",
    version,
    about = "Encrypt and decrypt file systems using a network key server."
)]
struct Cli {
    /// Path to the server sysconfig file (server-side commands).
    #[arg(long, default_value = SERVER_CONFIG_PATH)]
    server_config: PathBuf,

    /// Path to the client sysconfig file (client-side commands).
    #[arg(long, default_value = CLIENT_CONFIG_PATH)]
    client_config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the key server daemon (delegates to the keywarden-daemon binary).
    Daemon,

    /// Store the access password and listener settings on this key server.
    InitServer {
        /// Access password; prompted for (with confirmation) when omitted.
        #[arg(long)]
        password: Option<String>,

        #[arg(long)]
        listen_address: Option<String>,

        #[arg(long)]
        listen_port: Option<u16>,

        /// PEM certificate presented by the TLS listener.
        #[arg(long)]
        tls_cert: Option<PathBuf>,

        /// PEM key matching --tls-cert.
        #[arg(long)]
        tls_key: Option<PathBuf>,

        /// Require clients to present certificates issued by --tls-ca.
        #[arg(long)]
        validate_client: bool,

        #[arg(long)]
        tls_ca: Option<PathBuf>,

        #[arg(long)]
        keydb_dir: Option<PathBuf>,

        #[arg(long)]
        cert_dir: Option<PathBuf>,
    },

    /// Show all key records, most recently used first.
    ListKeys,

    /// Display details of one key record (the key itself stays hidden).
    ShowKey { uuid: String },

    /// Update stored details of a key record.
    EditKey {
        uuid: String,

        #[arg(long)]
        mount_point: Option<String>,

        /// Comma-separated mount options.
        #[arg(long)]
        mount_options: Option<String>,

        #[arg(long)]
        max_active: Option<u32>,

        /// Liveness timeout in seconds; rounded to multiples of the 10 s
        /// reporting interval.
        #[arg(long)]
        alive_timeout_sec: Option<i64>,

        #[arg(long)]
        auto_encryption: Option<bool>,

        #[arg(long)]
        file_system: Option<String>,
    },

    /// Record a pending mount/umount command for one client host.
    SendCommand {
        #[arg(long)]
        uuid: String,

        /// IP address of the client that should execute the command.
        #[arg(long)]
        host_ip: String,

        /// mount or umount.
        #[arg(long, default_value = "umount")]
        command: String,

        /// Minutes until the command (and its result) expire.
        #[arg(long, default_value_t = 10)]
        expire_min: i64,
    },

    /// Drop all pending commands of a key record.
    ClearCommands {
        #[arg(long)]
        uuid: String,
    },

    /// Create a key record without touching any local disk.
    AddDevice {
        #[arg(long)]
        device_id: String,

        #[arg(long)]
        mapped_name: String,

        #[arg(long, default_value = "")]
        mount_point: String,

        /// Comma-separated mount options.
        #[arg(long, default_value = "")]
        mount_options: String,

        #[arg(long, default_value_t = 0)]
        max_active: u32,

        /// Comma-separated client identities allowed to auto-retrieve.
        #[arg(long, default_value = "")]
        allowed_clients: String,

        #[arg(long)]
        auto_encryption: bool,

        #[arg(long, default_value = "")]
        file_system: String,
    },

    /// Allow more clients to access a device.
    AddAllowedClient {
        #[arg(long)]
        uuid: String,

        /// Comma-separated client identities.
        #[arg(long)]
        clients: String,
    },

    /// Remove clients from the access list of a device.
    RemoveAllowedClient {
        #[arg(long)]
        uuid: String,

        /// Comma-separated client identities.
        #[arg(long)]
        clients: String,
    },

    /// List the clients which may access a device.
    ListAllowedClients {
        #[arg(long)]
        uuid: String,
    },

    /// Run the client daemon: unlock managed volumes, report liveness, and
    /// poll for operator commands.
    ClientDaemon,

    /// Set up a new encrypted file system on a blank device.
    Encrypt(EncryptArgs),

    /// Encrypt an existing file system in place (shrink it beforehand).
    InplaceEncrypt(EncryptArgs),

    /// Unlock one registered device without a password, retrying until the
    /// server grants the key.
    AutoUnlock {
        uuid: String,

        #[arg(long, default_value_t = keywarden_client::routines::DEFAULT_MAX_RETRY_SEC)]
        max_retry_sec: i64,
    },

    /// Unlock every locked encrypted file system using the server password.
    OnlineUnlock,

    /// Unlock a file system from an exported key record file.
    OfflineUnlock {
        #[arg(long)]
        record_file: PathBuf,
    },

    /// Wipe a volume's encryption header and erase its server-side key.
    Erase {
        uuid: String,

        #[arg(long)]
        mapped_name: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
struct EncryptArgs {
    /// Block device to encrypt, e.g. /dev/sdb1.
    #[arg(long)]
    device: String,

    #[arg(long)]
    mapped_name: String,

    #[arg(long, default_value = "")]
    mount_point: String,

    /// Comma-separated mount options.
    #[arg(long, default_value = "")]
    mount_options: String,

    #[arg(long, default_value_t = 0)]
    max_active: u32,

    /// Comma-separated client identities allowed to auto-retrieve.
    #[arg(long, default_value = "")]
    allowed_clients: String,

    /// Let clients LUKS-format the device on first use.
    #[arg(long)]
    auto_encryption: bool,

    /// File system to create (ext3/ext4/xfs/btrfs).
    #[arg(long, default_value = "ext4")]
    file_system: String,
}

/// Entry point: parse arguments and surface errors with an exit code.
fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    logging::init("info");
    host::lock_process_memory();
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon => {
            let status = std::process::Command::new("keywarden-daemon")
                .status()
                .context("launch keywarden-daemon (is it installed next to this binary?)")?;
            ensure!(status.success(), "keywarden-daemon exited with {status}");
        }
        Commands::InitServer {
            password,
            listen_address,
            listen_port,
            tls_cert,
            tls_key,
            validate_client,
            tls_ca,
            keydb_dir,
            cert_dir,
        } => {
            init_server(
                &cli.server_config,
                password,
                listen_address,
                listen_port,
                tls_cert,
                tls_key,
                validate_client,
                tls_ca,
                keydb_dir,
                cert_dir,
            )?;
        }
        Commands::ListKeys => {
            let config = load_server_config(&cli.server_config)?;
            let store = DirStore::open(&config.keydb_dir)?;
            print_key_table(store.list());
        }
        Commands::ShowKey { uuid } => {
            let config = load_server_config(&cli.server_config)?;
            let store = DirStore::open_one(&config.keydb_dir, &uuid)?;
            let mut rec = store
                .get_by_uuid(&uuid)
                .with_context(|| format!("no key record for {uuid}"))?;
            rec.remove_dead_hosts(host::unix_now());
            print_record_details(&rec);
        }
        Commands::EditKey {
            uuid,
            mount_point,
            mount_options,
            max_active,
            alive_timeout_sec,
            auto_encryption,
            file_system,
        } => {
            let config = load_server_config(&cli.server_config)?;
            let store = DirStore::open_one(&config.keydb_dir, &uuid)?;
            let mut rec = store
                .get_by_uuid(&uuid)
                .with_context(|| format!("no key record for {uuid}"))?;

            let mut changed = false;
            if let Some(value) = mount_point {
                rec.mount_point = value;
                changed = true;
            }
            if let Some(value) = mount_options {
                rec.mount_options = split_comma_list(&value);
                changed = true;
            }
            if let Some(value) = max_active {
                rec.max_active = value;
                changed = true;
            }
            if let Some(value) = alive_timeout_sec {
                // Rounding is a convenience of this editing flow, not a rule
                // of the liveness protocol.
                let rounded = (value / ALIVE_INTERVAL_SEC) * ALIVE_INTERVAL_SEC;
                if rounded != value {
                    println!("Alive timeout rounded down to {rounded} seconds.");
                }
                let count = (rounded / ALIVE_INTERVAL_SEC).max(MIN_ALIVE_COUNT);
                rec.alive_count = count;
                changed = true;
            }
            if let Some(value) = auto_encryption {
                rec.auto_encryption = value;
                changed = true;
            }
            if let Some(value) = file_system {
                rec.file_system = value;
                changed = true;
            }

            if !changed {
                println!("No fields were changed; pass at least one --option.");
                return Ok(());
            }
            update_record(&store, rec)?;
        }
        Commands::SendCommand {
            uuid,
            host_ip,
            command,
            expire_min,
        } => {
            ensure!(
                (1..=10_080).contains(&expire_min),
                "--expire-min must be between 1 minute and one week"
            );
            let content: CommandContent = command.parse().map_err(anyhow::Error::new)?;
            let password = prompt_password("Enter key server's password (no echo): ")?;

            // Prove the password against the running server first.
            let operator = KeyClient::over_local_socket();
            operator.ping(Some(&password)).map_err(anyhow::Error::new)?;

            let config = load_server_config(&cli.server_config)?;
            let store = DirStore::open_one(&config.keydb_dir, &uuid)?;
            let mut rec = store
                .get_by_uuid(&uuid)
                .with_context(|| format!("no key record for {uuid}"))?;
            rec.add_pending_command(&host_ip, content, host::unix_now(), expire_min * 60);
            store.upsert(rec).map_err(anyhow::Error::new)?;

            operator
                .reload_record(&uuid, &password)
                .map_err(anyhow::Error::new)?;
            println!(
                "All done. Host {host_ip} will receive the command on its next poll."
            );
        }
        Commands::ClearCommands { uuid } => {
            let password = prompt_password("Enter key server's password (no echo): ")?;
            let operator = KeyClient::over_local_socket();
            operator.ping(Some(&password)).map_err(anyhow::Error::new)?;

            let config = load_server_config(&cli.server_config)?;
            let store = DirStore::open_one(&config.keydb_dir, &uuid)?;
            let mut rec = store
                .get_by_uuid(&uuid)
                .with_context(|| format!("no key record for {uuid}"))?;
            rec.clear_pending_commands();
            store.upsert(rec).map_err(anyhow::Error::new)?;

            operator
                .reload_record(&uuid, &password)
                .map_err(anyhow::Error::new)?;
            println!("All pending commands of {uuid} have been cleared.");
        }
        Commands::AddDevice {
            device_id,
            mapped_name,
            mount_point,
            mount_options,
            max_active,
            allowed_clients,
            auto_encryption,
            file_system,
        } => {
            let password = prompt_password("Enter key server's password (no echo): ")?;
            let (hostname, _) = host::hostname_and_ip();
            let operator = KeyClient::over_local_socket();
            let rec = operator
                .create_key(CreateKeyRequest {
                    uuid: device_id,
                    hostname,
                    mapped_name,
                    mount_point,
                    mount_options: split_comma_list(&mount_options),
                    max_active,
                    allowed_clients: split_comma_list(&allowed_clients).into_iter().collect(),
                    auto_encryption,
                    file_system,
                    password,
                })
                .map_err(anyhow::Error::new)?;
            println!("Created key record {} (ID {}).", rec.uuid, rec.id);
        }
        Commands::AddAllowedClient { uuid, clients } => {
            let config = load_server_config(&cli.server_config)?;
            let store = DirStore::open_one(&config.keydb_dir, &uuid)?;
            let mut rec = store
                .get_by_uuid(&uuid)
                .with_context(|| format!("no key record for {uuid}"))?;
            let mut changed = false;
            for client in split_comma_list(&clients) {
                if rec.add_allowed_client(&client) {
                    println!("Added {client}.");
                    changed = true;
                } else {
                    println!("Nothing to do, {client} is already allowed.");
                }
            }
            if changed {
                update_record(&store, rec)?;
            }
        }
        Commands::RemoveAllowedClient { uuid, clients } => {
            let config = load_server_config(&cli.server_config)?;
            let store = DirStore::open_one(&config.keydb_dir, &uuid)?;
            let mut rec = store
                .get_by_uuid(&uuid)
                .with_context(|| format!("no key record for {uuid}"))?;
            let mut changed = false;
            for client in split_comma_list(&clients) {
                if rec.remove_allowed_client(&client) {
                    println!("Removed {client}.");
                    changed = true;
                } else {
                    println!("Nothing to do, {client} was not allowed.");
                }
            }
            if changed {
                update_record(&store, rec)?;
            }
        }
        Commands::ListAllowedClients { uuid } => {
            let config = load_server_config(&cli.server_config)?;
            let store = DirStore::open_one(&config.keydb_dir, &uuid)?;
            let rec = store
                .get_by_uuid(&uuid)
                .with_context(|| format!("no key record for {uuid}"))?;
            if rec.allowed_clients.is_empty() {
                println!("{uuid}: any authenticated client may retrieve this key.");
            } else {
                println!("{uuid}: {}", rec.allowed_clients_str());
            }
        }
        Commands::ClientDaemon => {
            let client = Arc::new(tls_client(&cli.client_config)?);
            let runtime = tokio::runtime::Runtime::new().context("start async runtime")?;
            runtime.block_on(async move {
                let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
                tokio::spawn(async move {
                    let _ = tokio::signal::ctrl_c().await;
                    let _ = shutdown_tx.send(true);
                });
                run_client_daemon(client, shutdown_rx).await
            })?;
        }
        Commands::Encrypt(args) => {
            let rec = run_encrypt(&cli.client_config, args, EncryptMode::Fresh)?;
            println!(
                "Device encrypted; key record {} is stored on the server.",
                rec.uuid
            );
        }
        Commands::InplaceEncrypt(args) => {
            let rec = run_encrypt(&cli.client_config, args, EncryptMode::InPlace)?;
            println!(
                "File system encrypted in place; key record {} is stored on the server.",
                rec.uuid
            );
        }
        Commands::AutoUnlock {
            uuid,
            max_retry_sec,
        } => {
            let client = tls_client(&cli.client_config)?;
            let rec = auto_online_unlock(&client, &uuid, max_retry_sec)?;
            if rec.mount_point.is_empty() {
                println!("Volume {uuid} unlocked.");
            } else {
                println!("Volume {uuid} unlocked and mounted on {}.", rec.mount_point);
            }
            println!("Run `keywarden client-daemon` to keep reporting liveness for it.");
        }
        Commands::OnlineUnlock => {
            let client = tls_client(&cli.client_config)?;
            let password = prompt_password("Enter key server's password (no echo): ")?;
            let summary = online_unlock(&client, &password)?;
            for uuid in &summary.unlocked {
                println!("Unlocked {uuid}.");
            }
            for (uuid, reason) in &summary.failed {
                println!("Failed to unlock {uuid}: {reason}");
            }
            if !summary.missing.is_empty() {
                println!("The server has no keys for:");
                for uuid in &summary.missing {
                    println!("  - {uuid}");
                }
            }
            ensure!(
                summary.failed.is_empty(),
                "some encrypted file systems could not be unlocked"
            );
        }
        Commands::OfflineUnlock { record_file } => {
            let report = offline_unlock(&record_file)?;
            if report.mounted {
                println!("Volume unlocked and mounted (mapper {}).", report.mapper_name);
            } else {
                println!("Volume unlocked (mapper {}).", report.mapper_name);
            }
        }
        Commands::Erase { uuid, mapped_name } => {
            let client = tls_client(&cli.client_config)?;
            let password = prompt_password("Enter key server's password (no echo): ")?;
            erase_volume(&client, &uuid, mapped_name.as_deref(), &password)?;
            println!("Encryption header wiped; data on {uuid} is irreversibly lost.");
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn init_server(
    config_path: &PathBuf,
    password: Option<String>,
    listen_address: Option<String>,
    listen_port: Option<u16>,
    tls_cert: Option<PathBuf>,
    tls_key: Option<PathBuf>,
    validate_client: bool,
    tls_ca: Option<PathBuf>,
    keydb_dir: Option<PathBuf>,
    cert_dir: Option<PathBuf>,
) -> Result<()> {
    let mut sysconfig = Sysconfig::load(config_path).map_err(anyhow::Error::new)?;
    let reconfigure = !sysconfig.get_str(CFG_PASSWORD_HASH, "").is_empty();
    if reconfigure {
        println!("Re-configuring an already initialised key server.");
    }

    let password = match password {
        Some(value) => value,
        None => loop {
            let first = prompt_password(format!(
                "Access password (min. {MIN_PASSWORD_LEN} chars, no echo): "
            ))?;
            if first.len() < MIN_PASSWORD_LEN {
                println!("Password is too short, please enter at least {MIN_PASSWORD_LEN} characters.");
                continue;
            }
            let confirm = prompt_password("Confirm access password (no echo): ")?;
            if first == confirm {
                break first;
            }
            println!("Passwords do not match.");
        },
    };
    ensure!(
        password.len() >= MIN_PASSWORD_LEN,
        "the access password needs at least {MIN_PASSWORD_LEN} characters"
    );

    let salt = secret::generate_salt().map_err(anyhow::Error::new)?;
    let hash = secret::hash_access_password(&salt, &password);
    sysconfig.set(CFG_PASSWORD_SALT, hex::encode(salt));
    sysconfig.set(CFG_PASSWORD_HASH, hex::encode(hash));

    if let Some(value) = listen_address {
        sysconfig.set(CFG_LISTEN_ADDRESS, value);
    }
    if let Some(value) = listen_port {
        sysconfig.set_int(CFG_LISTEN_PORT, value);
    }
    if let Some(value) = tls_cert {
        sysconfig.set(CFG_TLS_CERT, value.display().to_string());
    }
    if let Some(value) = tls_key {
        sysconfig.set(CFG_TLS_KEY, value.display().to_string());
    }
    if validate_client {
        sysconfig.set_bool(CFG_TLS_VALIDATE_CLIENT, true);
        let ca = tls_ca.context("--validate-client requires --tls-ca")?;
        sysconfig.set(CFG_TLS_CA, ca.display().to_string());
    } else if let Some(ca) = tls_ca {
        sysconfig.set(CFG_TLS_CA, ca.display().to_string());
    }
    if let Some(value) = keydb_dir {
        sysconfig.set(CFG_KEYDB_DIR, value.display().to_string());
    }
    if let Some(value) = cert_dir {
        sysconfig.set(CFG_CERT_DIR, value.display().to_string());
    }

    // Fail early if the combination is unusable.
    ServerConfig::from_sysconfig(&sysconfig).map_err(anyhow::Error::new)?;
    sysconfig.save(config_path).map_err(anyhow::Error::new)?;
    println!("Settings saved to {}.", config_path.display());

    if host::systemctl_is_running(SERVER_UNIT) {
        println!("Restarting {SERVER_UNIT} to apply the new settings...");
        host::systemctl_enable_restart(SERVER_UNIT).map_err(anyhow::Error::new)?;
        println!("All done.");
    } else {
        println!("Start the server with: systemctl enable --now {SERVER_UNIT}");
    }
    Ok(())
}

fn run_encrypt(
    client_config: &PathBuf,
    args: EncryptArgs,
    mode: EncryptMode,
) -> Result<Record> {
    let client = tls_client(client_config)?;
    let password = prompt_password("Enter key server's password (no echo): ")?;
    let opts = EncryptOptions {
        device_path: args.device,
        mapped_name: args.mapped_name,
        mount_point: args.mount_point,
        mount_options: split_comma_list(&args.mount_options),
        max_active: args.max_active,
        allowed_clients: split_comma_list(&args.allowed_clients).into_iter().collect(),
        auto_encryption: args.auto_encryption,
        file_system: args.file_system,
        mode,
    };
    Ok(encrypt_device(&client, &opts, &password)?)
}

fn load_server_config(path: &PathBuf) -> Result<ServerConfig> {
    let sysconfig = Sysconfig::load(path)
        .with_context(|| format!("read configuration {}", path.display()))?;
    ServerConfig::from_sysconfig(&sysconfig)
        .with_context(|| format!("load configuration {}", path.display()))
}

fn tls_client(path: &PathBuf) -> Result<KeyClient> {
    let sysconfig = Sysconfig::load(path)
        .with_context(|| format!("read configuration {}", path.display()))?;
    let config = ClientConfig::from_sysconfig(&sysconfig)
        .with_context(|| format!("load configuration {}", path.display()))?;
    KeyClient::from_client_config(&config).map_err(anyhow::Error::new)
}

/// Persist a record edited on disk and nudge the running server to pick the
/// change up; probe failures are tolerated.
fn update_record(store: &DirStore, rec: Record) -> Result<()> {
    let uuid = rec.uuid.clone();
    store.upsert(rec).map_err(anyhow::Error::new)?;
    println!("Record {uuid} has been updated.");
    if host::systemctl_is_running(SERVER_UNIT) {
        println!("Restarting key server to reload its records...");
        if let Err(err) = host::systemctl_enable_restart(SERVER_UNIT) {
            warn!("could not restart {SERVER_UNIT}: {err}");
        }
    }
    Ok(())
}

fn format_time(timestamp: i64) -> String {
    if timestamp <= 0 {
        return "-".to_string();
    }
    chrono::DateTime::from_timestamp(timestamp, 0)
        .map(|when| when.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

fn print_key_table(records: Vec<Record>) {
    println!("Total: {} records (times in UTC)", records.len());
    println!(
        "{:<15} {:<19} {:<12} {:<36} {:>10} {:>14} {:>11} {:>8} Mount.Point",
        "Used By", "When", "ID", "UUID", "Max.Client", "Allowed.Client", "Act.Client", "Key.Len"
    );
    let now = host::unix_now();
    for mut rec in records {
        rec.remove_dead_hosts(now);
        println!(
            "{:<15} {:<19} {:<12} {:<36} {:>10} {:>14} {:>11} {:>8} {}",
            rec.last_retrieval.ip,
            format_time(rec.last_retrieval.timestamp),
            rec.id,
            rec.uuid,
            rec.max_active,
            rec.allowed_clients.len(),
            rec.active_host_count(),
            rec.key.len(),
            rec.mount_point,
        );
    }
}

fn print_record_details(rec: &Record) {
    println!("{:<34}{}", "UUID", rec.uuid);
    println!("{:<34}{}", "ID", rec.id);
    println!("{:<34}{}", "Mapped Name", rec.mapped_name);
    println!("{:<34}{}", "Mount Point", rec.mount_point);
    println!("{:<34}{}", "Mount Options", rec.mount_options_str());
    println!("{:<34}{}", "Allowed Clients", rec.allowed_clients_str());
    println!("{:<34}{}", "Maximum Computers", rec.max_active);
    println!("{:<34}{}", "Auto Encryption", rec.auto_encryption);
    println!("{:<34}{}", "File System", rec.file_system);
    println!("{:<34}{}", "Key Length (bytes)", rec.key.len());
    println!(
        "{:<34}{}",
        "Keep-Alive Timeout (sec)",
        rec.alive_window_secs()
    );
    println!(
        "{:<34}{} ({})",
        "Last Retrieved By", rec.last_retrieval.ip, rec.last_retrieval.hostname
    );
    println!(
        "{:<34}{}",
        "Last Retrieved On",
        format_time(rec.last_retrieval.timestamp)
    );
    println!("{:<34}{}", "Current Active Computers", rec.active_host_count());
    for messages in rec.alive_messages.values() {
        for msg in messages {
            println!(
                "{:<34}{} {} ({})",
                "",
                format_time(msg.timestamp),
                msg.ip,
                msg.hostname
            );
        }
    }
    let pending: usize = rec.pending_commands.values().map(Vec::len).sum();
    println!("{:<34}{}", "Pending Commands", pending);
    for (ip, commands) in &rec.pending_commands {
        for cmd in commands {
            println!(
                "{:>45}\tValidFrom=\"{}\"\tValidTo=\"{}\"\tContent=\"{}\"\tFetched? {}\tResult=\"{}\"",
                ip,
                format_time(cmd.valid_from),
                format_time(cmd.valid_from + cmd.validity_secs),
                cmd.content,
                cmd.seen_by_client,
                cmd.client_result,
            );
        }
    }
}
