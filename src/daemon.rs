use crate::config::Config;
use crate::events::{EventBus, EventHandler, WebhookDispatcher};
use crate::lnurl::AddressResolver;
use crate::models::{open_pool, DbPool};
use crate::peer::{LightningEngine, PeerSupervisor};
use crate::server::{router, AppState, HttpAuth};
use bip39::Mnemonic;
use bitcoin::secp256k1::rand::rngs::OsRng;
use bitcoin::secp256k1::rand::RngCore;
use log::{error, info};
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// The assembled daemon: payments store, policy cell, peer supervisor,
/// event fan-out and HTTP surface, wired around the injected protocol
/// engine and address resolver.
pub struct Daemon {
    pub engine: Arc<dyn LightningEngine>,
    pub config: Arc<Config>,
    pub db_pool: DbPool,
    pub bus: EventBus,
    pub local_addr: SocketAddr,
    supervisor: PeerSupervisor,
    exit: watch::Sender<bool>,
    handler_handle: JoinHandle<()>,
    webhook_handle: Option<JoinHandle<()>>,
    http_shutdown: oneshot::Sender<()>,
    http_handle: JoinHandle<()>,
}

impl Daemon {
    pub async fn start(
        config: Config,
        engine: Arc<dyn LightningEngine>,
        resolver: Arc<dyn AddressResolver>,
    ) -> anyhow::Result<Daemon> {
        let config = Arc::new(config);

        let data_dir = config.data_dir();
        fs::create_dir_all(&data_dir)?;
        fs::create_dir_all(config.exports_dir())?;
        ensure_seed(&config.seed_path())?;
        let (full_password, limited_password) = ensure_passwords(&config)?;

        let db_pool = open_pool(&config.db_path(&engine.node_id()))?;

        let policy = Arc::new(RwLock::new(config.liquidity_policy()));
        engine.set_liquidity_policy(policy);

        let bus = EventBus::default();
        let (exit, exit_rx) = watch::channel(false);

        let handler = EventHandler {
            db_pool: db_pool.clone(),
            bus: bus.clone(),
        };
        let handler_handle = handler.spawn(engine.subscribe_node_events(), exit_rx.clone());

        let webhook_handle = config.webhook_secret.clone().map(|secret| {
            WebhookDispatcher {
                client: reqwest::Client::new(),
                urls: config.webhook.clone(),
                secret,
            }
            .spawn(bus.subscribe(), exit_rx.clone())
        });

        let supervisor = PeerSupervisor::spawn(engine.clone(), exit_rx);

        let state = AppState {
            engine: engine.clone(),
            resolver,
            db_pool: db_pool.clone(),
            bus: bus.clone(),
            config: config.clone(),
            auth: Arc::new(HttpAuth {
                full_password,
                limited_password,
            }),
        };
        let app = router(state);

        let listener = tokio::net::TcpListener::bind((
            config.http_bind_ip.as_str(),
            config.http_bind_port,
        ))
        .await?;
        let local_addr = listener.local_addr()?;

        let (http_shutdown, http_shutdown_rx) = oneshot::channel::<()>();
        let http_handle = tokio::spawn(async move {
            let shutdown = async {
                let _ = http_shutdown_rx.await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("http server error: {e}");
            }
        });

        info!("http api listening on {local_addr}");

        Ok(Daemon {
            engine,
            config,
            db_pool,
            bus,
            local_addr,
            supervisor,
            exit,
            handler_handle,
            webhook_handle,
            http_shutdown,
            http_handle,
        })
    }

    /// Resolves once the LSP connection has been established at least once.
    pub async fn await_ready(&self) {
        self.supervisor.await_ready().await
    }

    /// Graceful stop: cancel the reconnect loop and the listeners, ask the
    /// peer to disconnect, then stop the HTTP server and let in-flight
    /// requests drain.
    pub async fn stop(self) -> anyhow::Result<()> {
        info!("Shutting down");
        let _ = self.exit.send(true);
        self.supervisor.shutdown().await;
        let _ = self.handler_handle.await;
        if let Some(handle) = self.webhook_handle {
            let _ = handle.await;
        }

        self.engine.disconnect().await;

        let _ = self.http_shutdown.send(());
        let _ = self.http_handle.await;

        info!("Shut down complete");
        Ok(())
    }
}

/// Reads the 12-word seed backup, creating it on first run.
pub fn ensure_seed(path: &Path) -> anyhow::Result<Mnemonic> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Mnemonic::from_str(contents.trim())?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("Seed file not found, creating a new one");
            let mut entropy = [0u8; 16];
            OsRng.fill_bytes(&mut entropy);
            let mnemonic = Mnemonic::from_entropy(&entropy)?;
            fs::write(path, mnemonic.to_string())?;
            Ok(mnemonic)
        }
        Err(e) => Err(e.into()),
    }
}

fn random_password() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// API passwords come from the config when set, otherwise from the
/// key/value configuration file, generated on first run.
fn ensure_passwords(config: &Config) -> anyhow::Result<(String, Option<String>)> {
    if let Some(password) = &config.http_password {
        return Ok((
            password.clone(),
            config.http_password_limited_access.clone(),
        ));
    }

    let path = config.conf_path();
    let mut entries: HashMap<String, String> = match fs::read_to_string(&path) {
        Ok(contents) => contents
            .lines()
            .filter_map(|line| {
                line.split_once('=')
                    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            })
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
        Err(e) => return Err(e.into()),
    };

    let mut changed = false;
    let full = match entries.get("http-password") {
        Some(password) => password.clone(),
        None => {
            let password = random_password();
            entries.insert("http-password".to_string(), password.clone());
            changed = true;
            password
        }
    };
    let limited = match config.http_password_limited_access.clone() {
        Some(password) => password,
        None => match entries.get("http-password-limited-access") {
            Some(password) => password.clone(),
            None => {
                let password = random_password();
                entries.insert(
                    "http-password-limited-access".to_string(),
                    password.clone(),
                );
                changed = true;
                password
            }
        },
    };

    if changed {
        let mut lines: Vec<String> = entries
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        lines.sort();
        fs::write(&path, lines.join("\n") + "\n")?;
        info!("Generated http api passwords in {}", path.display());
    }

    Ok((full, Some(limited)))
}
