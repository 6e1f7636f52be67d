#![allow(dead_code)]

use async_trait::async_trait;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::rand::rngs::OsRng;
use bitcoin::secp256k1::rand::RngCore;
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use bitcoin::Txid;
use lightning::ln::PaymentSecret;
use lightning_invoice::{Bolt11Invoice, Currency, InvoiceBuilder};
use phoenixd::config::Config;
use phoenixd::daemon::Daemon;
use phoenixd::liquidity::LiquidityPolicy;
use phoenixd::lnurl::{
    AddressPayment, AddressResolver, Lnurl, LnurlAuth, LnurlPay, LnurlWithdraw,
};
use phoenixd::models::outgoing::{OutgoingPartStatus, RouteHop};
use phoenixd::models::{open_in_memory_pool, DbPool};
use phoenixd::peer::{
    ChannelInfo, ConnectionState, FundingRate, GeneratedInvoice, InvoiceDescription,
    LightningEngine, NodeEvent, OnChainFeerates, PartResult, PayResult,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

pub fn db() -> DbPool {
    open_in_memory_pool().expect("in-memory database")
}

pub fn random_bytes32() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

pub fn txid(byte: u8) -> Txid {
    Txid::from_byte_array([byte; 32])
}

pub fn channel_id(byte: u8) -> [u8; 32] {
    [byte; 32]
}

pub fn pubkey(byte: u8) -> PublicKey {
    let secp = Secp256k1::new();
    PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[byte; 32]).unwrap())
}

pub fn hop(a: u8, b: u8) -> RouteHop {
    RouteHop {
        node_a: pubkey(a),
        node_b: pubkey(b),
        short_channel_id: None,
    }
}

/// Scripted in-process stand-in for the protocol engine.
pub struct MockEngine {
    secret_key: SecretKey,
    node_id: PublicKey,
    secp: Secp256k1<All>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<NodeEvent>,
    feerates_tx: watch::Sender<Option<OnChainFeerates>>,
    fee_credit: AtomicU64,
    channels: Mutex<Vec<ChannelInfo>>,
    policy: Mutex<Option<Arc<RwLock<LiquidityPolicy>>>>,
    connect_failures: AtomicU32,
    pay_results: Mutex<VecDeque<PayResult>>,
}

impl MockEngine {
    pub fn new() -> Arc<MockEngine> {
        let secp = Secp256k1::new();
        let secret_key = SecretKey::from_slice(&[42u8; 32]).unwrap();
        let node_id = PublicKey::from_secret_key(&secp, &secret_key);
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        let (events_tx, _) = broadcast::channel(64);
        let (feerates_tx, _) = watch::channel(Some(OnChainFeerates {
            fastest_sat_vb: 20,
            hour_sat_vb: 10,
            day_sat_vb: 5,
        }));
        Arc::new(MockEngine {
            secret_key,
            node_id,
            secp,
            state_tx,
            events_tx,
            feerates_tx,
            fee_credit: AtomicU64::new(0),
            channels: Mutex::new(Vec::new()),
            policy: Mutex::new(None),
            connect_failures: AtomicU32::new(0),
            pay_results: Mutex::new(VecDeque::new()),
        })
    }

    pub fn emit(&self, event: NodeEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn set_fee_credit_msat(&self, msat: u64) {
        self.fee_credit.store(msat, Ordering::SeqCst);
    }

    pub fn set_channels(&self, channels: Vec<ChannelInfo>) {
        *self.channels.lock().unwrap() = channels;
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    pub fn script_pay_result(&self, result: PayResult) {
        self.pay_results.lock().unwrap().push_back(result);
    }

    pub fn installed_policy(&self) -> Option<Arc<RwLock<LiquidityPolicy>>> {
        self.policy.lock().unwrap().clone()
    }

    pub fn usable_channel(&self, balance_msat: u64) -> ChannelInfo {
        ChannelInfo {
            channel_id: channel_id(0xcc),
            state: "Normal".to_string(),
            balance_msat,
            inbound_liquidity_msat: 50_000_000,
            capacity_sat: 1_000_000,
            funding_tx_id: Some(txid(0xcc)),
        }
    }

    /// Builds a real signed invoice with an explicit creation timestamp.
    pub fn build_invoice_at(
        &self,
        amount_msat: Option<u64>,
        description: InvoiceDescription,
        expiry_secs: Option<u64>,
        timestamp: Duration,
    ) -> GeneratedInvoice {
        let preimage = random_bytes32();
        let payment_hash = sha256::Hash::hash(&preimage);
        let payment_secret = PaymentSecret(random_bytes32());

        let invoice = match description {
            InvoiceDescription::Direct(d) => {
                let builder = InvoiceBuilder::new(Currency::Regtest)
                    .description(d)
                    .payment_hash(payment_hash)
                    .payment_secret(payment_secret)
                    .duration_since_epoch(timestamp)
                    .min_final_cltv_expiry_delta(18);
                let builder = match amount_msat {
                    Some(msat) => builder.amount_milli_satoshis(msat),
                    None => builder,
                };
                let builder = match expiry_secs {
                    Some(secs) => builder.expiry_time(Duration::from_secs(secs)),
                    None => builder,
                };
                builder
                    .build_signed(|hash| self.secp.sign_ecdsa_recoverable(hash, &self.secret_key))
                    .expect("valid invoice")
            }
            InvoiceDescription::Hash(h) => {
                let builder = InvoiceBuilder::new(Currency::Regtest)
                    .description_hash(sha256::Hash::from_byte_array(h))
                    .payment_hash(payment_hash)
                    .payment_secret(payment_secret)
                    .duration_since_epoch(timestamp)
                    .min_final_cltv_expiry_delta(18);
                let builder = match amount_msat {
                    Some(msat) => builder.amount_milli_satoshis(msat),
                    None => builder,
                };
                let builder = match expiry_secs {
                    Some(secs) => builder.expiry_time(Duration::from_secs(secs)),
                    None => builder,
                };
                builder
                    .build_signed(|hash| self.secp.sign_ecdsa_recoverable(hash, &self.secret_key))
                    .expect("valid invoice")
            }
        };

        GeneratedInvoice {
            invoice,
            preimage,
        }
    }

    pub fn build_invoice(
        &self,
        amount_msat: Option<u64>,
        description: &str,
        expiry_secs: Option<u64>,
    ) -> GeneratedInvoice {
        self.build_invoice_at(
            amount_msat,
            InvoiceDescription::Direct(description.to_string()),
            expiry_secs,
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap(),
        )
    }
}

#[async_trait]
impl LightningEngine for MockEngine {
    fn node_id(&self) -> PublicKey {
        self.node_id
    }

    async fn connect(&self) -> anyhow::Result<()> {
        let failures = self.connect_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.connect_failures.store(failures - 1, Ordering::SeqCst);
            anyhow::bail!("connection refused");
        }
        let _ = self.state_tx.send(ConnectionState::Established);
        Ok(())
    }

    async fn disconnect(&self) {
        let _ = self.state_tx.send(ConnectionState::Closed);
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn subscribe_node_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events_tx.subscribe()
    }

    fn channels(&self) -> Vec<ChannelInfo> {
        self.channels.lock().unwrap().clone()
    }

    fn fee_credit_msat(&self) -> u64 {
        self.fee_credit.load(Ordering::SeqCst)
    }

    fn set_liquidity_policy(&self, policy: Arc<RwLock<LiquidityPolicy>>) {
        *self.policy.lock().unwrap() = Some(policy);
    }

    async fn create_invoice(
        &self,
        amount_msat: Option<u64>,
        description: InvoiceDescription,
        expiry_secs: Option<u64>,
    ) -> anyhow::Result<GeneratedInvoice> {
        Ok(self.build_invoice_at(
            amount_msat,
            description,
            expiry_secs,
            SystemTime::now().duration_since(UNIX_EPOCH)?,
        ))
    }

    async fn get_offer(&self) -> anyhow::Result<String> {
        Ok("lno1mockoffer".to_string())
    }

    async fn get_lightning_address(&self) -> anyhow::Result<Option<String>> {
        Ok(Some("mock@phoenix.test".to_string()))
    }

    async fn pay_invoice(
        &self,
        _payment_id: Uuid,
        invoice: &Bolt11Invoice,
        amount_msat: u64,
    ) -> anyhow::Result<PayResult> {
        if let Some(result) = self.pay_results.lock().unwrap().pop_front() {
            return Ok(result);
        }
        let preimage = random_bytes32();
        Ok(PayResult::Sent {
            payment_hash: invoice.payment_hash().to_byte_array(),
            preimage,
            recipient: invoice.recover_payee_pub_key(),
            recipient_amount_msat: amount_msat,
            payer_key: None,
            parts: vec![PartResult {
                part_id: Uuid::new_v4(),
                amount_msat,
                route: vec![hop(1, 2)],
                status: OutgoingPartStatus::Succeeded {
                    preimage,
                    completed_at: now_millis(),
                },
                created_at: now_millis(),
            }],
        })
    }

    async fn pay_offer(
        &self,
        _payment_id: Uuid,
        _offer: &str,
        amount_msat: u64,
        _payer_note: Option<String>,
    ) -> anyhow::Result<PayResult> {
        if let Some(result) = self.pay_results.lock().unwrap().pop_front() {
            return Ok(result);
        }
        let preimage = random_bytes32();
        Ok(PayResult::Sent {
            payment_hash: sha256::Hash::hash(&preimage).to_byte_array(),
            preimage,
            recipient: self.node_id,
            recipient_amount_msat: amount_msat,
            payer_key: Some(pubkey(9)),
            parts: vec![PartResult {
                part_id: Uuid::new_v4(),
                amount_msat,
                route: vec![hop(1, 2)],
                status: OutgoingPartStatus::Succeeded {
                    preimage,
                    completed_at: now_millis(),
                },
                created_at: now_millis(),
            }],
        })
    }

    async fn splice_out(
        &self,
        _amount_sat: u64,
        _address: &str,
        _feerate_sat_vb: u64,
    ) -> anyhow::Result<Txid> {
        Ok(txid(0xd1))
    }

    async fn splice_cpfp(&self, _feerate_sat_vb: u64) -> anyhow::Result<Txid> {
        Ok(txid(0xd2))
    }

    async fn estimate_cpfp_fee_sat(&self, feerate_sat_vb: u64) -> anyhow::Result<u64> {
        Ok(feerate_sat_vb * 110)
    }

    async fn close_channel(
        &self,
        _channel_id: [u8; 32],
        _address: &str,
        _feerate_sat_vb: u64,
    ) -> anyhow::Result<Txid> {
        Ok(txid(0xd3))
    }

    async fn request_swap_in_address(&self) -> anyhow::Result<String> {
        Ok("bcrt1qmockswapinaddress".to_string())
    }

    async fn register_fcm_token(&self, _token: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn remote_funding_rates(&self) -> Option<Vec<FundingRate>> {
        Some(vec![FundingRate {
            min_amount_sat: 100_000,
            max_amount_sat: 10_000_000,
            service_fee_base_sat: 1_000,
            service_fee_proportional_ppm: 10_000,
        }])
    }

    fn onchain_feerates(&self) -> watch::Receiver<Option<OnChainFeerates>> {
        self.feerates_tx.subscribe()
    }
}

/// Scripted address/LNURL resolver.
#[derive(Default)]
pub struct MockResolver {
    pub address_payment: Mutex<Option<AddressPayment>>,
    pub lnurl: Mutex<Option<Lnurl>>,
    pub pay_invoice: Mutex<Option<Bolt11Invoice>>,
}

impl MockResolver {
    pub fn new() -> Arc<MockResolver> {
        Arc::new(MockResolver::default())
    }

    pub fn script_address_payment(&self, payment: AddressPayment) {
        *self.address_payment.lock().unwrap() = Some(payment);
    }

    pub fn script_lnurl(&self, lnurl: Lnurl) {
        *self.lnurl.lock().unwrap() = Some(lnurl);
    }

    pub fn script_pay_invoice(&self, invoice: Bolt11Invoice) {
        *self.pay_invoice.lock().unwrap() = Some(invoice);
    }
}

#[async_trait]
impl AddressResolver for MockResolver {
    async fn resolve_address(
        &self,
        user: &str,
        domain: &str,
        _amount_msat: u64,
        _note: Option<&str>,
    ) -> anyhow::Result<AddressPayment> {
        self.address_payment
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow::anyhow!("no such address: {user}@{domain}"))
    }

    async fn execute_lnurl(&self, encoded: &str) -> anyhow::Result<Lnurl> {
        self.lnurl
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow::anyhow!("could not reach {encoded}"))
    }

    async fn get_lnurl_pay_invoice(
        &self,
        _pay: &LnurlPay,
        _amount_msat: u64,
        _comment: Option<&str>,
    ) -> anyhow::Result<Bolt11Invoice> {
        self.pay_invoice
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow::anyhow!("pay service unavailable"))
    }

    async fn send_withdraw_invoice(
        &self,
        _withdraw: &LnurlWithdraw,
        _invoice: &Bolt11Invoice,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn sign_and_send_auth_request(&self, _auth: &LnurlAuth) -> anyhow::Result<()> {
        Ok(())
    }
}

pub const FULL_PASSWORD: &str = "full-secret";
pub const LIMITED_PASSWORD: &str = "limited-secret";

pub struct TestDaemon {
    pub daemon: Daemon,
    pub engine: Arc<MockEngine>,
    pub resolver: Arc<MockResolver>,
    pub client: reqwest::Client,
    pub base_url: String,
    // keeps the data directory alive for the daemon's lifetime
    _data_dir: tempfile::TempDir,
}

impl TestDaemon {
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

pub async fn start_daemon() -> TestDaemon {
    start_daemon_with(|_| {}).await
}

pub async fn start_daemon_with(customize: impl FnOnce(&mut Config)) -> TestDaemon {
    let _ = pretty_env_logger::try_init();

    let data_dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config {
        data_dir: Some(data_dir.path().to_str().unwrap().to_string()),
        chain: "regtest".to_string(),
        http_bind_port: 0,
        http_password: Some(FULL_PASSWORD.to_string()),
        http_password_limited_access: Some(LIMITED_PASSWORD.to_string()),
        ..Default::default()
    };
    customize(&mut config);

    let engine = MockEngine::new();
    let resolver = MockResolver::new();
    let daemon = Daemon::start(config, engine.clone(), resolver.clone())
        .await
        .expect("daemon starts");
    let base_url = format!("http://{}", daemon.local_addr);

    TestDaemon {
        daemon,
        engine,
        resolver,
        client: reqwest::Client::new(),
        base_url,
        _data_dir: data_dir,
    }
}

pub fn now_millis() -> i64 {
    phoenixd::models::current_timestamp_millis()
}
