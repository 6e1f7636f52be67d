use crate::liquidity::LiquidityPolicy;
use crate::models::channel_close::ChannelCloseOutgoingPayment;
use crate::models::inbound_liquidity::InboundLiquidityOutgoingPayment;
use crate::models::incoming::ReceivedPart;
use crate::models::outgoing::{FinalFailure, OutgoingPartStatus, RouteHop};
use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;
use bitcoin::Txid;
use lightning_invoice::Bolt11Invoice;
use log::{error, info};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);
/// How long `pay_offer` may spend fetching the invoice from the recipient.
pub const FETCH_INVOICE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Closed,
    Connecting,
    Established,
}

/// Snapshot of one channel with the LSP.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    #[serde(with = "crate::models::hex_bytes")]
    pub channel_id: [u8; 32],
    pub state: String,
    pub balance_msat: u64,
    pub inbound_liquidity_msat: u64,
    pub capacity_sat: u64,
    pub funding_tx_id: Option<Txid>,
}

/// Funding rates advertised by the LSP for liquidity purchases.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingRate {
    pub min_amount_sat: u64,
    pub max_amount_sat: u64,
    pub service_fee_base_sat: u64,
    pub service_fee_proportional_ppm: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnChainFeerates {
    pub fastest_sat_vb: u64,
    pub hour_sat_vb: u64,
    pub day_sat_vb: u64,
}

/// Internal protocol events, as delivered by the engine. The event handler
/// turns them into persistence side-effects and external API events.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    PaymentReceived {
        payment_hash: [u8; 32],
        parts: Vec<ReceivedPart>,
    },
    /// A funding transaction was broadcast and seen; the channel is usable.
    FundingLocked {
        payment_hash: Option<[u8; 32]>,
        channel_id: [u8; 32],
        tx_id: Txid,
    },
    /// A funding transaction reached sufficient confirmation depth.
    FundingConfirmed {
        payment_hash: Option<[u8; 32]>,
        channel_id: [u8; 32],
        tx_id: Txid,
    },
    ChannelOpened {
        channel: ChannelInfo,
    },
    ChannelClosed {
        payment: ChannelCloseOutgoingPayment,
    },
    LiquidityPurchased {
        payment: InboundLiquidityOutgoingPayment,
    },
}

/// An invoice freshly issued by the engine, together with the preimage that
/// will settle it.
#[derive(Debug, Clone)]
pub struct GeneratedInvoice {
    pub invoice: Bolt11Invoice,
    pub preimage: [u8; 32],
}

#[derive(Debug, Clone)]
pub enum InvoiceDescription {
    Direct(String),
    Hash([u8; 32]),
}

/// Result of one HTLC attempt as reported by the engine.
#[derive(Debug, Clone)]
pub struct PartResult {
    pub part_id: Uuid,
    pub amount_msat: u64,
    pub route: Vec<RouteHop>,
    pub status: OutgoingPartStatus,
    pub created_at: i64,
}

/// Final outcome of an outgoing payment command.
#[derive(Debug, Clone)]
pub enum PayResult {
    Sent {
        payment_hash: [u8; 32],
        preimage: [u8; 32],
        recipient: PublicKey,
        recipient_amount_msat: u64,
        /// Set for BOLT12 payments, where the payer key is blinded per payment.
        payer_key: Option<PublicKey>,
        parts: Vec<PartResult>,
    },
    Failed {
        reason: FinalFailure,
        attempts: Vec<PartResult>,
    },
}

/// The external Lightning protocol engine. Channel state machines, HTLC
/// routing and the wire protocol live behind this boundary; the control
/// plane only issues commands and observes streams.
#[async_trait]
pub trait LightningEngine: Send + Sync + 'static {
    fn node_id(&self) -> PublicKey;

    /// Connects to the LSP, including the transport handshake. The
    /// supervisor bounds the whole call with the connect and handshake
    /// timeouts.
    async fn connect(&self) -> anyhow::Result<()>;

    async fn disconnect(&self);

    fn connection_state(&self) -> watch::Receiver<ConnectionState>;

    fn subscribe_node_events(&self) -> broadcast::Receiver<NodeEvent>;

    fn channels(&self) -> Vec<ChannelInfo>;

    /// Current non-refundable fee credit balance.
    fn fee_credit_msat(&self) -> u64;

    /// Installs the policy consulted for every funding attempt. The cell is
    /// single-writer many-reader; the engine only ever reads it.
    fn set_liquidity_policy(&self, policy: Arc<RwLock<LiquidityPolicy>>);

    async fn create_invoice(
        &self,
        amount_msat: Option<u64>,
        description: InvoiceDescription,
        expiry_secs: Option<u64>,
    ) -> anyhow::Result<GeneratedInvoice>;

    /// Reusable BOLT12 offer, opaque to the control plane.
    async fn get_offer(&self) -> anyhow::Result<String>;

    /// Lightning address hosted by the LSP, if the LSP offers one.
    async fn get_lightning_address(&self) -> anyhow::Result<Option<String>>;

    async fn pay_invoice(
        &self,
        payment_id: Uuid,
        invoice: &Bolt11Invoice,
        amount_msat: u64,
    ) -> anyhow::Result<PayResult>;

    /// Fetches an invoice from the offer (bounded by
    /// [`FETCH_INVOICE_TIMEOUT`]) and pays it.
    async fn pay_offer(
        &self,
        payment_id: Uuid,
        offer: &str,
        amount_msat: u64,
        payer_note: Option<String>,
    ) -> anyhow::Result<PayResult>;

    /// Splices funds out of the channel to an on-chain address. Returns the
    /// funding transaction id.
    async fn splice_out(
        &self,
        amount_sat: u64,
        address: &str,
        feerate_sat_vb: u64,
    ) -> anyhow::Result<Txid>;

    /// CPFP fee bump of the channel's unconfirmed funding chain.
    async fn splice_cpfp(&self, feerate_sat_vb: u64) -> anyhow::Result<Txid>;

    async fn estimate_cpfp_fee_sat(&self, feerate_sat_vb: u64) -> anyhow::Result<u64>;

    /// Mutual close, paying out to the given address. Returns the closing
    /// transaction id.
    async fn close_channel(
        &self,
        channel_id: [u8; 32],
        address: &str,
        feerate_sat_vb: u64,
    ) -> anyhow::Result<Txid>;

    async fn request_swap_in_address(&self) -> anyhow::Result<String>;

    async fn register_fcm_token(&self, token: &str) -> anyhow::Result<()>;

    async fn remote_funding_rates(&self) -> Option<Vec<FundingRate>>;

    fn onchain_feerates(&self) -> watch::Receiver<Option<OnChainFeerates>>;
}

/// Keeps one logical connection to the LSP alive forever: connect with
/// timeouts, wait for the connection to close, sleep, repeat. The first time
/// the connection is established a readiness gate unblocks.
pub struct PeerSupervisor {
    ready: watch::Receiver<bool>,
    handle: JoinHandle<()>,
}

impl PeerSupervisor {
    pub fn spawn(engine: Arc<dyn LightningEngine>, exit: watch::Receiver<bool>) -> PeerSupervisor {
        let (ready_tx, ready_rx) = watch::channel(false);
        let handle = tokio::spawn(reconnect_loop(engine, exit, ready_tx));
        PeerSupervisor {
            ready: ready_rx,
            handle,
        }
    }

    /// Resolves once the peer connection has been established at least once.
    pub async fn await_ready(&self) {
        let mut ready = self.ready.clone();
        while !*ready.borrow() {
            if ready.changed().await.is_err() {
                return;
            }
        }
    }

    pub async fn shutdown(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

async fn reconnect_loop(
    engine: Arc<dyn LightningEngine>,
    mut exit: watch::Receiver<bool>,
    ready_tx: watch::Sender<bool>,
) {
    let mut state = engine.connection_state();
    loop {
        if *exit.borrow() {
            return;
        }

        match timeout(CONNECT_TIMEOUT + HANDSHAKE_TIMEOUT, engine.connect()).await {
            Ok(Ok(())) => {
                info!("connected to peer {}", engine.node_id());
            }
            Ok(Err(e)) => {
                error!("failed to connect to peer: {e}");
            }
            Err(_) => {
                error!("connection to peer timed out");
            }
        }

        // Wait for the connection to settle into Closed, flipping the
        // readiness gate the first time it reaches Established.
        loop {
            let current = *state.borrow();
            if current == ConnectionState::Established && !*ready_tx.borrow() {
                let _ = ready_tx.send(true);
            }
            if current == ConnectionState::Closed {
                break;
            }
            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = exit.changed() => {
                    if *exit.borrow() {
                        return;
                    }
                }
            }
        }

        if *exit.borrow() {
            return;
        }
        tokio::select! {
            _ = sleep(RECONNECT_DELAY) => {}
            _ = exit.changed() => {
                if *exit.borrow() {
                    return;
                }
            }
        }
    }
}
