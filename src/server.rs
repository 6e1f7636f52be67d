use crate::config::Config;
use crate::events::EventBus;
use crate::export;
use crate::lnurl::{AddressPayment, AddressResolver, Lnurl};
use crate::models::incoming::{incoming_payment_id, IncomingOrigin, IncomingPayment};
use crate::models::metadata::PaymentMetadata;
use crate::models::outgoing::{
    LightningOutgoingPayment, OutgoingDetails, OutgoingPart, OutgoingPartStatus, OutgoingStatus,
};
use crate::models::{current_timestamp_millis, DbPool, PaymentType};
use crate::peer::{InvoiceDescription, LightningEngine, PartResult, PayResult};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, Request, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Form, Json, Router};
use bitcoin::hashes::Hash;
use futures::{SinkExt, StreamExt};
use lightning_invoice::Bolt11Invoice;
use log::error;
use serde_json::json;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Passwords for the two authorization tiers. The read tier accepts either
/// password; the full tier requires the primary one.
pub struct HttpAuth {
    pub full_password: String,
    pub limited_password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    Full,
    Limited,
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<dyn LightningEngine>,
    pub resolver: Arc<dyn AddressResolver>,
    pub db_pool: DbPool,
    pub bus: EventBus,
    pub config: Arc<Config>,
    pub auth: Arc<HttpAuth>,
}

impl AppState {
    fn conn(
        &self,
    ) -> Result<
        diesel::r2d2::PooledConnection<diesel::r2d2::ConnectionManager<diesel::SqliteConnection>>,
        ApiError,
    > {
        self.db_pool
            .get()
            .map_err(|e| ApiError::Internal(e.into()))
    }
}

#[derive(Debug)]
pub enum ApiError {
    MissingParam(&'static str),
    InvalidParam {
        name: &'static str,
        expected: &'static str,
    },
    BadRequest(String),
    Unauthorized,
    NotFound(&'static str),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> ApiError {
        ApiError::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::MissingParam(name) => {
                (StatusCode::BAD_REQUEST, format!("missing parameter {name}")).into_response()
            }
            ApiError::InvalidParam { name, expected } => (
                StatusCode::BAD_REQUEST,
                format!("invalid parameter {name}: expected {expected}"),
            )
                .into_response(),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic")],
                "unauthorized",
            )
                .into_response(),
            ApiError::NotFound(what) => {
                (StatusCode::NOT_FOUND, format!("{what} not found")).into_response()
            }
            ApiError::Internal(e) => {
                error!("internal error: {e:?}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
            }
        }
    }
}

fn require_full(level: AccessLevel) -> Result<(), ApiError> {
    match level {
        AccessLevel::Full => Ok(()),
        AccessLevel::Limited => Err(ApiError::Unauthorized),
    }
}

fn check_password(candidate: &str, auth: &HttpAuth) -> Option<AccessLevel> {
    if candidate == auth.full_password {
        Some(AccessLevel::Full)
    } else if auth.limited_password.as_deref() == Some(candidate) {
        Some(AccessLevel::Limited)
    } else {
        None
    }
}

/// HTTP Basic, with the WebSocket subprotocol header as an alternate channel
/// for the password. The username is ignored.
fn authenticate(headers: &HeaderMap, auth: &HttpAuth) -> Result<AccessLevel, ApiError> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(encoded) = value.strip_prefix("Basic ") {
            if let Ok(decoded) = base64::decode(encoded.trim()) {
                if let Ok(text) = String::from_utf8(decoded) {
                    let password = text.split_once(':').map(|(_, p)| p).unwrap_or(&text);
                    if let Some(level) = check_password(password, auth) {
                        return Ok(level);
                    }
                }
            }
        }
    }

    if let Some(protocols) = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
    {
        for candidate in protocols.split(',') {
            if let Some(level) = check_password(candidate.trim(), auth) {
                return Ok(level);
            }
        }
    }

    Err(ApiError::Unauthorized)
}

async fn auth_middleware(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    match authenticate(req.headers(), &state.auth) {
        Ok(level) => {
            req.extensions_mut().insert(level);
            next.run(req).await
        }
        Err(e) => e.into_response(),
    }
}

/// Form or query parameters with explicit typed getters. Every coercion
/// failure names the parameter and the expected type.
struct Params(HashMap<String, String>);

impl Params {
    fn from_form(form: Option<Form<HashMap<String, String>>>) -> Params {
        Params(form.map(|Form(map)| map).unwrap_or_default())
    }

    fn from_query(query: Query<HashMap<String, String>>) -> Params {
        let Query(map) = query;
        Params(map)
    }

    fn opt_str(&self, name: &'static str) -> Option<&str> {
        self.0.get(name).map(|s| s.as_str()).filter(|s| !s.is_empty())
    }

    fn require_str(&self, name: &'static str) -> Result<&str, ApiError> {
        self.opt_str(name).ok_or(ApiError::MissingParam(name))
    }

    fn opt_u64(&self, name: &'static str) -> Result<Option<u64>, ApiError> {
        match self.opt_str(name) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| ApiError::InvalidParam {
                name,
                expected: "non-negative integer",
            }),
        }
    }

    fn require_u64(&self, name: &'static str) -> Result<u64, ApiError> {
        self.opt_u64(name)?.ok_or(ApiError::MissingParam(name))
    }

    fn opt_bool(&self, name: &'static str) -> Result<Option<bool>, ApiError> {
        match self.opt_str(name) {
            None => Ok(None),
            Some("true") => Ok(Some(true)),
            Some("false") => Ok(Some(false)),
            Some(_) => Err(ApiError::InvalidParam {
                name,
                expected: "boolean",
            }),
        }
    }

    fn hex32(&self, name: &'static str) -> Result<Option<[u8; 32]>, ApiError> {
        match self.opt_str(name) {
            None => Ok(None),
            Some(raw) => parse_hex32(raw).map(Some).map_err(|_| ApiError::InvalidParam {
                name,
                expected: "32-byte hex string",
            }),
        }
    }
}

fn parse_hex32(raw: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = hex::decode(raw)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected 32 bytes"))
}

fn parse_invoice(raw: &str) -> Result<Bolt11Invoice, ApiError> {
    let raw = raw.trim();
    let raw = raw.strip_prefix("lightning:").unwrap_or(raw);
    Bolt11Invoice::from_str(raw).map_err(|_| ApiError::InvalidParam {
        name: "invoice",
        expected: "BOLT11 invoice",
    })
}

fn parse_onchain_address(raw: &str, network: bitcoin::Network) -> Result<String, ApiError> {
    let invalid = ApiError::InvalidParam {
        name: "address",
        expected: "bitcoin address for the node's chain",
    };
    let address = bitcoin::Address::from_str(raw).map_err(|_| invalid)?;
    let address = address.require_network(network).map_err(|_| ApiError::InvalidParam {
        name: "address",
        expected: "bitcoin address for the node's chain",
    })?;
    Ok(address.to_string())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/getinfo", get(get_info))
        .route("/getbalance", get(get_balance))
        .route("/listchannels", get(list_channels))
        .route("/createinvoice", post(create_invoice))
        .route("/getoffer", post(get_offer))
        .route("/getlnaddress", post(get_ln_address))
        .route("/decodeinvoice", post(decode_invoice))
        .route("/decodeoffer", post(decode_offer))
        .route("/payinvoice", post(pay_invoice))
        .route("/payoffer", post(pay_offer))
        .route("/paylnaddress", post(pay_ln_address))
        .route("/lnurlpay", post(lnurl_pay))
        .route("/lnurlwithdraw", post(lnurl_withdraw))
        .route("/lnurlauth", post(lnurl_auth))
        .route("/sendtoaddress", post(send_to_address))
        .route("/bumpfee", post(bump_fee))
        .route("/closechannel", post(close_channel))
        .route("/payments/incoming", get(list_incoming))
        .route("/payments/incoming/:paymentHash", get(get_incoming))
        .route("/payments/outgoing", get(list_outgoing))
        .route("/payments/outgoing/:paymentId", get(get_outgoing))
        .route("/payments/outgoingbyhash/:paymentHash", get(list_outgoing_by_hash))
        .route("/export", get(export_payments))
        .route("/websocket", get(websocket_handler))
        .fallback(fallback)
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}

async fn fallback() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found")
}

async fn get_info(State(state): State<AppState>) -> Result<Response, ApiError> {
    Ok(Json(json!({
        "nodeId": state.engine.node_id().to_string(),
        "chain": state.config.chain,
        "version": env!("CARGO_PKG_VERSION"),
        "channels": state.engine.channels(),
    }))
    .into_response())
}

async fn get_balance(State(state): State<AppState>) -> Result<Response, ApiError> {
    let balance_msat: u64 = state
        .engine
        .channels()
        .iter()
        .map(|c| c.balance_msat)
        .sum();
    Ok(Json(json!({
        "balanceSat": balance_msat / 1_000,
        "feeCreditSat": state.engine.fee_credit_msat() / 1_000,
    }))
    .into_response())
}

async fn list_channels(State(state): State<AppState>) -> Result<Response, ApiError> {
    Ok(Json(state.engine.channels()).into_response())
}

async fn create_invoice(
    State(state): State<AppState>,
    form: Option<Form<HashMap<String, String>>>,
) -> Result<Response, ApiError> {
    let p = Params::from_form(form);

    let description = match (p.opt_str("description"), p.hex32("descriptionHash")?) {
        (Some(d), None) => {
            if d.chars().count() > 128 {
                return Err(ApiError::InvalidParam {
                    name: "description",
                    expected: "string of at most 128 characters",
                });
            }
            InvoiceDescription::Direct(d.to_string())
        }
        (None, Some(h)) => InvoiceDescription::Hash(h),
        (None, None) => return Err(ApiError::MissingParam("description")),
        (Some(_), Some(_)) => {
            return Err(ApiError::BadRequest(
                "must provide either description or descriptionHash, not both".to_string(),
            ))
        }
    };

    let amount_sat = p.opt_u64("amountSat")?;
    let expiry_secs = p.opt_u64("expirySeconds")?;

    let generated = state
        .engine
        .create_invoice(amount_sat.map(|s| s * 1_000), description, expiry_secs)
        .await?;
    let payment_hash: [u8; 32] = generated.invoice.payment_hash().to_byte_array();
    let serialized = generated.invoice.to_string();

    let now = current_timestamp_millis();
    let mut conn = state.conn()?;
    IncomingPayment::add(
        &mut conn,
        generated.preimage,
        payment_hash,
        IncomingOrigin::Invoice {
            payment_request: serialized.clone(),
        },
        now,
    )?;

    let external_id = p.opt_str("externalId").map(str::to_string);
    let webhook_url = p.opt_str("webhookUrl").map(str::to_string);
    if external_id.is_some() || webhook_url.is_some() {
        PaymentMetadata::insert(
            &mut conn,
            PaymentType::Incoming,
            &incoming_payment_id(&payment_hash).to_string(),
            external_id,
            webhook_url,
            now,
        )?;
    }

    Ok(Json(json!({
        "amountSat": amount_sat,
        "paymentHash": hex::encode(payment_hash),
        "serialized": serialized,
    }))
    .into_response())
}

async fn get_offer(State(state): State<AppState>) -> Result<Response, ApiError> {
    let offer = state.engine.get_offer().await?;
    Ok(offer.into_response())
}

async fn get_ln_address(State(state): State<AppState>) -> Result<Response, ApiError> {
    match state.engine.get_lightning_address().await? {
        Some(address) => Ok(address.into_response()),
        None => Err(ApiError::NotFound("lightning address")),
    }
}

async fn decode_invoice(
    form: Option<Form<HashMap<String, String>>>,
) -> Result<Response, ApiError> {
    let p = Params::from_form(form);
    let invoice = parse_invoice(p.require_str("invoice")?)?;
    Ok(Json(json!({
        "amountMsat": invoice.amount_milli_satoshis(),
        "paymentHash": hex::encode(invoice.payment_hash().to_byte_array()),
        "payee": invoice.recover_payee_pub_key().to_string(),
        "timestampSeconds": invoice.duration_since_epoch().as_secs(),
        "expirySeconds": invoice.expiry_time().as_secs(),
        "isExpired": invoice.is_expired(),
    }))
    .into_response())
}

async fn decode_offer(form: Option<Form<HashMap<String, String>>>) -> Result<Response, ApiError> {
    let p = Params::from_form(form);
    let offer = p.require_str("offer")?;
    if !offer.to_lowercase().starts_with("lno1") {
        return Err(ApiError::InvalidParam {
            name: "offer",
            expected: "BOLT12 offer",
        });
    }
    Ok(Json(json!({ "serialized": offer })).into_response())
}

/// Shared tail of every BOLT11 payment flow: insert the pending payment, run
/// the engine command, persist the outcome, answer the caller.
async fn pay_bolt11(
    state: &AppState,
    invoice: Bolt11Invoice,
    amount_msat: u64,
) -> Result<Response, ApiError> {
    if invoice.network() != state.config.chain() {
        return Err(ApiError::BadRequest(
            "invoice is for another chain".to_string(),
        ));
    }

    let payment_id = Uuid::new_v4();
    let pending = LightningOutgoingPayment {
        payment_id,
        payment_hash: invoice.payment_hash().to_byte_array(),
        recipient: invoice.recover_payee_pub_key(),
        recipient_amount_msat: amount_msat,
        details: OutgoingDetails::Normal {
            payment_request: invoice.to_string(),
        },
        parts: Vec::new(),
        status: OutgoingStatus::Pending,
        created_at: current_timestamp_millis(),
    };
    {
        let mut conn = state.conn()?;
        LightningOutgoingPayment::add(&mut conn, &pending)?;
    }

    let result = state
        .engine
        .pay_invoice(payment_id, &invoice, amount_msat)
        .await?;
    persist_pay_result(state, payment_id, result)
}

fn persist_parts(
    conn: &mut diesel::SqliteConnection,
    payment_id: Uuid,
    parts: &[PartResult],
) -> anyhow::Result<()> {
    let pending: Vec<OutgoingPart> = parts
        .iter()
        .map(|p| OutgoingPart {
            part_id: p.part_id,
            amount_msat: p.amount_msat,
            route: p.route.clone(),
            status: OutgoingPartStatus::Pending,
            created_at: p.created_at,
        })
        .collect();
    if !pending.is_empty() {
        LightningOutgoingPayment::add_parts(conn, payment_id, &pending)?;
    }
    for part in parts {
        if !matches!(part.status, OutgoingPartStatus::Pending) {
            LightningOutgoingPayment::update_part(conn, part.part_id, &part.status)?;
        }
    }
    Ok(())
}

fn persist_pay_result(
    state: &AppState,
    payment_id: Uuid,
    result: PayResult,
) -> Result<Response, ApiError> {
    let now = current_timestamp_millis();
    let mut conn = state.conn()?;
    match result {
        PayResult::Sent {
            payment_hash,
            preimage,
            recipient_amount_msat,
            parts,
            ..
        } => {
            persist_parts(&mut conn, payment_id, &parts)?;
            LightningOutgoingPayment::complete(
                &mut conn,
                payment_id,
                &OutgoingStatus::Succeeded {
                    preimage,
                    completed_at: now,
                },
            )?;
            let payment = LightningOutgoingPayment::get(&mut conn, payment_id)?
                .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("payment disappeared")))?;
            Ok(Json(json!({
                "recipientAmountSat": recipient_amount_msat / 1_000,
                "routingFeeSat": payment.routing_fee_msat() / 1_000,
                "paymentId": payment_id,
                "paymentHash": hex::encode(payment_hash),
                "paymentPreimage": hex::encode(preimage),
            }))
            .into_response())
        }
        PayResult::Failed { reason, attempts } => {
            persist_parts(&mut conn, payment_id, &attempts)?;
            LightningOutgoingPayment::complete(
                &mut conn,
                payment_id,
                &OutgoingStatus::Failed {
                    reason: reason.clone(),
                    completed_at: now,
                },
            )?;
            // a refusal is not a transport error: 200 with an explanation
            Ok(Json(json!({
                "reason": reason,
                "attempts": attempts.len(),
            }))
            .into_response())
        }
    }
}

async fn pay_invoice(
    State(state): State<AppState>,
    Extension(level): Extension<AccessLevel>,
    form: Option<Form<HashMap<String, String>>>,
) -> Result<Response, ApiError> {
    require_full(level)?;
    let p = Params::from_form(form);
    let invoice = parse_invoice(p.require_str("invoice")?)?;
    // an explicit amountSat overrides the invoice's own amount
    let amount_msat = p
        .opt_u64("amountSat")?
        .map(|s| s * 1_000)
        .or(invoice.amount_milli_satoshis())
        .ok_or(ApiError::MissingParam("amountSat"))?;
    pay_bolt11(&state, invoice, amount_msat).await
}

/// Shared tail of every BOLT12 payment flow. The payment hash only exists
/// once the invoice was fetched, so the row is inserted on completion and a
/// failed fetch leaves no row behind.
async fn pay_bolt12(
    state: &AppState,
    offer: &str,
    amount_msat: u64,
    payer_note: Option<String>,
) -> Result<Response, ApiError> {
    let payment_id = Uuid::new_v4();
    let result = state
        .engine
        .pay_offer(payment_id, offer, amount_msat, payer_note)
        .await?;

    match result {
        PayResult::Failed { reason, attempts } => Ok(Json(json!({
            "reason": reason,
            "attempts": attempts.len(),
        }))
        .into_response()),
        PayResult::Sent {
            payment_hash,
            preimage,
            recipient,
            recipient_amount_msat,
            payer_key,
            parts,
        } => {
            let pending = LightningOutgoingPayment {
                payment_id,
                payment_hash,
                recipient,
                recipient_amount_msat,
                details: OutgoingDetails::Blinded {
                    payment_request: offer.to_string(),
                    payer_key: payer_key.unwrap_or(recipient),
                },
                parts: Vec::new(),
                status: OutgoingStatus::Pending,
                created_at: current_timestamp_millis(),
            };
            {
                let mut conn = state.conn()?;
                LightningOutgoingPayment::add(&mut conn, &pending)?;
            }
            persist_pay_result(
                state,
                payment_id,
                PayResult::Sent {
                    payment_hash,
                    preimage,
                    recipient,
                    recipient_amount_msat,
                    payer_key,
                    parts,
                },
            )
        }
    }
}

async fn pay_offer(
    State(state): State<AppState>,
    Extension(level): Extension<AccessLevel>,
    form: Option<Form<HashMap<String, String>>>,
) -> Result<Response, ApiError> {
    require_full(level)?;
    let p = Params::from_form(form);
    let offer = p.require_str("offer")?;
    if !offer.to_lowercase().starts_with("lno1") {
        return Err(ApiError::InvalidParam {
            name: "offer",
            expected: "BOLT12 offer",
        });
    }
    let amount_msat = p.require_u64("amountSat")? * 1_000;
    let message = p.opt_str("message").map(str::to_string);
    pay_bolt12(&state, offer, amount_msat, message).await
}

async fn pay_ln_address(
    State(state): State<AppState>,
    Extension(level): Extension<AccessLevel>,
    form: Option<Form<HashMap<String, String>>>,
) -> Result<Response, ApiError> {
    require_full(level)?;
    let p = Params::from_form(form);
    let address = p.require_str("address")?;
    let (user, domain) = match address.split_once('@') {
        Some((user, domain)) if !user.is_empty() && !domain.is_empty() => (user, domain),
        _ => {
            return Err(ApiError::InvalidParam {
                name: "address",
                expected: "user@domain lightning address",
            })
        }
    };
    let amount_msat = p.require_u64("amountSat")? * 1_000;
    let message = p.opt_str("message");

    match state
        .resolver
        .resolve_address(user, domain, amount_msat, message)
        .await
    {
        Ok(AddressPayment::Bolt11(invoice)) => pay_bolt11(&state, invoice, amount_msat).await,
        Ok(AddressPayment::Offer(offer)) => {
            pay_bolt12(&state, &offer, amount_msat, message.map(str::to_string)).await
        }
        Err(e) => Ok(format!("could not resolve address {address}: {e}").into_response()),
    }
}

async fn lnurl_pay(
    State(state): State<AppState>,
    Extension(level): Extension<AccessLevel>,
    form: Option<Form<HashMap<String, String>>>,
) -> Result<Response, ApiError> {
    require_full(level)?;
    let p = Params::from_form(form);
    let encoded = p.require_str("lnurl")?;
    let amount_msat = p.require_u64("amountSat")? * 1_000;
    let comment = p.opt_str("message");

    let resolved = match state.resolver.execute_lnurl(encoded).await {
        Ok(resolved) => resolved,
        Err(e) => return Ok(format!("could not resolve lnurl: {e}").into_response()),
    };
    let pay = match resolved {
        Lnurl::Pay(pay) => pay,
        other => {
            return Err(ApiError::BadRequest(format!(
                "expected a payRequest, lnurl resolved to {}",
                other.tag()
            )))
        }
    };
    if amount_msat < pay.min_sendable || amount_msat > pay.max_sendable {
        return Err(ApiError::BadRequest(format!(
            "amount out of range: min {} msat, max {} msat",
            pay.min_sendable, pay.max_sendable
        )));
    }

    let invoice = match state
        .resolver
        .get_lnurl_pay_invoice(&pay, amount_msat, comment)
        .await
    {
        Ok(invoice) => invoice,
        Err(e) => return Ok(format!("pay service refused: {e}").into_response()),
    };
    pay_bolt11(&state, invoice, amount_msat).await
}

async fn lnurl_withdraw(
    State(state): State<AppState>,
    form: Option<Form<HashMap<String, String>>>,
) -> Result<Response, ApiError> {
    let p = Params::from_form(form);
    let encoded = p.require_str("lnurl")?;

    let resolved = match state.resolver.execute_lnurl(encoded).await {
        Ok(resolved) => resolved,
        Err(e) => return Ok(format!("could not resolve lnurl: {e}").into_response()),
    };
    let withdraw = match resolved {
        Lnurl::Withdraw(withdraw) => withdraw,
        other => {
            return Err(ApiError::BadRequest(format!(
                "expected a withdrawRequest, lnurl resolved to {}",
                other.tag()
            )))
        }
    };

    let amount_msat = withdraw.max_withdrawable;
    let generated = state
        .engine
        .create_invoice(
            Some(amount_msat),
            InvoiceDescription::Direct(withdraw.default_description.clone()),
            None,
        )
        .await?;
    let payment_hash: [u8; 32] = generated.invoice.payment_hash().to_byte_array();
    {
        let mut conn = state.conn()?;
        IncomingPayment::add(
            &mut conn,
            generated.preimage,
            payment_hash,
            IncomingOrigin::Invoice {
                payment_request: generated.invoice.to_string(),
            },
            current_timestamp_millis(),
        )?;
    }

    if let Err(e) = state
        .resolver
        .send_withdraw_invoice(&withdraw, &generated.invoice)
        .await
    {
        return Ok(format!("withdraw service refused: {e}").into_response());
    }
    Ok(Json(json!({
        "amountSat": amount_msat / 1_000,
        "paymentHash": hex::encode(payment_hash),
        "serialized": generated.invoice.to_string(),
    }))
    .into_response())
}

async fn lnurl_auth(
    State(state): State<AppState>,
    Extension(level): Extension<AccessLevel>,
    form: Option<Form<HashMap<String, String>>>,
) -> Result<Response, ApiError> {
    require_full(level)?;
    let p = Params::from_form(form);
    let encoded = p.require_str("lnurl")?;

    let resolved = match state.resolver.execute_lnurl(encoded).await {
        Ok(resolved) => resolved,
        Err(e) => return Ok(format!("could not resolve lnurl: {e}").into_response()),
    };
    let auth = match resolved {
        Lnurl::Auth(auth) => auth,
        other => {
            return Err(ApiError::BadRequest(format!(
                "expected a login challenge, lnurl resolved to {}",
                other.tag()
            )))
        }
    };
    match state.resolver.sign_and_send_auth_request(&auth).await {
        Ok(()) => Ok("authenticated".into_response()),
        Err(e) => Ok(format!("auth service refused: {e}").into_response()),
    }
}

async fn send_to_address(
    State(state): State<AppState>,
    Extension(level): Extension<AccessLevel>,
    form: Option<Form<HashMap<String, String>>>,
) -> Result<Response, ApiError> {
    require_full(level)?;
    let p = Params::from_form(form);
    let address = parse_onchain_address(p.require_str("address")?, state.config.chain())?;
    let amount_sat = p.require_u64("amountSat")?;
    let feerate = p.require_u64("feerateSatByte")?;

    match state.engine.splice_out(amount_sat, &address, feerate).await {
        Ok(tx_id) => Ok(tx_id.to_string().into_response()),
        Err(e) => Ok(format!("splice-out failed: {e}").into_response()),
    }
}

async fn bump_fee(
    State(state): State<AppState>,
    Extension(level): Extension<AccessLevel>,
    form: Option<Form<HashMap<String, String>>>,
) -> Result<Response, ApiError> {
    require_full(level)?;
    let p = Params::from_form(form);
    let feerate = p.require_u64("feerateSatByte")?;

    match state.engine.splice_cpfp(feerate).await {
        Ok(tx_id) => Ok(tx_id.to_string().into_response()),
        Err(e) => Ok(format!("fee bump failed: {e}").into_response()),
    }
}

async fn close_channel(
    State(state): State<AppState>,
    Extension(level): Extension<AccessLevel>,
    form: Option<Form<HashMap<String, String>>>,
) -> Result<Response, ApiError> {
    require_full(level)?;
    let p = Params::from_form(form);
    let channel_id = p
        .hex32("channelId")?
        .ok_or(ApiError::MissingParam("channelId"))?;
    let address = parse_onchain_address(p.require_str("address")?, state.config.chain())?;
    let feerate = p.require_u64("feerateSatByte")?;

    match state
        .engine
        .close_channel(channel_id, &address, feerate)
        .await
    {
        Ok(tx_id) => Ok(tx_id.to_string().into_response()),
        Err(e) => Ok(format!("close failed: {e}").into_response()),
    }
}

async fn list_incoming(
    State(state): State<AppState>,
    query: Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let p = Params::from_query(query);
    let from = p.opt_u64("from")?.unwrap_or(0) as i64;
    let to = p
        .opt_u64("to")?
        .map(|t| t as i64)
        .unwrap_or_else(|| current_timestamp_millis() + 1);
    let limit = p.opt_u64("limit")?.unwrap_or(20) as i64;
    let offset = p.opt_u64("offset")?.unwrap_or(0) as i64;
    let all = p.opt_bool("all")?.unwrap_or(false);
    let external_id = p.opt_str("externalId");

    let mut conn = state.conn()?;
    let payments = match (all, external_id) {
        (true, None) => IncomingPayment::list_created_within(&mut conn, from, to, limit, offset)?,
        (true, Some(id)) => IncomingPayment::list_created_within_external_id(
            &mut conn, id, from, to, limit, offset,
        )?,
        (false, None) => IncomingPayment::list_received_within(&mut conn, from, to, limit, offset)?,
        (false, Some(id)) => IncomingPayment::list_received_within_external_id(
            &mut conn, id, from, to, limit, offset,
        )?,
    };
    Ok(Json(payments).into_response())
}

async fn get_incoming(
    State(state): State<AppState>,
    Path(payment_hash): Path<String>,
) -> Result<Response, ApiError> {
    let hash = parse_hex32(&payment_hash).map_err(|_| ApiError::InvalidParam {
        name: "paymentHash",
        expected: "32-byte hex string",
    })?;
    let mut conn = state.conn()?;
    match IncomingPayment::get(&mut conn, hash)? {
        Some(payment) => Ok(Json(payment).into_response()),
        None => Err(ApiError::NotFound("incoming payment")),
    }
}

async fn list_outgoing(
    State(state): State<AppState>,
    query: Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let p = Params::from_query(query);
    let from = p.opt_u64("from")?.unwrap_or(0) as i64;
    let to = p
        .opt_u64("to")?
        .map(|t| t as i64)
        .unwrap_or_else(|| current_timestamp_millis() + 1);
    let limit = p.opt_u64("limit")?.unwrap_or(20) as i64;
    let offset = p.opt_u64("offset")?.unwrap_or(0) as i64;
    let all = p.opt_bool("all")?.unwrap_or(false);

    let mut conn = state.conn()?;
    let payments = if all {
        LightningOutgoingPayment::list_within(&mut conn, from, to, limit, offset)?
    } else {
        LightningOutgoingPayment::list_successful_or_pending_within(
            &mut conn, from, to, limit, offset,
        )?
    };
    Ok(Json(payments).into_response())
}

async fn get_outgoing(
    State(state): State<AppState>,
    Path(payment_id): Path<String>,
) -> Result<Response, ApiError> {
    let id = Uuid::from_str(&payment_id).map_err(|_| ApiError::InvalidParam {
        name: "paymentId",
        expected: "uuid",
    })?;
    let mut conn = state.conn()?;
    match LightningOutgoingPayment::get(&mut conn, id)? {
        Some(payment) => Ok(Json(payment).into_response()),
        None => Err(ApiError::NotFound("outgoing payment")),
    }
}

async fn list_outgoing_by_hash(
    State(state): State<AppState>,
    Path(payment_hash): Path<String>,
) -> Result<Response, ApiError> {
    let hash = parse_hex32(&payment_hash).map_err(|_| ApiError::InvalidParam {
        name: "paymentHash",
        expected: "32-byte hex string",
    })?;
    let mut conn = state.conn()?;
    let payments = LightningOutgoingPayment::list_for_payment_hash(&mut conn, hash)?;
    Ok(Json(payments).into_response())
}

async fn export_payments(
    State(state): State<AppState>,
    query: Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let p = Params::from_query(query);
    let from = p.opt_u64("from")?.unwrap_or(0) as i64;
    let to = p
        .opt_u64("to")?
        .map(|t| t as i64)
        .unwrap_or_else(|| current_timestamp_millis() + 1);

    let mut conn = state.conn()?;
    let path = export::export_csv(&mut conn, &state.config.exports_dir(), from, to)?;
    Ok(path.to_string_lossy().into_owned().into_response())
}

async fn websocket_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let receiver = state.bus.subscribe();
    // echo the subprotocol back so handshakes carrying the password complete
    let ws = match headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
    {
        Some(protocol) => ws.protocols([protocol.to_string()]),
        None => ws,
    };
    ws.on_upgrade(move |socket| websocket_loop(socket, receiver))
}

async fn websocket_loop(socket: WebSocket, mut events: broadcast::Receiver<crate::events::ApiEvent>) {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
            },
            frame = stream.next() => match frame {
                // client-to-server frames are ignored
                Some(Ok(_)) => {}
                _ => return,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn auth() -> HttpAuth {
        HttpAuth {
            full_password: "primary".to_string(),
            limited_password: Some("limited".to_string()),
        }
    }

    fn basic(user: &str, password: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let encoded = base64::encode(format!("{user}:{password}"));
        headers.insert(
            header::AUTHORIZATION,
            format!("Basic {encoded}").parse().unwrap(),
        );
        headers
    }

    #[test]
    fn basic_auth_tiers() {
        let auth = auth();
        assert_eq!(
            authenticate(&basic("", "primary"), &auth).unwrap(),
            AccessLevel::Full
        );
        assert_eq!(
            authenticate(&basic("anyone", "limited"), &auth).unwrap(),
            AccessLevel::Limited
        );
        assert!(authenticate(&basic("", "wrong"), &auth).is_err());
        assert!(authenticate(&HeaderMap::new(), &auth).is_err());
    }

    #[test]
    fn websocket_protocol_carries_password() {
        let auth = auth();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            "limited".parse().unwrap(),
        );
        assert_eq!(
            authenticate(&headers, &auth).unwrap(),
            AccessLevel::Limited
        );
    }

    #[test]
    fn params_coercion() {
        let mut map = HashMap::new();
        map.insert("amountSat".to_string(), "12345".to_string());
        map.insert("bad".to_string(), "xyz".to_string());
        map.insert("all".to_string(), "true".to_string());
        map.insert("empty".to_string(), String::new());
        let p = Params(map);

        assert_eq!(p.require_u64("amountSat").unwrap(), 12_345);
        assert_eq!(p.opt_bool("all").unwrap(), Some(true));
        assert!(p.opt_str("empty").is_none());
        assert!(matches!(
            p.opt_u64("bad").unwrap_err(),
            ApiError::InvalidParam { name: "bad", .. }
        ));
        assert!(matches!(
            p.require_str("missing").unwrap_err(),
            ApiError::MissingParam("missing")
        ));
    }

    #[test]
    fn limited_access_cannot_use_full_routes() {
        assert!(require_full(AccessLevel::Limited).is_err());
        assert!(require_full(AccessLevel::Full).is_ok());
    }
}
