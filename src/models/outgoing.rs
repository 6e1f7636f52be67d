use crate::models::schema::{payments_outgoing, payments_outgoing_parts};
use crate::models::{hex_bytes, DecodeError, StoreError};
use bitcoin::secp256k1::PublicKey;
use diesel::prelude::*;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const OUTGOING_DETAILS_NORMAL_V0: i32 = 10;
pub const OUTGOING_DETAILS_KEYSEND_V0: i32 = 20;
pub const OUTGOING_DETAILS_SWAP_OUT_V0: i32 = 30;
pub const OUTGOING_DETAILS_BLINDED_V0: i32 = 40;

pub const OUTGOING_STATUS_SUCCEEDED_OFFCHAIN_V0: i32 = 10;
pub const OUTGOING_STATUS_FAILED_V0: i32 = 20;

pub const OUTGOING_PART_STATUS_SUCCEEDED_V0: i32 = 10;
pub const OUTGOING_PART_STATUS_FAILED_V0: i32 = 20;

/// What kind of payment was attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutgoingDetails {
    /// Payment of a BOLT11 invoice.
    #[serde(rename_all = "camelCase")]
    Normal { payment_request: String },
    /// Spontaneous payment; the preimage is ours.
    #[serde(rename_all = "camelCase")]
    KeySend {
        #[serde(with = "hex_bytes")]
        preimage: [u8; 32],
    },
    /// Swap to an on-chain address through the swap service.
    #[serde(rename_all = "camelCase")]
    SwapOut {
        address: String,
        payment_request: String,
        swap_out_fee_sat: u64,
    },
    /// Payment of a BOLT12 invoice fetched from an offer.
    #[serde(rename_all = "camelCase")]
    Blinded {
        payment_request: String,
        payer_key: PublicKey,
    },
}

#[derive(Serialize, Deserialize)]
struct DetailsNormalV0 {
    payment_request: String,
}

#[derive(Serialize, Deserialize)]
struct DetailsKeySendV0 {
    #[serde(with = "hex_bytes")]
    preimage: [u8; 32],
}

#[derive(Serialize, Deserialize)]
struct DetailsSwapOutV0 {
    address: String,
    payment_request: String,
    swap_out_fee_sat: u64,
}

#[derive(Serialize, Deserialize)]
struct DetailsBlindedV0 {
    payment_request: String,
    payer_key: PublicKey,
}

impl OutgoingDetails {
    pub fn encode(&self) -> (i32, Vec<u8>) {
        match self {
            OutgoingDetails::Normal { payment_request } => (
                OUTGOING_DETAILS_NORMAL_V0,
                serde_json::to_vec(&DetailsNormalV0 {
                    payment_request: payment_request.clone(),
                })
                .expect("details serialization is infallible"),
            ),
            OutgoingDetails::KeySend { preimage } => (
                OUTGOING_DETAILS_KEYSEND_V0,
                serde_json::to_vec(&DetailsKeySendV0 {
                    preimage: *preimage,
                })
                .expect("details serialization is infallible"),
            ),
            OutgoingDetails::SwapOut {
                address,
                payment_request,
                swap_out_fee_sat,
            } => (
                OUTGOING_DETAILS_SWAP_OUT_V0,
                serde_json::to_vec(&DetailsSwapOutV0 {
                    address: address.clone(),
                    payment_request: payment_request.clone(),
                    swap_out_fee_sat: *swap_out_fee_sat,
                })
                .expect("details serialization is infallible"),
            ),
            OutgoingDetails::Blinded {
                payment_request,
                payer_key,
            } => (
                OUTGOING_DETAILS_BLINDED_V0,
                serde_json::to_vec(&DetailsBlindedV0 {
                    payment_request: payment_request.clone(),
                    payer_key: *payer_key,
                })
                .expect("details serialization is infallible"),
            ),
        }
    }

    pub fn decode(tag: i32, blob: &[u8]) -> Result<OutgoingDetails, DecodeError> {
        const FAMILY: &str = "outgoing details";
        let malformed = |source| DecodeError::MalformedBlob {
            family: FAMILY,
            source,
        };
        match tag {
            OUTGOING_DETAILS_NORMAL_V0 => {
                let v: DetailsNormalV0 = serde_json::from_slice(blob).map_err(malformed)?;
                Ok(OutgoingDetails::Normal {
                    payment_request: v.payment_request,
                })
            }
            OUTGOING_DETAILS_KEYSEND_V0 => {
                let v: DetailsKeySendV0 = serde_json::from_slice(blob).map_err(malformed)?;
                Ok(OutgoingDetails::KeySend {
                    preimage: v.preimage,
                })
            }
            OUTGOING_DETAILS_SWAP_OUT_V0 => {
                let v: DetailsSwapOutV0 = serde_json::from_slice(blob).map_err(malformed)?;
                Ok(OutgoingDetails::SwapOut {
                    address: v.address,
                    payment_request: v.payment_request,
                    swap_out_fee_sat: v.swap_out_fee_sat,
                })
            }
            OUTGOING_DETAILS_BLINDED_V0 => {
                let v: DetailsBlindedV0 = serde_json::from_slice(blob).map_err(malformed)?;
                Ok(OutgoingDetails::Blinded {
                    payment_request: v.payment_request,
                    payer_key: v.payer_key,
                })
            }
            _ => Err(DecodeError::UnknownTag { family: FAMILY, tag }),
        }
    }
}

/// Payment-level failure, reported once every part has failed or the sender
/// gave up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FinalFailure {
    AlreadyPaid,
    ChannelClosing,
    InsufficientBalance,
    InvalidPaymentAmount,
    NoAvailableChannels,
    RecipientUnreachable,
    RetryExhausted,
    WalletRestarted,
    Other { details: String },
}

/// Part-level failure, one per attempted HTLC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartFailure {
    ChannelIsClosing,
    ChannelIsSplicing,
    NotEnoughFees,
    NotEnoughFunds,
    PaymentAmountTooBig,
    PaymentAmountTooSmall,
    RecipientRejectedPayment,
    RecipientIsOffline,
    TemporaryRemoteFailure,
    TooManyPendingPayments,
    Uninterpretable { details: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutgoingStatus {
    Pending,
    #[serde(rename_all = "camelCase")]
    Succeeded {
        #[serde(with = "hex_bytes")]
        preimage: [u8; 32],
        completed_at: i64,
    },
    #[serde(rename_all = "camelCase")]
    Failed {
        reason: FinalFailure,
        completed_at: i64,
    },
}

#[derive(Serialize, Deserialize)]
struct StatusSucceededOffChainV0 {
    #[serde(with = "hex_bytes")]
    preimage: [u8; 32],
}

#[derive(Serialize, Deserialize)]
struct StatusFailedV0 {
    reason: FinalFailure,
}

impl OutgoingStatus {
    pub fn encode(&self) -> (Option<i64>, Option<i32>, Option<Vec<u8>>) {
        match self {
            OutgoingStatus::Pending => (None, None, None),
            OutgoingStatus::Succeeded {
                preimage,
                completed_at,
            } => (
                Some(*completed_at),
                Some(OUTGOING_STATUS_SUCCEEDED_OFFCHAIN_V0),
                Some(
                    serde_json::to_vec(&StatusSucceededOffChainV0 {
                        preimage: *preimage,
                    })
                    .expect("status serialization is infallible"),
                ),
            ),
            OutgoingStatus::Failed {
                reason,
                completed_at,
            } => (
                Some(*completed_at),
                Some(OUTGOING_STATUS_FAILED_V0),
                Some(
                    serde_json::to_vec(&StatusFailedV0 {
                        reason: reason.clone(),
                    })
                    .expect("status serialization is infallible"),
                ),
            ),
        }
    }

    pub fn decode(
        completed_at: Option<i64>,
        tag: Option<i32>,
        blob: Option<&[u8]>,
    ) -> Result<OutgoingStatus, StoreError> {
        const FAMILY: &str = "outgoing status";
        let malformed = |source| {
            StoreError::Decode(DecodeError::MalformedBlob {
                family: FAMILY,
                source,
            })
        };
        match (completed_at, tag, blob) {
            (None, None, None) => Ok(OutgoingStatus::Pending),
            (Some(completed_at), Some(tag), Some(blob)) => match tag {
                OUTGOING_STATUS_SUCCEEDED_OFFCHAIN_V0 => {
                    let v: StatusSucceededOffChainV0 =
                        serde_json::from_slice(blob).map_err(malformed)?;
                    Ok(OutgoingStatus::Succeeded {
                        preimage: v.preimage,
                        completed_at,
                    })
                }
                OUTGOING_STATUS_FAILED_V0 => {
                    let v: StatusFailedV0 = serde_json::from_slice(blob).map_err(malformed)?;
                    Ok(OutgoingStatus::Failed {
                        reason: v.reason,
                        completed_at,
                    })
                }
                _ => Err(StoreError::Decode(DecodeError::UnknownTag {
                    family: FAMILY,
                    tag,
                })),
            },
            (completed_at, tag, _) => Err(StoreError::UnhandledOutgoingStatus {
                completed_at,
                status_type: tag,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutgoingPartStatus {
    Pending,
    #[serde(rename_all = "camelCase")]
    Succeeded {
        #[serde(with = "hex_bytes")]
        preimage: [u8; 32],
        completed_at: i64,
    },
    #[serde(rename_all = "camelCase")]
    Failed {
        failure: PartFailure,
        completed_at: i64,
    },
}

#[derive(Serialize, Deserialize)]
struct PartStatusSucceededV0 {
    #[serde(with = "hex_bytes")]
    preimage: [u8; 32],
}

#[derive(Serialize, Deserialize)]
struct PartStatusFailedV0 {
    failure: PartFailure,
}

impl OutgoingPartStatus {
    pub fn encode(&self) -> (Option<i64>, Option<i32>, Option<Vec<u8>>) {
        match self {
            OutgoingPartStatus::Pending => (None, None, None),
            OutgoingPartStatus::Succeeded {
                preimage,
                completed_at,
            } => (
                Some(*completed_at),
                Some(OUTGOING_PART_STATUS_SUCCEEDED_V0),
                Some(
                    serde_json::to_vec(&PartStatusSucceededV0 {
                        preimage: *preimage,
                    })
                    .expect("part status serialization is infallible"),
                ),
            ),
            OutgoingPartStatus::Failed {
                failure,
                completed_at,
            } => (
                Some(*completed_at),
                Some(OUTGOING_PART_STATUS_FAILED_V0),
                Some(
                    serde_json::to_vec(&PartStatusFailedV0 {
                        failure: failure.clone(),
                    })
                    .expect("part status serialization is infallible"),
                ),
            ),
        }
    }

    pub fn decode(
        completed_at: Option<i64>,
        tag: Option<i32>,
        blob: Option<&[u8]>,
    ) -> Result<OutgoingPartStatus, StoreError> {
        const FAMILY: &str = "outgoing part status";
        let malformed = |source| {
            StoreError::Decode(DecodeError::MalformedBlob {
                family: FAMILY,
                source,
            })
        };
        match (completed_at, tag, blob) {
            (None, None, None) => Ok(OutgoingPartStatus::Pending),
            (Some(completed_at), Some(tag), Some(blob)) => match tag {
                OUTGOING_PART_STATUS_SUCCEEDED_V0 => {
                    let v: PartStatusSucceededV0 =
                        serde_json::from_slice(blob).map_err(malformed)?;
                    Ok(OutgoingPartStatus::Succeeded {
                        preimage: v.preimage,
                        completed_at,
                    })
                }
                OUTGOING_PART_STATUS_FAILED_V0 => {
                    let v: PartStatusFailedV0 = serde_json::from_slice(blob).map_err(malformed)?;
                    Ok(OutgoingPartStatus::Failed {
                        failure: v.failure,
                        completed_at,
                    })
                }
                _ => Err(StoreError::Decode(DecodeError::UnknownTag {
                    family: FAMILY,
                    tag,
                })),
            },
            (completed_at, tag, _) => Err(StoreError::UnhandledOutgoingPartStatus {
                completed_at,
                status_type: tag,
            }),
        }
    }
}

/// Short channel id packed as `block << 40 | tx << 16 | output`, rendered in
/// the usual `BLOCKxTXxOUTPUT` form.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ShortChannelId(pub u64);

impl ShortChannelId {
    pub fn new(block: u32, tx: u32, output: u16) -> ShortChannelId {
        ShortChannelId(
            ((block as u64) << 40) | (((tx as u64) & 0xFF_FFFF) << 16) | (output as u64),
        )
    }

    pub fn block_height(&self) -> u32 {
        (self.0 >> 40) as u32
    }

    pub fn tx_index(&self) -> u32 {
        ((self.0 >> 16) & 0xFF_FFFF) as u32
    }

    pub fn output_index(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

impl fmt::Display for ShortChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{}",
            self.block_height(),
            self.tx_index(),
            self.output_index()
        )
    }
}

impl FromStr for ShortChannelId {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<ShortChannelId, DecodeError> {
        let invalid = || DecodeError::MalformedRoute(format!("invalid short channel id: {s}"));
        let mut parts = s.split('x');
        let block: u32 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let tx: u32 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let output: u16 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(ShortChannelId::new(block, tx, output))
    }
}

impl Serialize for ShortChannelId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteHop {
    pub node_a: PublicKey,
    pub node_b: PublicKey,
    pub short_channel_id: Option<ShortChannelId>,
}

/// Compact text form of a route: `"nodeA:nodeB:shortChannelId?;…"`, with an
/// empty string for the empty route and an empty third slot for a missing
/// short channel id.
pub fn encode_route(hops: &[RouteHop]) -> String {
    hops.iter()
        .map(|hop| {
            format!(
                "{}:{}:{}",
                hop.node_a,
                hop.node_b,
                hop.short_channel_id
                    .map(|scid| scid.to_string())
                    .unwrap_or_default()
            )
        })
        .join(";")
}

pub fn decode_route(encoded: &str) -> Result<Vec<RouteHop>, DecodeError> {
    if encoded.is_empty() {
        return Ok(Vec::new());
    }
    encoded
        .split(';')
        .map(|segment| {
            let mut slots = segment.splitn(3, ':');
            let node_a = slots
                .next()
                .and_then(|s| PublicKey::from_str(s).ok())
                .ok_or_else(|| DecodeError::MalformedRoute(format!("bad hop: {segment}")))?;
            let node_b = slots
                .next()
                .and_then(|s| PublicKey::from_str(s).ok())
                .ok_or_else(|| DecodeError::MalformedRoute(format!("bad hop: {segment}")))?;
            let short_channel_id = match slots.next() {
                None | Some("") => None,
                Some(scid) => Some(scid.parse()?),
            };
            Ok(RouteHop {
                node_a,
                node_b,
                short_channel_id,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingPart {
    pub part_id: Uuid,
    pub amount_msat: u64,
    pub route: Vec<RouteHop>,
    pub status: OutgoingPartStatus,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LightningOutgoingPayment {
    pub payment_id: Uuid,
    #[serde(with = "hex_bytes")]
    pub payment_hash: [u8; 32],
    pub recipient: PublicKey,
    pub recipient_amount_msat: u64,
    pub details: OutgoingDetails,
    pub parts: Vec<OutgoingPart>,
    pub status: OutgoingStatus,
    pub created_at: i64,
}

impl LightningOutgoingPayment {
    /// A successful MPP payment may carry failed or abandoned attempts whose
    /// exposure would confuse balance accounting: a succeeded payment exposes
    /// only its succeeded parts.
    pub fn filter_useless_parts(mut self) -> LightningOutgoingPayment {
        if matches!(self.status, OutgoingStatus::Succeeded { .. }) {
            self.parts
                .retain(|p| matches!(p.status, OutgoingPartStatus::Succeeded { .. }));
        }
        self
    }

    /// Total sent minus the amount the recipient keeps, over succeeded parts.
    pub fn routing_fee_msat(&self) -> u64 {
        let sent: u64 = self
            .parts
            .iter()
            .filter(|p| matches!(p.status, OutgoingPartStatus::Succeeded { .. }))
            .map(|p| p.amount_msat)
            .sum();
        sent.saturating_sub(self.recipient_amount_msat)
    }
}

#[derive(
    Queryable, Selectable, Insertable, Identifiable, AsChangeset, Debug, Clone, PartialEq, Eq,
)]
#[diesel(table_name = payments_outgoing)]
#[diesel(primary_key(id))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct OutgoingPaymentRow {
    id: String,
    payment_hash: Vec<u8>,
    recipient: Vec<u8>,
    amount_msat: i64,
    details_type: i32,
    details_blob: Vec<u8>,
    status_type: Option<i32>,
    status_blob: Option<Vec<u8>>,
    completed_at: Option<i64>,
    created_at: i64,
}

#[derive(
    Queryable, Selectable, Insertable, Identifiable, AsChangeset, Debug, Clone, PartialEq, Eq,
)]
#[diesel(table_name = payments_outgoing_parts)]
#[diesel(primary_key(id))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct OutgoingPartRow {
    id: String,
    parent_id: String,
    amount_msat: i64,
    route: String,
    status_type: Option<i32>,
    status_blob: Option<Vec<u8>>,
    completed_at: Option<i64>,
    created_at: i64,
}

impl OutgoingPaymentRow {
    fn from_payment(payment: &LightningOutgoingPayment) -> OutgoingPaymentRow {
        let (details_type, details_blob) = payment.details.encode();
        let (completed_at, status_type, status_blob) = payment.status.encode();
        OutgoingPaymentRow {
            id: payment.payment_id.to_string(),
            payment_hash: payment.payment_hash.to_vec(),
            recipient: payment.recipient.serialize().to_vec(),
            amount_msat: payment.recipient_amount_msat as i64,
            details_type,
            details_blob,
            status_type,
            status_blob,
            completed_at,
            created_at: payment.created_at,
        }
    }

    fn into_payment(self, parts: Vec<OutgoingPart>) -> anyhow::Result<LightningOutgoingPayment> {
        let payment_hash: [u8; 32] = self
            .payment_hash
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("invalid payment hash length"))?;
        let details = OutgoingDetails::decode(self.details_type, &self.details_blob)
            .map_err(StoreError::Decode)?;
        let status = OutgoingStatus::decode(
            self.completed_at,
            self.status_type,
            self.status_blob.as_deref(),
        )?;
        Ok(LightningOutgoingPayment {
            payment_id: Uuid::from_str(&self.id)?,
            payment_hash,
            recipient: PublicKey::from_slice(&self.recipient)?,
            recipient_amount_msat: self.amount_msat as u64,
            details,
            parts,
            status,
            created_at: self.created_at,
        })
    }
}

impl OutgoingPartRow {
    fn from_part(parent_id: Uuid, part: &OutgoingPart) -> OutgoingPartRow {
        let (completed_at, status_type, status_blob) = part.status.encode();
        OutgoingPartRow {
            id: part.part_id.to_string(),
            parent_id: parent_id.to_string(),
            amount_msat: part.amount_msat as i64,
            route: encode_route(&part.route),
            status_type,
            status_blob,
            completed_at,
            created_at: part.created_at,
        }
    }

    fn into_part(self) -> anyhow::Result<OutgoingPart> {
        let status = OutgoingPartStatus::decode(
            self.completed_at,
            self.status_type,
            self.status_blob.as_deref(),
        )?;
        Ok(OutgoingPart {
            part_id: Uuid::from_str(&self.id)?,
            amount_msat: self.amount_msat as u64,
            route: decode_route(&self.route).map_err(StoreError::Decode)?,
            status,
            created_at: self.created_at,
        })
    }
}

/// Groups the denormalized `(payment × part)` rows by payment id, preserving
/// query order and dropping the null-part synthetic rows that carry partless
/// payments.
fn group_rows(
    rows: Vec<(OutgoingPaymentRow, Option<OutgoingPartRow>)>,
) -> anyhow::Result<Vec<LightningOutgoingPayment>> {
    let mut payments: Vec<LightningOutgoingPayment> = Vec::new();
    for (row, part) in rows {
        let same_group = payments
            .last()
            .is_some_and(|p| p.payment_id.to_string() == row.id);
        if !same_group {
            payments.push(row.into_payment(Vec::new())?);
        }
        if let Some(part) = part {
            payments
                .last_mut()
                .expect("group exists")
                .parts
                .push(part.into_part()?);
        }
    }
    Ok(payments)
}

impl LightningOutgoingPayment {
    /// Inserts the payment row plus its initial parts in one transaction.
    pub fn add(
        conn: &mut SqliteConnection,
        payment: &LightningOutgoingPayment,
    ) -> anyhow::Result<()> {
        conn.immediate_transaction(|conn| {
            diesel::insert_into(payments_outgoing::table)
                .values(OutgoingPaymentRow::from_payment(payment))
                .execute(conn)?;
            let rows: Vec<OutgoingPartRow> = payment
                .parts
                .iter()
                .map(|p| OutgoingPartRow::from_part(payment.payment_id, p))
                .collect();
            if !rows.is_empty() {
                diesel::insert_into(payments_outgoing_parts::table)
                    .values(&rows)
                    .execute(conn)?;
            }
            Ok(())
        })
    }

    /// Bulk insert of additional parts; the parent must exist (foreign key).
    pub fn add_parts(
        conn: &mut SqliteConnection,
        parent_id: Uuid,
        parts: &[OutgoingPart],
    ) -> anyhow::Result<()> {
        conn.immediate_transaction(|conn| {
            let rows: Vec<OutgoingPartRow> = parts
                .iter()
                .map(|p| OutgoingPartRow::from_part(parent_id, p))
                .collect();
            diesel::insert_into(payments_outgoing_parts::table)
                .values(&rows)
                .execute(conn)?;
            Ok(())
        })
    }

    /// Completes the payment. Returns whether exactly one row changed; a
    /// payment already completed is left untouched.
    pub fn complete(
        conn: &mut SqliteConnection,
        id: Uuid,
        status: &OutgoingStatus,
    ) -> anyhow::Result<bool> {
        let (completed_at, status_type, status_blob) = status.encode();
        if completed_at.is_none() {
            anyhow::bail!("cannot complete a payment with a pending status");
        }
        let count = diesel::update(
            payments_outgoing::table
                .filter(payments_outgoing::id.eq(id.to_string()))
                .filter(payments_outgoing::status_type.is_null()),
        )
        .set((
            payments_outgoing::status_type.eq(status_type),
            payments_outgoing::status_blob.eq(status_blob),
            payments_outgoing::completed_at.eq(completed_at),
        ))
        .execute(conn)?;
        Ok(count == 1)
    }

    /// Completes one part. Transitions go `Pending -> Succeeded | Failed`
    /// only; a part already completed is left untouched.
    pub fn update_part(
        conn: &mut SqliteConnection,
        part_id: Uuid,
        status: &OutgoingPartStatus,
    ) -> anyhow::Result<bool> {
        let (completed_at, status_type, status_blob) = status.encode();
        if completed_at.is_none() {
            anyhow::bail!("cannot complete a part with a pending status");
        }
        let count = diesel::update(
            payments_outgoing_parts::table
                .filter(payments_outgoing_parts::id.eq(part_id.to_string()))
                .filter(payments_outgoing_parts::status_type.is_null()),
        )
        .set((
            payments_outgoing_parts::status_type.eq(status_type),
            payments_outgoing_parts::status_blob.eq(status_blob),
            payments_outgoing_parts::completed_at.eq(completed_at),
        ))
        .execute(conn)?;
        Ok(count == 1)
    }

    pub fn get(
        conn: &mut SqliteConnection,
        id: Uuid,
    ) -> anyhow::Result<Option<LightningOutgoingPayment>> {
        let rows: Vec<(OutgoingPaymentRow, Option<OutgoingPartRow>)> = payments_outgoing::table
            .left_join(payments_outgoing_parts::table)
            .filter(payments_outgoing::id.eq(id.to_string()))
            .order(payments_outgoing_parts::created_at.asc())
            .select((
                OutgoingPaymentRow::as_select(),
                Option::<OutgoingPartRow>::as_select(),
            ))
            .load(conn)?;
        Ok(group_rows(rows)?
            .into_iter()
            .next()
            .map(LightningOutgoingPayment::filter_useless_parts))
    }

    /// Resolves the parent payment of a part.
    pub fn get_from_part_id(
        conn: &mut SqliteConnection,
        part_id: Uuid,
    ) -> anyhow::Result<Option<LightningOutgoingPayment>> {
        let parent: Option<String> = payments_outgoing_parts::table
            .find(part_id.to_string())
            .select(payments_outgoing_parts::parent_id)
            .first(conn)
            .optional()?;
        match parent {
            Some(parent) => LightningOutgoingPayment::get(conn, Uuid::from_str(&parent)?),
            None => Ok(None),
        }
    }

    pub fn list_within(
        conn: &mut SqliteConnection,
        from: i64,
        to: i64,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<LightningOutgoingPayment>> {
        let ids: Vec<String> = payments_outgoing::table
            .filter(payments_outgoing::created_at.ge(from))
            .filter(payments_outgoing::created_at.lt(to))
            .order(payments_outgoing::created_at.desc())
            .limit(limit)
            .offset(offset)
            .select(payments_outgoing::id)
            .load(conn)?;
        LightningOutgoingPayment::load_by_ids(conn, ids)
    }

    pub fn list_successful_or_pending_within(
        conn: &mut SqliteConnection,
        from: i64,
        to: i64,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<LightningOutgoingPayment>> {
        let ids: Vec<String> = payments_outgoing::table
            .filter(payments_outgoing::created_at.ge(from))
            .filter(payments_outgoing::created_at.lt(to))
            .filter(
                payments_outgoing::status_type
                    .is_null()
                    .or(payments_outgoing::status_type.eq(OUTGOING_STATUS_SUCCEEDED_OFFCHAIN_V0)),
            )
            .order(payments_outgoing::created_at.desc())
            .limit(limit)
            .offset(offset)
            .select(payments_outgoing::id)
            .load(conn)?;
        LightningOutgoingPayment::load_by_ids(conn, ids)
    }

    pub fn list_for_payment_hash(
        conn: &mut SqliteConnection,
        payment_hash: [u8; 32],
    ) -> anyhow::Result<Vec<LightningOutgoingPayment>> {
        let ids: Vec<String> = payments_outgoing::table
            .filter(payments_outgoing::payment_hash.eq(payment_hash.to_vec()))
            .order(payments_outgoing::created_at.asc())
            .select(payments_outgoing::id)
            .load(conn)?;
        LightningOutgoingPayment::load_by_ids(conn, ids)
    }

    /// Succeeded payments in completion order, paged for the export stream.
    pub(crate) fn page_succeeded(
        conn: &mut SqliteConnection,
        from: i64,
        to: i64,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<LightningOutgoingPayment>> {
        let ids: Vec<String> = payments_outgoing::table
            .filter(payments_outgoing::status_type.eq(OUTGOING_STATUS_SUCCEEDED_OFFCHAIN_V0))
            .filter(payments_outgoing::completed_at.ge(from))
            .filter(payments_outgoing::completed_at.lt(to))
            .order(payments_outgoing::completed_at.asc())
            .limit(limit)
            .offset(offset)
            .select(payments_outgoing::id)
            .load(conn)?;
        LightningOutgoingPayment::load_by_ids(conn, ids)
    }

    fn load_by_ids(
        conn: &mut SqliteConnection,
        ids: Vec<String>,
    ) -> anyhow::Result<Vec<LightningOutgoingPayment>> {
        let mut payments = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(payment) = LightningOutgoingPayment::get(conn, Uuid::from_str(&id)?)? {
                payments.push(payment);
            }
        }
        Ok(payments)
    }

    /// Raw part count, including the parts `filter_useless_parts` hides.
    pub fn count_parts(conn: &mut SqliteConnection, parent_id: Uuid) -> anyhow::Result<i64> {
        Ok(payments_outgoing_parts::table
            .filter(payments_outgoing_parts::parent_id.eq(parent_id.to_string()))
            .count()
            .get_result(conn)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    fn pubkey(byte: u8) -> PublicKey {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        PublicKey::from_secret_key(&secp, &sk)
    }

    #[test]
    fn details_roundtrip() {
        let details = vec![
            OutgoingDetails::Normal {
                payment_request: "lnbc1pexample".to_string(),
            },
            OutgoingDetails::KeySend {
                preimage: [3u8; 32],
            },
            OutgoingDetails::SwapOut {
                address: "bc1qexample".to_string(),
                payment_request: "lnbc1pswap".to_string(),
                swap_out_fee_sat: 1_200,
            },
            OutgoingDetails::Blinded {
                payment_request: "lni1pexample".to_string(),
                payer_key: pubkey(9),
            },
        ];
        for d in details {
            let (tag, blob) = d.encode();
            assert_eq!(OutgoingDetails::decode(tag, &blob).unwrap(), d);
        }
    }

    #[test]
    fn details_tags_are_stable() {
        assert_eq!(
            OutgoingDetails::Normal {
                payment_request: String::new()
            }
            .encode()
            .0,
            10
        );
        assert_eq!(
            OutgoingDetails::KeySend { preimage: [0; 32] }.encode().0,
            20
        );
        assert_eq!(
            OutgoingDetails::SwapOut {
                address: String::new(),
                payment_request: String::new(),
                swap_out_fee_sat: 0
            }
            .encode()
            .0,
            30
        );
        assert_eq!(
            OutgoingDetails::Blinded {
                payment_request: String::new(),
                payer_key: pubkey(1)
            }
            .encode()
            .0,
            40
        );
    }

    #[test]
    fn status_roundtrip_and_copresence() {
        let succeeded = OutgoingStatus::Succeeded {
            preimage: [5u8; 32],
            completed_at: 1234,
        };
        let (at, tag, blob) = succeeded.encode();
        assert_eq!(
            OutgoingStatus::decode(at, tag, blob.as_deref()).unwrap(),
            succeeded
        );

        let failed = OutgoingStatus::Failed {
            reason: FinalFailure::RecipientUnreachable,
            completed_at: 99,
        };
        let (at, tag, blob) = failed.encode();
        assert_eq!(
            OutgoingStatus::decode(at, tag, blob.as_deref()).unwrap(),
            failed
        );

        assert_eq!(
            OutgoingStatus::decode(None, None, None).unwrap(),
            OutgoingStatus::Pending
        );

        // completed_at without a status blob is corrupt
        let err = OutgoingStatus::decode(Some(5), None, None).unwrap_err();
        assert!(matches!(err, StoreError::UnhandledOutgoingStatus { .. }));
    }

    #[test]
    fn part_status_copresence() {
        let err = OutgoingPartStatus::decode(None, Some(10), Some(b"{}")).unwrap_err();
        assert!(matches!(
            err,
            StoreError::UnhandledOutgoingPartStatus { .. }
        ));
    }

    #[test]
    fn unknown_status_tag_fails() {
        let err = OutgoingStatus::decode(Some(1), Some(777), Some(b"{}")).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Decode(DecodeError::UnknownTag { tag: 777, .. })
        ));
    }

    #[test]
    fn short_channel_id_rendering() {
        let scid = ShortChannelId::new(812_000, 1_234, 3);
        assert_eq!(scid.to_string(), "812000x1234x3");
        assert_eq!("812000x1234x3".parse::<ShortChannelId>().unwrap(), scid);
        assert!("812000x1234".parse::<ShortChannelId>().is_err());
        assert!("axbxc".parse::<ShortChannelId>().is_err());
    }

    #[test]
    fn route_roundtrip() {
        let hops = vec![
            RouteHop {
                node_a: pubkey(1),
                node_b: pubkey(2),
                short_channel_id: Some(ShortChannelId::new(100, 2, 1)),
            },
            RouteHop {
                node_a: pubkey(2),
                node_b: pubkey(3),
                short_channel_id: None,
            },
        ];
        let encoded = encode_route(&hops);
        assert!(encoded.contains("100x2x1"));
        assert!(encoded.ends_with(':'));
        assert_eq!(decode_route(&encoded).unwrap(), hops);
    }

    #[test]
    fn empty_route_is_empty_string() {
        assert_eq!(encode_route(&[]), "");
        assert_eq!(decode_route("").unwrap(), Vec::new());
    }

    #[test]
    fn succeeded_payment_hides_failed_parts() {
        let part = |status: OutgoingPartStatus| OutgoingPart {
            part_id: Uuid::new_v4(),
            amount_msat: 1_000,
            route: vec![],
            status,
            created_at: 0,
        };
        let payment = LightningOutgoingPayment {
            payment_id: Uuid::new_v4(),
            payment_hash: [1; 32],
            recipient: pubkey(4),
            recipient_amount_msat: 1_000,
            details: OutgoingDetails::Normal {
                payment_request: String::new(),
            },
            parts: vec![
                part(OutgoingPartStatus::Failed {
                    failure: PartFailure::TemporaryRemoteFailure,
                    completed_at: 1,
                }),
                part(OutgoingPartStatus::Succeeded {
                    preimage: [2; 32],
                    completed_at: 2,
                }),
            ],
            status: OutgoingStatus::Succeeded {
                preimage: [2; 32],
                completed_at: 2,
            },
            created_at: 0,
        };

        let filtered = payment.clone().filter_useless_parts();
        assert_eq!(filtered.parts.len(), 1);

        let pending = LightningOutgoingPayment {
            status: OutgoingStatus::Pending,
            ..payment
        };
        assert_eq!(pending.filter_useless_parts().parts.len(), 2);
    }
}
