use crate::models::schema::{payment_metadata, payments_incoming};
use crate::models::{hex_bytes, hex_vec, DecodeError, PaymentType, StoreError};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::Txid;
use diesel::prelude::*;
use lightning_invoice::Bolt11Invoice;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

// Type tags for the persisted `(type, blob)` pairs. Tags are append-only and
// never reused; a new variant or wire revision gets a fresh value.
pub const INCOMING_ORIGIN_INVOICE_V0: i32 = 10;
pub const INCOMING_ORIGIN_OFFER_V0: i32 = 20;
pub const INCOMING_ORIGIN_SWAP_IN_V0: i32 = 30;
pub const INCOMING_ORIGIN_ON_CHAIN_V0: i32 = 40;

pub const INCOMING_RECEIVED_WITH_MULTIPART_V0: i32 = 10;

/// How an incoming payment came to exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IncomingOrigin {
    /// A BOLT11 invoice we issued.
    Invoice { payment_request: String },
    /// A payment bound to one of our BOLT12 offers. The metadata is the
    /// opaque blob the protocol engine needs to recognize the offer.
    Offer {
        #[serde(with = "hex_vec")]
        encoded_metadata: Vec<u8>,
    },
    /// Funds sent to our swap-in address.
    SwapIn { address: Option<String> },
    /// Funds detected directly on-chain.
    OnChain { tx_ids: Vec<Txid> },
}

#[derive(Serialize, Deserialize)]
struct OriginInvoiceV0 {
    payment_request: String,
}

#[derive(Serialize, Deserialize)]
struct OriginOfferV0 {
    #[serde(with = "hex_vec")]
    encoded_metadata: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct OriginSwapInV0 {
    address: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct OriginOnChainV0 {
    tx_ids: Vec<Txid>,
}

impl IncomingOrigin {
    pub fn encode(&self) -> (i32, Vec<u8>) {
        match self {
            IncomingOrigin::Invoice { payment_request } => (
                INCOMING_ORIGIN_INVOICE_V0,
                serde_json::to_vec(&OriginInvoiceV0 {
                    payment_request: payment_request.clone(),
                })
                .expect("origin serialization is infallible"),
            ),
            IncomingOrigin::Offer { encoded_metadata } => (
                INCOMING_ORIGIN_OFFER_V0,
                serde_json::to_vec(&OriginOfferV0 {
                    encoded_metadata: encoded_metadata.clone(),
                })
                .expect("origin serialization is infallible"),
            ),
            IncomingOrigin::SwapIn { address } => (
                INCOMING_ORIGIN_SWAP_IN_V0,
                serde_json::to_vec(&OriginSwapInV0 {
                    address: address.clone(),
                })
                .expect("origin serialization is infallible"),
            ),
            IncomingOrigin::OnChain { tx_ids } => (
                INCOMING_ORIGIN_ON_CHAIN_V0,
                serde_json::to_vec(&OriginOnChainV0 {
                    tx_ids: tx_ids.clone(),
                })
                .expect("origin serialization is infallible"),
            ),
        }
    }

    pub fn decode(tag: i32, blob: &[u8]) -> Result<IncomingOrigin, DecodeError> {
        const FAMILY: &str = "incoming origin";
        let malformed = |source| DecodeError::MalformedBlob {
            family: FAMILY,
            source,
        };
        match tag {
            INCOMING_ORIGIN_INVOICE_V0 => {
                let v: OriginInvoiceV0 = serde_json::from_slice(blob).map_err(malformed)?;
                Ok(IncomingOrigin::Invoice {
                    payment_request: v.payment_request,
                })
            }
            INCOMING_ORIGIN_OFFER_V0 => {
                let v: OriginOfferV0 = serde_json::from_slice(blob).map_err(malformed)?;
                Ok(IncomingOrigin::Offer {
                    encoded_metadata: v.encoded_metadata,
                })
            }
            INCOMING_ORIGIN_SWAP_IN_V0 => {
                let v: OriginSwapInV0 = serde_json::from_slice(blob).map_err(malformed)?;
                Ok(IncomingOrigin::SwapIn { address: v.address })
            }
            INCOMING_ORIGIN_ON_CHAIN_V0 => {
                let v: OriginOnChainV0 = serde_json::from_slice(blob).map_err(malformed)?;
                Ok(IncomingOrigin::OnChain { tx_ids: v.tx_ids })
            }
            _ => Err(DecodeError::UnknownTag { family: FAMILY, tag }),
        }
    }
}

/// One way a receipt was funded. A single payment can accumulate several of
/// these across multiple `receive` calls (MPP, splice plus HTLC, and so on).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ReceivedPart {
    #[serde(rename = "lightning_payment_v0", rename_all = "camelCase")]
    LightningPayment {
        amount_msat: u64,
        #[serde(with = "hex_bytes")]
        channel_id: [u8; 32],
        htlc_id: u64,
    },
    #[serde(rename = "new_channel_v0", rename_all = "camelCase")]
    NewChannel {
        amount_msat: u64,
        service_fee_msat: u64,
        mining_fee_sat: u64,
        #[serde(with = "hex_bytes")]
        channel_id: [u8; 32],
        funding_tx_id: Txid,
        is_opener: bool,
        confirmed_at: Option<i64>,
        locked_at: Option<i64>,
    },
    #[serde(rename = "splice_in_v0", rename_all = "camelCase")]
    SpliceIn {
        amount_msat: u64,
        service_fee_msat: u64,
        mining_fee_sat: u64,
        #[serde(with = "hex_bytes")]
        channel_id: [u8; 32],
        funding_tx_id: Txid,
        confirmed_at: Option<i64>,
        locked_at: Option<i64>,
    },
    #[serde(rename = "added_to_fee_credit_v0", rename_all = "camelCase")]
    AddedToFeeCredit { amount_msat: u64 },
    #[serde(rename = "fee_credit_payment_v0", rename_all = "camelCase")]
    FeeCreditPayment { amount_msat: u64 },
}

impl ReceivedPart {
    pub fn amount_msat(&self) -> u64 {
        match self {
            ReceivedPart::LightningPayment { amount_msat, .. }
            | ReceivedPart::NewChannel { amount_msat, .. }
            | ReceivedPart::SpliceIn { amount_msat, .. }
            | ReceivedPart::AddedToFeeCredit { amount_msat }
            | ReceivedPart::FeeCreditPayment { amount_msat } => *amount_msat,
        }
    }

    pub fn fees_msat(&self) -> u64 {
        match self {
            ReceivedPart::NewChannel {
                service_fee_msat,
                mining_fee_sat,
                ..
            }
            | ReceivedPart::SpliceIn {
                service_fee_msat,
                mining_fee_sat,
                ..
            } => service_fee_msat + mining_fee_sat * 1_000,
            _ => 0,
        }
    }

    /// Natural identity used when merging receipts. Fee-credit entries have
    /// none: each one is a distinct accrual.
    fn natural_key(&self) -> Option<String> {
        match self {
            ReceivedPart::LightningPayment {
                channel_id,
                htlc_id,
                ..
            } => Some(format!("htlc:{}:{htlc_id}", hex::encode(channel_id))),
            ReceivedPart::NewChannel {
                channel_id,
                funding_tx_id,
                ..
            } => Some(format!("chan:{}:{funding_tx_id}", hex::encode(channel_id))),
            ReceivedPart::SpliceIn {
                channel_id,
                funding_tx_id,
                ..
            } => Some(format!("splice:{}:{funding_tx_id}", hex::encode(channel_id))),
            ReceivedPart::AddedToFeeCredit { .. } | ReceivedPart::FeeCreditPayment { .. } => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ReceivedWithMultipartV0 {
    parts: Vec<ReceivedPart>,
}

pub fn encode_received_with(parts: &[ReceivedPart]) -> (i32, Vec<u8>) {
    (
        INCOMING_RECEIVED_WITH_MULTIPART_V0,
        serde_json::to_vec(&ReceivedWithMultipartV0 {
            parts: parts.to_vec(),
        })
        .expect("received-with serialization is infallible"),
    )
}

pub fn decode_received_with(tag: i32, blob: &[u8]) -> Result<Vec<ReceivedPart>, DecodeError> {
    const FAMILY: &str = "incoming received-with";
    match tag {
        INCOMING_RECEIVED_WITH_MULTIPART_V0 => {
            let v: ReceivedWithMultipartV0 =
                serde_json::from_slice(blob).map_err(|source| DecodeError::MalformedBlob {
                    family: FAMILY,
                    source,
                })?;
            Ok(v.parts)
        }
        _ => Err(DecodeError::UnknownTag { family: FAMILY, tag }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingReceived {
    pub received_at: i64,
    pub received_with: Vec<ReceivedPart>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingPayment {
    pub payment_id: Uuid,
    #[serde(with = "hex_bytes")]
    pub payment_hash: [u8; 32],
    #[serde(with = "hex_bytes")]
    pub preimage: [u8; 32],
    pub origin: IncomingOrigin,
    pub received: Option<IncomingReceived>,
    pub created_at: i64,
}

impl IncomingPayment {
    pub fn amount_received_msat(&self) -> u64 {
        self.received
            .as_ref()
            .map(|r| r.received_with.iter().map(|p| p.amount_msat()).sum())
            .unwrap_or(0)
    }

    pub fn fees_msat(&self) -> u64 {
        self.received
            .as_ref()
            .map(|r| r.received_with.iter().map(|p| p.fees_msat()).sum())
            .unwrap_or(0)
    }

    pub fn is_confirmed(&self) -> bool {
        self.received.as_ref().is_some_and(|r| {
            r.received_with.iter().all(|p| match p {
                ReceivedPart::NewChannel { confirmed_at, .. }
                | ReceivedPart::SpliceIn { confirmed_at, .. } => confirmed_at.is_some(),
                _ => true,
            })
        })
    }
}

/// Incoming payment ids are derived from the payment hash so that the same
/// payment always maps to the same 128-bit identifier.
pub fn incoming_payment_id(payment_hash: &[u8; 32]) -> Uuid {
    Uuid::from_slice(&payment_hash[..16]).expect("16 bytes make a uuid")
}

fn invoice_expires_at_millis(invoice: &Bolt11Invoice) -> i64 {
    (invoice.duration_since_epoch() + invoice.expiry_time()).as_millis() as i64
}

#[derive(Queryable, Insertable, Identifiable, AsChangeset, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = payments_incoming)]
#[diesel(primary_key(payment_hash))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct IncomingPaymentRow {
    payment_hash: Vec<u8>,
    payment_id: String,
    preimage: Vec<u8>,
    origin_type: i32,
    origin_blob: Vec<u8>,
    received_at: Option<i64>,
    received_with_type: Option<i32>,
    received_with_blob: Option<Vec<u8>>,
    created_at: i64,
}

impl IncomingPaymentRow {
    fn into_payment(self) -> anyhow::Result<IncomingPayment> {
        let payment_hash: [u8; 32] = self
            .payment_hash
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("invalid payment hash length"))?;
        let preimage: [u8; 32] = self
            .preimage
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("invalid preimage length"))?;
        let origin = IncomingOrigin::decode(self.origin_type, &self.origin_blob)
            .map_err(StoreError::Decode)?;

        let received = match (
            self.received_at,
            self.received_with_type,
            self.received_with_blob,
        ) {
            (None, None, None) => None,
            (Some(received_at), None, None) => Some(IncomingReceived {
                received_at,
                received_with: Vec::new(),
            }),
            (Some(received_at), Some(tag), Some(blob)) => Some(IncomingReceived {
                received_at,
                received_with: decode_received_with(tag, &blob).map_err(StoreError::Decode)?,
            }),
            (received_at, received_with_type, received_with_blob) => {
                return Err(StoreError::UnreadableIncomingReceivedWith {
                    received_at,
                    received_with_type,
                    received_with_blob,
                }
                .into())
            }
        };

        Ok(IncomingPayment {
            payment_id: Uuid::from_str(&self.payment_id)?,
            payment_hash,
            preimage,
            origin,
            received,
            created_at: self.created_at,
        })
    }
}

/// Accumulating union of receipts. Parts with a natural key replace their
/// previous entry (the newer one carries fresher lifecycle fields); keyless
/// parts are appended as-is.
fn merge_received_with(
    existing: Vec<ReceivedPart>,
    incoming: Vec<ReceivedPart>,
) -> Vec<ReceivedPart> {
    let mut merged = existing;
    for part in incoming {
        match part.natural_key() {
            Some(key) => {
                let slot = merged
                    .iter()
                    .position(|p| p.natural_key().as_deref() == Some(key.as_str()));
                match slot {
                    Some(index) => merged[index] = part,
                    None => merged.push(part),
                }
            }
            None => merged.push(part),
        }
    }
    merged
}

impl IncomingPayment {
    pub fn add(
        conn: &mut SqliteConnection,
        preimage: [u8; 32],
        payment_hash: [u8; 32],
        origin: IncomingOrigin,
        created_at: i64,
    ) -> anyhow::Result<IncomingPayment> {
        let expected = sha256::Hash::hash(&preimage).to_byte_array();
        if expected != payment_hash {
            anyhow::bail!("preimage does not match payment hash");
        }

        let (origin_type, origin_blob) = origin.encode();
        let row = IncomingPaymentRow {
            payment_hash: payment_hash.to_vec(),
            payment_id: incoming_payment_id(&payment_hash).to_string(),
            preimage: preimage.to_vec(),
            origin_type,
            origin_blob,
            received_at: None,
            received_with_type: None,
            received_with_blob: None,
            created_at,
        };

        diesel::insert_into(payments_incoming::table)
            .values(&row)
            .execute(conn)?;

        row.into_payment()
    }

    pub fn get(
        conn: &mut SqliteConnection,
        payment_hash: [u8; 32],
    ) -> anyhow::Result<Option<IncomingPayment>> {
        let row: Option<IncomingPaymentRow> = payments_incoming::table
            .find(payment_hash.to_vec())
            .first(conn)
            .optional()?;
        row.map(|r| r.into_payment()).transpose()
    }

    /// Records a receipt. Parts accumulate across calls; the first successful
    /// call establishes `received_at`.
    pub fn receive(
        conn: &mut SqliteConnection,
        payment_hash: [u8; 32],
        received_with: Vec<ReceivedPart>,
        received_at: i64,
    ) -> anyhow::Result<IncomingPayment> {
        conn.immediate_transaction(|conn| {
            let row: Option<IncomingPaymentRow> = payments_incoming::table
                .find(payment_hash.to_vec())
                .first(conn)
                .optional()?;
            let row = row.ok_or_else(|| {
                StoreError::IncomingPaymentNotFound(hex::encode(payment_hash))
            })?;
            let mut payment = row.into_payment()?;

            let (prior_at, prior_parts) = match payment.received.take() {
                Some(received) => (Some(received.received_at), received.received_with),
                None => (None, Vec::new()),
            };

            let merged = merge_received_with(prior_parts, received_with);
            let received_at = prior_at.unwrap_or(received_at);
            let (tag, blob) = encode_received_with(&merged);

            diesel::update(payments_incoming::table.find(payment_hash.to_vec()))
                .set((
                    payments_incoming::received_at.eq(Some(received_at)),
                    payments_incoming::received_with_type.eq(Some(tag)),
                    payments_incoming::received_with_blob.eq(Some(blob)),
                ))
                .execute(conn)?;

            payment.received = Some(IncomingReceived {
                received_at,
                received_with: merged,
            });
            Ok(payment)
        })
    }

    /// Marks the funding transaction of every `NewChannel`/`SpliceIn` part as
    /// seen on-chain. `received_at` is overwritten with `locked_at` so that
    /// listings ordered by receipt date surface the change.
    pub fn set_locked(
        conn: &mut SqliteConnection,
        payment_hash: [u8; 32],
        locked_at: i64,
    ) -> anyhow::Result<bool> {
        conn.immediate_transaction(|conn| {
            let row: Option<IncomingPaymentRow> = payments_incoming::table
                .find(payment_hash.to_vec())
                .first(conn)
                .optional()?;
            let Some(row) = row else {
                return Ok(false);
            };
            let payment = row.into_payment()?;

            let Some(received) = payment.received else {
                return Ok(false);
            };
            let parts = rewrite_funding_parts(received.received_with, |confirmed, _locked| {
                (confirmed, Some(locked_at))
            });
            let (tag, blob) = encode_received_with(&parts);

            diesel::update(payments_incoming::table.find(payment_hash.to_vec()))
                .set((
                    payments_incoming::received_at.eq(Some(locked_at)),
                    payments_incoming::received_with_type.eq(Some(tag)),
                    payments_incoming::received_with_blob.eq(Some(blob)),
                ))
                .execute(conn)?;

            Ok(true)
        })
    }

    /// Marks the funding transaction of every `NewChannel`/`SpliceIn` part as
    /// sufficiently confirmed. `received_at` is preserved.
    pub fn set_confirmed(
        conn: &mut SqliteConnection,
        payment_hash: [u8; 32],
        confirmed_at: i64,
    ) -> anyhow::Result<bool> {
        conn.immediate_transaction(|conn| {
            let row: Option<IncomingPaymentRow> = payments_incoming::table
                .find(payment_hash.to_vec())
                .first(conn)
                .optional()?;
            let Some(row) = row else {
                return Ok(false);
            };
            let payment = row.into_payment()?;

            let Some(received) = payment.received else {
                return Ok(false);
            };
            let parts = rewrite_funding_parts(received.received_with, |_confirmed, locked| {
                (Some(confirmed_at), locked)
            });
            let (tag, blob) = encode_received_with(&parts);

            diesel::update(payments_incoming::table.find(payment_hash.to_vec()))
                .set((
                    payments_incoming::received_with_type.eq(Some(tag)),
                    payments_incoming::received_with_blob.eq(Some(blob)),
                ))
                .execute(conn)?;

            Ok(true)
        })
    }

    /// Deletes an unreceived payment. Returns true iff one row was removed.
    pub fn delete(conn: &mut SqliteConnection, payment_hash: [u8; 32]) -> anyhow::Result<bool> {
        let count = diesel::delete(
            payments_incoming::table
                .filter(payments_incoming::payment_hash.eq(payment_hash.to_vec()))
                .filter(payments_incoming::received_at.is_null()),
        )
        .execute(conn)?;
        Ok(count == 1)
    }

    /// Received payments with at least one funding part not yet confirmed.
    pub fn list_all_not_confirmed(
        conn: &mut SqliteConnection,
    ) -> anyhow::Result<Vec<IncomingPayment>> {
        let rows: Vec<IncomingPaymentRow> = payments_incoming::table
            .filter(payments_incoming::received_with_type.is_not_null())
            .order(payments_incoming::received_at.asc())
            .load(conn)?;
        let payments = rows
            .into_iter()
            .map(|r| r.into_payment())
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(payments.into_iter().filter(|p| !p.is_confirmed()).collect())
    }

    pub fn list_created_within(
        conn: &mut SqliteConnection,
        from: i64,
        to: i64,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<IncomingPayment>> {
        let rows: Vec<IncomingPaymentRow> = payments_incoming::table
            .filter(payments_incoming::created_at.ge(from))
            .filter(payments_incoming::created_at.lt(to))
            .order(payments_incoming::created_at.desc())
            .limit(limit)
            .offset(offset)
            .load(conn)?;
        rows.into_iter().map(|r| r.into_payment()).collect()
    }

    pub fn list_received_within(
        conn: &mut SqliteConnection,
        from: i64,
        to: i64,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<IncomingPayment>> {
        let rows: Vec<IncomingPaymentRow> = payments_incoming::table
            .filter(payments_incoming::received_at.ge(from))
            .filter(payments_incoming::received_at.lt(to))
            .order(payments_incoming::received_at.desc())
            .limit(limit)
            .offset(offset)
            .load(conn)?;
        rows.into_iter().map(|r| r.into_payment()).collect()
    }

    pub fn list_created_within_external_id(
        conn: &mut SqliteConnection,
        external_id: &str,
        from: i64,
        to: i64,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<IncomingPayment>> {
        let ids = metadata_payment_ids(conn, external_id)?;
        let rows: Vec<IncomingPaymentRow> = payments_incoming::table
            .filter(payments_incoming::payment_id.eq_any(ids))
            .filter(payments_incoming::created_at.ge(from))
            .filter(payments_incoming::created_at.lt(to))
            .order(payments_incoming::created_at.desc())
            .limit(limit)
            .offset(offset)
            .load(conn)?;
        rows.into_iter().map(|r| r.into_payment()).collect()
    }

    pub fn list_received_within_external_id(
        conn: &mut SqliteConnection,
        external_id: &str,
        from: i64,
        to: i64,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<IncomingPayment>> {
        let ids = metadata_payment_ids(conn, external_id)?;
        let rows: Vec<IncomingPaymentRow> = payments_incoming::table
            .filter(payments_incoming::payment_id.eq_any(ids))
            .filter(payments_incoming::received_at.ge(from))
            .filter(payments_incoming::received_at.lt(to))
            .order(payments_incoming::received_at.desc())
            .limit(limit)
            .offset(offset)
            .load(conn)?;
        rows.into_iter().map(|r| r.into_payment()).collect()
    }

    pub fn oldest_received_date(conn: &mut SqliteConnection) -> anyhow::Result<Option<i64>> {
        let min: Option<i64> = payments_incoming::table
            .select(diesel::dsl::min(payments_incoming::received_at))
            .first(conn)?;
        Ok(min)
    }

    /// Unreceived invoice payments whose invoice expiry falls within the
    /// window and has already passed. Expiry comes from the BOLT11 fields.
    pub fn list_expired(
        conn: &mut SqliteConnection,
        from: i64,
        to: i64,
    ) -> anyhow::Result<Vec<IncomingPayment>> {
        let rows: Vec<IncomingPaymentRow> = payments_incoming::table
            .filter(payments_incoming::received_at.is_null())
            .order(payments_incoming::created_at.asc())
            .load(conn)?;

        let mut expired = Vec::new();
        for row in rows {
            let payment = row.into_payment()?;
            let IncomingOrigin::Invoice { payment_request } = &payment.origin else {
                continue;
            };
            let invoice = Bolt11Invoice::from_str(payment_request)
                .map_err(|e| anyhow::anyhow!("stored invoice unparseable: {e}"))?;
            let expires_at = invoice_expires_at_millis(&invoice);
            if invoice.is_expired() && expires_at >= from && expires_at <= to {
                expired.push(payment);
            }
        }
        Ok(expired)
    }

    /// Received payments in receipt order, paged for the export stream.
    pub(crate) fn page_received(
        conn: &mut SqliteConnection,
        from: i64,
        to: i64,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<IncomingPayment>> {
        let rows: Vec<IncomingPaymentRow> = payments_incoming::table
            .filter(payments_incoming::received_at.ge(from))
            .filter(payments_incoming::received_at.lt(to))
            .order(payments_incoming::received_at.asc())
            .limit(limit)
            .offset(offset)
            .load(conn)?;
        rows.into_iter().map(|r| r.into_payment()).collect()
    }
}

fn rewrite_funding_parts(
    parts: Vec<ReceivedPart>,
    apply: impl Fn(Option<i64>, Option<i64>) -> (Option<i64>, Option<i64>),
) -> Vec<ReceivedPart> {
    parts
        .into_iter()
        .map(|part| match part {
            ReceivedPart::NewChannel {
                amount_msat,
                service_fee_msat,
                mining_fee_sat,
                channel_id,
                funding_tx_id,
                is_opener,
                confirmed_at,
                locked_at,
            } => {
                let (confirmed_at, locked_at) = apply(confirmed_at, locked_at);
                ReceivedPart::NewChannel {
                    amount_msat,
                    service_fee_msat,
                    mining_fee_sat,
                    channel_id,
                    funding_tx_id,
                    is_opener,
                    confirmed_at,
                    locked_at,
                }
            }
            ReceivedPart::SpliceIn {
                amount_msat,
                service_fee_msat,
                mining_fee_sat,
                channel_id,
                funding_tx_id,
                confirmed_at,
                locked_at,
            } => {
                let (confirmed_at, locked_at) = apply(confirmed_at, locked_at);
                ReceivedPart::SpliceIn {
                    amount_msat,
                    service_fee_msat,
                    mining_fee_sat,
                    channel_id,
                    funding_tx_id,
                    confirmed_at,
                    locked_at,
                }
            }
            other => other,
        })
        .collect()
}

fn metadata_payment_ids(
    conn: &mut SqliteConnection,
    external_id: &str,
) -> anyhow::Result<Vec<String>> {
    Ok(payment_metadata::table
        .filter(payment_metadata::payment_type.eq(PaymentType::Incoming as i32))
        .filter(payment_metadata::external_id.eq(external_id))
        .select(payment_metadata::payment_id)
        .load(conn)?)
}
