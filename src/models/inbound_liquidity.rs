use crate::models::schema::payments_inbound_liquidity;
use crate::models::{hex_bytes, DecodeError, StoreError};
use bitcoin::hashes::Hash;
use bitcoin::Txid;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

pub const LIQUIDITY_PURCHASE_STANDARD_V0: i32 = 10;
pub const LIQUIDITY_PURCHASE_WITH_FEE_CREDIT_V0: i32 = 20;

/// Terms of an inbound liquidity lease bought from the LSP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiquidityPurchase {
    #[serde(rename_all = "camelCase")]
    Standard {
        amount_sat: u64,
        mining_fee_sat: u64,
        service_fee_sat: u64,
    },
    /// Part of the fees were settled from accumulated fee credit.
    #[serde(rename_all = "camelCase")]
    WithFeeCredit {
        amount_sat: u64,
        mining_fee_sat: u64,
        service_fee_sat: u64,
        fee_credit_used_msat: u64,
    },
}

#[derive(Serialize, Deserialize)]
struct PurchaseStandardV0 {
    amount_sat: u64,
    mining_fee_sat: u64,
    service_fee_sat: u64,
}

#[derive(Serialize, Deserialize)]
struct PurchaseWithFeeCreditV0 {
    amount_sat: u64,
    mining_fee_sat: u64,
    service_fee_sat: u64,
    fee_credit_used_msat: u64,
}

impl LiquidityPurchase {
    pub fn amount_sat(&self) -> u64 {
        match self {
            LiquidityPurchase::Standard { amount_sat, .. }
            | LiquidityPurchase::WithFeeCredit { amount_sat, .. } => *amount_sat,
        }
    }

    pub fn service_fee_sat(&self) -> u64 {
        match self {
            LiquidityPurchase::Standard {
                service_fee_sat, ..
            }
            | LiquidityPurchase::WithFeeCredit {
                service_fee_sat, ..
            } => *service_fee_sat,
        }
    }

    pub fn encode(&self) -> (i32, Vec<u8>) {
        match self {
            LiquidityPurchase::Standard {
                amount_sat,
                mining_fee_sat,
                service_fee_sat,
            } => (
                LIQUIDITY_PURCHASE_STANDARD_V0,
                serde_json::to_vec(&PurchaseStandardV0 {
                    amount_sat: *amount_sat,
                    mining_fee_sat: *mining_fee_sat,
                    service_fee_sat: *service_fee_sat,
                })
                .expect("purchase serialization is infallible"),
            ),
            LiquidityPurchase::WithFeeCredit {
                amount_sat,
                mining_fee_sat,
                service_fee_sat,
                fee_credit_used_msat,
            } => (
                LIQUIDITY_PURCHASE_WITH_FEE_CREDIT_V0,
                serde_json::to_vec(&PurchaseWithFeeCreditV0 {
                    amount_sat: *amount_sat,
                    mining_fee_sat: *mining_fee_sat,
                    service_fee_sat: *service_fee_sat,
                    fee_credit_used_msat: *fee_credit_used_msat,
                })
                .expect("purchase serialization is infallible"),
            ),
        }
    }

    pub fn decode(tag: i32, blob: &[u8]) -> Result<LiquidityPurchase, DecodeError> {
        const FAMILY: &str = "liquidity purchase";
        let malformed = |source| DecodeError::MalformedBlob {
            family: FAMILY,
            source,
        };
        match tag {
            LIQUIDITY_PURCHASE_STANDARD_V0 => {
                let v: PurchaseStandardV0 = serde_json::from_slice(blob).map_err(malformed)?;
                Ok(LiquidityPurchase::Standard {
                    amount_sat: v.amount_sat,
                    mining_fee_sat: v.mining_fee_sat,
                    service_fee_sat: v.service_fee_sat,
                })
            }
            LIQUIDITY_PURCHASE_WITH_FEE_CREDIT_V0 => {
                let v: PurchaseWithFeeCreditV0 = serde_json::from_slice(blob).map_err(malformed)?;
                Ok(LiquidityPurchase::WithFeeCredit {
                    amount_sat: v.amount_sat,
                    mining_fee_sat: v.mining_fee_sat,
                    service_fee_sat: v.service_fee_sat,
                    fee_credit_used_msat: v.fee_credit_used_msat,
                })
            }
            _ => Err(DecodeError::UnknownTag { family: FAMILY, tag }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundLiquidityOutgoingPayment {
    pub payment_id: Uuid,
    #[serde(with = "hex_bytes")]
    pub channel_id: [u8; 32],
    pub tx_id: Txid,
    pub mining_fee_sat: u64,
    pub purchase: LiquidityPurchase,
    pub created_at: i64,
    pub confirmed_at: Option<i64>,
    pub locked_at: Option<i64>,
}

#[derive(Queryable, Insertable, Identifiable, AsChangeset, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = payments_inbound_liquidity)]
#[diesel(primary_key(id))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct InboundLiquidityRow {
    id: String,
    channel_id: Vec<u8>,
    tx_id: Vec<u8>,
    mining_fee_sat: i64,
    purchase_type: i32,
    purchase_blob: Vec<u8>,
    created_at: i64,
    confirmed_at: Option<i64>,
    locked_at: Option<i64>,
}

impl InboundLiquidityRow {
    fn from_payment(payment: &InboundLiquidityOutgoingPayment) -> InboundLiquidityRow {
        let (purchase_type, purchase_blob) = payment.purchase.encode();
        InboundLiquidityRow {
            id: payment.payment_id.to_string(),
            channel_id: payment.channel_id.to_vec(),
            tx_id: payment.tx_id.to_byte_array().to_vec(),
            mining_fee_sat: payment.mining_fee_sat as i64,
            purchase_type,
            purchase_blob,
            created_at: payment.created_at,
            confirmed_at: payment.confirmed_at,
            locked_at: payment.locked_at,
        }
    }

    fn into_payment(self) -> anyhow::Result<InboundLiquidityOutgoingPayment> {
        let channel_id: [u8; 32] = self
            .channel_id
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("invalid channel id length"))?;
        let tx_id: [u8; 32] = self
            .tx_id
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("invalid txid length"))?;
        let purchase = LiquidityPurchase::decode(self.purchase_type, &self.purchase_blob)
            .map_err(StoreError::Decode)?;
        Ok(InboundLiquidityOutgoingPayment {
            payment_id: Uuid::from_str(&self.id)?,
            channel_id,
            tx_id: Txid::from_byte_array(tx_id),
            mining_fee_sat: self.mining_fee_sat as u64,
            purchase,
            created_at: self.created_at,
            confirmed_at: self.confirmed_at,
            locked_at: self.locked_at,
        })
    }
}

impl InboundLiquidityOutgoingPayment {
    pub fn add(
        conn: &mut SqliteConnection,
        payment: &InboundLiquidityOutgoingPayment,
    ) -> anyhow::Result<()> {
        diesel::insert_into(payments_inbound_liquidity::table)
            .values(InboundLiquidityRow::from_payment(payment))
            .execute(conn)?;
        Ok(())
    }

    pub fn get(
        conn: &mut SqliteConnection,
        id: Uuid,
    ) -> anyhow::Result<Option<InboundLiquidityOutgoingPayment>> {
        let row: Option<InboundLiquidityRow> = payments_inbound_liquidity::table
            .find(id.to_string())
            .first(conn)
            .optional()?;
        row.map(|r| r.into_payment()).transpose()
    }

    pub fn set_locked_by_tx(
        conn: &mut SqliteConnection,
        tx_id: Txid,
        locked_at: i64,
    ) -> anyhow::Result<usize> {
        Ok(diesel::update(
            payments_inbound_liquidity::table
                .filter(payments_inbound_liquidity::tx_id.eq(tx_id.to_byte_array().to_vec())),
        )
        .set(payments_inbound_liquidity::locked_at.eq(Some(locked_at)))
        .execute(conn)?)
    }

    pub fn set_confirmed_by_tx(
        conn: &mut SqliteConnection,
        tx_id: Txid,
        confirmed_at: i64,
    ) -> anyhow::Result<usize> {
        Ok(diesel::update(
            payments_inbound_liquidity::table
                .filter(payments_inbound_liquidity::tx_id.eq(tx_id.to_byte_array().to_vec())),
        )
        .set(payments_inbound_liquidity::confirmed_at.eq(Some(confirmed_at)))
        .execute(conn)?)
    }

    pub fn list_within(
        conn: &mut SqliteConnection,
        from: i64,
        to: i64,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<InboundLiquidityOutgoingPayment>> {
        let rows: Vec<InboundLiquidityRow> = payments_inbound_liquidity::table
            .filter(payments_inbound_liquidity::created_at.ge(from))
            .filter(payments_inbound_liquidity::created_at.lt(to))
            .order(payments_inbound_liquidity::created_at.desc())
            .limit(limit)
            .offset(offset)
            .load(conn)?;
        rows.into_iter().map(|r| r.into_payment()).collect()
    }

    /// Confirmed purchases in completion order, paged for the export stream.
    pub(crate) fn page_confirmed(
        conn: &mut SqliteConnection,
        from: i64,
        to: i64,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<InboundLiquidityOutgoingPayment>> {
        let rows: Vec<InboundLiquidityRow> = payments_inbound_liquidity::table
            .filter(payments_inbound_liquidity::confirmed_at.ge(from))
            .filter(payments_inbound_liquidity::confirmed_at.lt(to))
            .order(payments_inbound_liquidity::confirmed_at.asc())
            .limit(limit)
            .offset(offset)
            .load(conn)?;
        rows.into_iter().map(|r| r.into_payment()).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn purchase_roundtrip() {
        let purchases = vec![
            LiquidityPurchase::Standard {
                amount_sat: 2_000_000,
                mining_fee_sat: 10_000,
                service_fee_sat: 20_000,
            },
            LiquidityPurchase::WithFeeCredit {
                amount_sat: 100_000,
                mining_fee_sat: 2_000,
                service_fee_sat: 1_000,
                fee_credit_used_msat: 29_900_000,
            },
        ];
        for p in purchases {
            let (tag, blob) = p.encode();
            assert_eq!(LiquidityPurchase::decode(tag, &blob).unwrap(), p);
        }
        assert!(matches!(
            LiquidityPurchase::decode(3, b"{}").unwrap_err(),
            DecodeError::UnknownTag { tag: 3, .. }
        ));
    }
}
