use crate::models::schema::payments_channel_close;
use crate::models::{hex_bytes, DecodeError, StoreError};
use bitcoin::hashes::Hash;
use bitcoin::Txid;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

pub const CHANNEL_CLOSE_MUTUAL_V0: i32 = 10;
pub const CHANNEL_CLOSE_LOCAL_V0: i32 = 20;
pub const CHANNEL_CLOSE_REMOTE_V0: i32 = 30;
pub const CHANNEL_CLOSE_OTHER_V0: i32 = 40;

/// How the channel was closed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosingInfo {
    Mutual,
    Local,
    Remote,
    Other,
}

#[derive(Serialize, Deserialize)]
struct ClosingInfoV0 {}

impl ClosingInfo {
    pub fn encode(&self) -> (i32, Vec<u8>) {
        let tag = match self {
            ClosingInfo::Mutual => CHANNEL_CLOSE_MUTUAL_V0,
            ClosingInfo::Local => CHANNEL_CLOSE_LOCAL_V0,
            ClosingInfo::Remote => CHANNEL_CLOSE_REMOTE_V0,
            ClosingInfo::Other => CHANNEL_CLOSE_OTHER_V0,
        };
        (
            tag,
            serde_json::to_vec(&ClosingInfoV0 {}).expect("closing info serialization is infallible"),
        )
    }

    pub fn decode(tag: i32, blob: &[u8]) -> Result<ClosingInfo, DecodeError> {
        const FAMILY: &str = "channel closing info";
        let _: ClosingInfoV0 =
            serde_json::from_slice(blob).map_err(|source| DecodeError::MalformedBlob {
                family: FAMILY,
                source,
            })?;
        match tag {
            CHANNEL_CLOSE_MUTUAL_V0 => Ok(ClosingInfo::Mutual),
            CHANNEL_CLOSE_LOCAL_V0 => Ok(ClosingInfo::Local),
            CHANNEL_CLOSE_REMOTE_V0 => Ok(ClosingInfo::Remote),
            CHANNEL_CLOSE_OTHER_V0 => Ok(ClosingInfo::Other),
            _ => Err(DecodeError::UnknownTag { family: FAMILY, tag }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelCloseOutgoingPayment {
    pub payment_id: Uuid,
    pub amount_sat: u64,
    pub address: String,
    pub is_sent_to_default_address: bool,
    pub mining_fee_sat: u64,
    #[serde(with = "hex_bytes")]
    pub channel_id: [u8; 32],
    pub tx_id: Txid,
    pub created_at: i64,
    pub confirmed_at: Option<i64>,
    pub locked_at: Option<i64>,
    pub closing_info: ClosingInfo,
}

#[derive(Queryable, Insertable, Identifiable, AsChangeset, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = payments_channel_close)]
#[diesel(primary_key(id))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct ChannelCloseRow {
    id: String,
    amount_sat: i64,
    address: String,
    is_default_address: bool,
    mining_fee_sat: i64,
    channel_id: Vec<u8>,
    tx_id: Vec<u8>,
    closing_type: i32,
    closing_blob: Vec<u8>,
    created_at: i64,
    confirmed_at: Option<i64>,
    locked_at: Option<i64>,
}

impl ChannelCloseRow {
    fn from_payment(payment: &ChannelCloseOutgoingPayment) -> ChannelCloseRow {
        let (closing_type, closing_blob) = payment.closing_info.encode();
        ChannelCloseRow {
            id: payment.payment_id.to_string(),
            amount_sat: payment.amount_sat as i64,
            address: payment.address.clone(),
            is_default_address: payment.is_sent_to_default_address,
            mining_fee_sat: payment.mining_fee_sat as i64,
            channel_id: payment.channel_id.to_vec(),
            tx_id: payment.tx_id.to_byte_array().to_vec(),
            closing_type,
            closing_blob,
            created_at: payment.created_at,
            confirmed_at: payment.confirmed_at,
            locked_at: payment.locked_at,
        }
    }

    fn into_payment(self) -> anyhow::Result<ChannelCloseOutgoingPayment> {
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
        let closing_info = ClosingInfo::decode(self.closing_type, &self.closing_blob)
            .map_err(StoreError::Decode)?;
        Ok(ChannelCloseOutgoingPayment {
            payment_id: Uuid::from_str(&self.id)?,
            amount_sat: self.amount_sat as u64,
            address: self.address,
            is_sent_to_default_address: self.is_default_address,
            mining_fee_sat: self.mining_fee_sat as u64,
            channel_id,
            tx_id: Txid::from_byte_array(tx_id),
            created_at: self.created_at,
            confirmed_at: self.confirmed_at,
            locked_at: self.locked_at,
            closing_info,
        })
    }
}

impl ChannelCloseOutgoingPayment {
    pub fn add(
        conn: &mut SqliteConnection,
        payment: &ChannelCloseOutgoingPayment,
    ) -> anyhow::Result<()> {
        diesel::insert_into(payments_channel_close::table)
            .values(ChannelCloseRow::from_payment(payment))
            .execute(conn)?;
        Ok(())
    }

    pub fn get(
        conn: &mut SqliteConnection,
        id: Uuid,
    ) -> anyhow::Result<Option<ChannelCloseOutgoingPayment>> {
        let row: Option<ChannelCloseRow> = payments_channel_close::table
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
            payments_channel_close::table
                .filter(payments_channel_close::tx_id.eq(tx_id.to_byte_array().to_vec())),
        )
        .set(payments_channel_close::locked_at.eq(Some(locked_at)))
        .execute(conn)?)
    }

    pub fn set_confirmed_by_tx(
        conn: &mut SqliteConnection,
        tx_id: Txid,
        confirmed_at: i64,
    ) -> anyhow::Result<usize> {
        Ok(diesel::update(
            payments_channel_close::table
                .filter(payments_channel_close::tx_id.eq(tx_id.to_byte_array().to_vec())),
        )
        .set(payments_channel_close::confirmed_at.eq(Some(confirmed_at)))
        .execute(conn)?)
    }

    pub fn list_within(
        conn: &mut SqliteConnection,
        from: i64,
        to: i64,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<ChannelCloseOutgoingPayment>> {
        let rows: Vec<ChannelCloseRow> = payments_channel_close::table
            .filter(payments_channel_close::created_at.ge(from))
            .filter(payments_channel_close::created_at.lt(to))
            .order(payments_channel_close::created_at.desc())
            .limit(limit)
            .offset(offset)
            .load(conn)?;
        rows.into_iter().map(|r| r.into_payment()).collect()
    }

    /// Confirmed closes in completion order, paged for the export stream.
    pub(crate) fn page_confirmed(
        conn: &mut SqliteConnection,
        from: i64,
        to: i64,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<ChannelCloseOutgoingPayment>> {
        let rows: Vec<ChannelCloseRow> = payments_channel_close::table
            .filter(payments_channel_close::confirmed_at.ge(from))
            .filter(payments_channel_close::confirmed_at.lt(to))
            .order(payments_channel_close::confirmed_at.asc())
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
    fn closing_info_roundtrip() {
        for info in [
            ClosingInfo::Mutual,
            ClosingInfo::Local,
            ClosingInfo::Remote,
            ClosingInfo::Other,
        ] {
            let (tag, blob) = info.encode();
            assert_eq!(ClosingInfo::decode(tag, &blob).unwrap(), info);
        }
        assert_eq!(ClosingInfo::Mutual.encode().0, 10);
        assert_eq!(ClosingInfo::Other.encode().0, 40);
        assert!(matches!(
            ClosingInfo::decode(50, b"{}").unwrap_err(),
            DecodeError::UnknownTag { tag: 50, .. }
        ));
    }
}
