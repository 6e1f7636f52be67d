use crate::models::channel_close::ChannelCloseOutgoingPayment;
use crate::models::current_timestamp_millis;
use crate::models::inbound_liquidity::InboundLiquidityOutgoingPayment;
use crate::models::incoming::IncomingPayment;
use crate::models::outgoing::{LightningOutgoingPayment, OutgoingStatus};
use chrono::{TimeZone, Utc};
use diesel::SqliteConnection;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

const PAGE_SIZE: i64 = 50;

/// A completed payment of any kind, visited in `completed_at` order.
#[derive(Debug, Clone)]
pub enum CompletedPayment {
    Incoming(IncomingPayment),
    Lightning(LightningOutgoingPayment),
    ChannelClose(ChannelCloseOutgoingPayment),
    InboundLiquidity(InboundLiquidityOutgoingPayment),
}

impl CompletedPayment {
    pub fn completed_at(&self) -> i64 {
        match self {
            CompletedPayment::Incoming(p) => {
                p.received.as_ref().map(|r| r.received_at).unwrap_or(0)
            }
            CompletedPayment::Lightning(p) => match &p.status {
                OutgoingStatus::Succeeded { completed_at, .. }
                | OutgoingStatus::Failed { completed_at, .. } => *completed_at,
                OutgoingStatus::Pending => 0,
            },
            CompletedPayment::ChannelClose(p) => p.confirmed_at.unwrap_or(0),
            CompletedPayment::InboundLiquidity(p) => p.confirmed_at.unwrap_or(0),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            CompletedPayment::Incoming(_) => "incoming",
            CompletedPayment::Lightning(_) => "lightning_outgoing",
            CompletedPayment::ChannelClose(_) => "channel_close",
            CompletedPayment::InboundLiquidity(_) => "inbound_liquidity",
        }
    }

    fn payment_id(&self) -> String {
        match self {
            CompletedPayment::Incoming(p) => p.payment_id.to_string(),
            CompletedPayment::Lightning(p) => p.payment_id.to_string(),
            CompletedPayment::ChannelClose(p) => p.payment_id.to_string(),
            CompletedPayment::InboundLiquidity(p) => p.payment_id.to_string(),
        }
    }

    fn amount_msat(&self) -> u64 {
        match self {
            CompletedPayment::Incoming(p) => p.amount_received_msat(),
            CompletedPayment::Lightning(p) => p.recipient_amount_msat,
            CompletedPayment::ChannelClose(p) => p.amount_sat * 1_000,
            CompletedPayment::InboundLiquidity(p) => p.purchase.amount_sat() * 1_000,
        }
    }

    fn fees_msat(&self) -> u64 {
        match self {
            CompletedPayment::Incoming(p) => p.fees_msat(),
            CompletedPayment::Lightning(p) => p.routing_fee_msat(),
            CompletedPayment::ChannelClose(p) => p.mining_fee_sat * 1_000,
            CompletedPayment::InboundLiquidity(p) => {
                (p.mining_fee_sat + p.purchase.service_fee_sat()) * 1_000
            }
        }
    }

    fn reference(&self) -> String {
        match self {
            CompletedPayment::Incoming(p) => hex::encode(p.payment_hash),
            CompletedPayment::Lightning(p) => hex::encode(p.payment_hash),
            CompletedPayment::ChannelClose(p) => p.tx_id.to_string(),
            CompletedPayment::InboundLiquidity(p) => p.tx_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum SourceKind {
    Incoming,
    Lightning,
    ChannelClose,
    InboundLiquidity,
}

struct SourceCursor {
    kind: SourceKind,
    offset: i64,
    buffer: VecDeque<CompletedPayment>,
    exhausted: bool,
}

impl SourceCursor {
    fn new(kind: SourceKind) -> SourceCursor {
        SourceCursor {
            kind,
            offset: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    fn refill(&mut self, conn: &mut SqliteConnection, from: i64, to: i64) -> anyhow::Result<()> {
        if self.exhausted || !self.buffer.is_empty() {
            return Ok(());
        }
        let page: Vec<CompletedPayment> = match self.kind {
            SourceKind::Incoming => {
                IncomingPayment::page_received(conn, from, to, PAGE_SIZE, self.offset)?
                    .into_iter()
                    .map(CompletedPayment::Incoming)
                    .collect()
            }
            SourceKind::Lightning => {
                LightningOutgoingPayment::page_succeeded(conn, from, to, PAGE_SIZE, self.offset)?
                    .into_iter()
                    .map(CompletedPayment::Lightning)
                    .collect()
            }
            SourceKind::ChannelClose => {
                ChannelCloseOutgoingPayment::page_confirmed(conn, from, to, PAGE_SIZE, self.offset)?
                    .into_iter()
                    .map(CompletedPayment::ChannelClose)
                    .collect()
            }
            SourceKind::InboundLiquidity => InboundLiquidityOutgoingPayment::page_confirmed(
                conn, from, to, PAGE_SIZE, self.offset,
            )?
            .into_iter()
            .map(CompletedPayment::InboundLiquidity)
            .collect(),
        };
        if (page.len() as i64) < PAGE_SIZE {
            self.exhausted = true;
        }
        self.offset += page.len() as i64;
        self.buffer.extend(page);
        Ok(())
    }
}

/// Streams every completed payment of any kind through the visitor in
/// `completed_at` ascending order. Pages each source so the full result set
/// is never materialized.
pub fn process_successful_payments(
    conn: &mut SqliteConnection,
    from: i64,
    to: i64,
    mut visit: impl FnMut(&CompletedPayment) -> anyhow::Result<()>,
) -> anyhow::Result<usize> {
    let mut cursors = [
        SourceCursor::new(SourceKind::Incoming),
        SourceCursor::new(SourceKind::Lightning),
        SourceCursor::new(SourceKind::ChannelClose),
        SourceCursor::new(SourceKind::InboundLiquidity),
    ];

    let mut visited = 0;
    loop {
        for cursor in cursors.iter_mut() {
            cursor.refill(conn, from, to)?;
        }
        let next = cursors
            .iter_mut()
            .filter(|c| !c.buffer.is_empty())
            .min_by_key(|c| {
                c.buffer
                    .front()
                    .map(|p| p.completed_at())
                    .unwrap_or(i64::MAX)
            });
        match next {
            Some(cursor) => {
                let payment = cursor.buffer.pop_front().expect("buffer checked non-empty");
                visit(&payment)?;
                visited += 1;
            }
            None => return Ok(visited),
        }
    }
}

/// Writes the payment history to a CSV file in the exports directory and
/// returns its path.
pub fn export_csv(
    conn: &mut SqliteConnection,
    exports_dir: &Path,
    from: i64,
    to: i64,
) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(exports_dir)?;
    let path = exports_dir.join(format!(
        "payments-{from}-{to}-{}.csv",
        current_timestamp_millis()
    ));

    let mut writer = csv::Writer::from_path(&path)?;
    writer.write_record([
        "date",
        "type",
        "payment_id",
        "amount_msat",
        "fees_msat",
        "reference",
    ])?;

    process_successful_payments(conn, from, to, |payment| {
        let date = Utc
            .timestamp_millis_opt(payment.completed_at())
            .single()
            .map(|d| d.to_rfc3339())
            .unwrap_or_default();
        writer.write_record([
            date,
            payment.kind().to_string(),
            payment.payment_id(),
            payment.amount_msat().to_string(),
            payment.fees_msat().to_string(),
            payment.reference(),
        ])?;
        Ok(())
    })?;

    writer.flush()?;
    Ok(path)
}
