use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub mod channel_close;
pub mod channel_snapshot;
pub mod inbound_liquidity;
pub mod incoming;
pub mod metadata;
pub mod outgoing;
mod schema;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;

/// Discriminator for the metadata table's composite key. Each variant is
/// identified by the native key of its entity, rendered as text.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PaymentType {
    Incoming = 1,
    LightningOutgoing = 2,
    ChannelClose = 3,
    InboundLiquidity = 4,
}

impl PaymentType {
    pub fn from_i32(value: i32) -> Option<PaymentType> {
        match value {
            1 => Some(PaymentType::Incoming),
            2 => Some(PaymentType::LightningOutgoing),
            3 => Some(PaymentType::ChannelClose),
            4 => Some(PaymentType::InboundLiquidity),
            _ => None,
        }
    }
}

/// Failure to decode a persisted `(type, blob)` pair. These never degrade to
/// defaults: an unknown tag stops the operation that hit it.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown {family} type tag {tag}")]
    UnknownTag { family: &'static str, tag: i32 },
    #[error("malformed {family} blob: {source}")]
    MalformedBlob {
        family: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed route: {0}")]
    MalformedRoute(String),
}

/// Typed store corruption errors. Both members of every nullable column pair
/// must be co-present or co-absent; any other combination is corrupt.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("incoming payment not found: {0}")]
    IncomingPaymentNotFound(String),
    #[error("unreadable incoming payment receipt: received_at={received_at:?} type={received_with_type:?}")]
    UnreadableIncomingReceivedWith {
        received_at: Option<i64>,
        received_with_type: Option<i32>,
        received_with_blob: Option<Vec<u8>>,
    },
    #[error("unhandled outgoing payment status: completed_at={completed_at:?} type={status_type:?}")]
    UnhandledOutgoingStatus {
        completed_at: Option<i64>,
        status_type: Option<i32>,
    },
    #[error("unhandled outgoing part status: completed_at={completed_at:?} type={status_type:?}")]
    UnhandledOutgoingPartStatus {
        completed_at: Option<i64>,
        status_type: Option<i32>,
    },
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

pub fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

#[derive(Debug)]
struct ConnectionOptions;

impl diesel::r2d2::CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(
            "PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000; PRAGMA journal_mode = WAL;",
        )
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Opens the single database file and runs pending migrations. SQLite allows
/// one writer at a time, so the pool stays small and every connection takes
/// the same pragmas.
pub fn open_pool(db_path: &Path) -> anyhow::Result<DbPool> {
    let url = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("invalid database path"))?;
    let manager = ConnectionManager::<SqliteConnection>::new(url);
    let pool = Pool::builder()
        .max_size(4)
        .connection_customizer(Box::new(ConnectionOptions))
        .build(manager)?;

    let mut conn = pool.get()?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("migrations could not run: {e}"))?;
    drop(conn);

    Ok(pool)
}

/// In-memory database. A single connection keeps every caller on the same
/// `:memory:` instance.
pub fn open_in_memory_pool() -> anyhow::Result<DbPool> {
    let manager = ConnectionManager::<SqliteConnection>::new(":memory:");
    let pool = Pool::builder()
        .max_size(1)
        .connection_customizer(Box::new(ConnectionOptions))
        .build(manager)?;

    let mut conn = pool.get()?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("migrations could not run: {e}"))?;
    drop(conn);

    Ok(pool)
}

pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

pub(crate) mod hex_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ptr_arg)]
    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
