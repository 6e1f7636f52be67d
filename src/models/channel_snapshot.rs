use crate::models::schema::channel_snapshots;
use diesel::prelude::*;

/// Last known state of each channel, refreshed from node events so listings
/// survive a peer disconnect.
#[derive(Queryable, Insertable, AsChangeset, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = channel_snapshots)]
#[diesel(primary_key(channel_id))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ChannelSnapshot {
    pub channel_id: Vec<u8>,
    pub state: String,
    pub blob: Vec<u8>,
    pub updated_at: i64,
}

impl ChannelSnapshot {
    pub fn upsert(
        conn: &mut SqliteConnection,
        channel_id: [u8; 32],
        state: &str,
        blob: Vec<u8>,
        updated_at: i64,
    ) -> anyhow::Result<()> {
        let row = ChannelSnapshot {
            channel_id: channel_id.to_vec(),
            state: state.to_string(),
            blob,
            updated_at,
        };
        diesel::insert_into(channel_snapshots::table)
            .values(&row)
            .on_conflict(channel_snapshots::channel_id)
            .do_update()
            .set((
                channel_snapshots::state.eq(&row.state),
                channel_snapshots::blob.eq(&row.blob),
                channel_snapshots::updated_at.eq(row.updated_at),
            ))
            .execute(conn)?;
        Ok(())
    }

    pub fn remove(conn: &mut SqliteConnection, channel_id: [u8; 32]) -> anyhow::Result<bool> {
        let count = diesel::delete(
            channel_snapshots::table
                .filter(channel_snapshots::channel_id.eq(channel_id.to_vec())),
        )
        .execute(conn)?;
        Ok(count == 1)
    }

    pub fn list(conn: &mut SqliteConnection) -> anyhow::Result<Vec<ChannelSnapshot>> {
        Ok(channel_snapshots::table
            .order(channel_snapshots::updated_at.desc())
            .load(conn)?)
    }
}
