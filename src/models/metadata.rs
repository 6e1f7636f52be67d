use crate::models::schema::payment_metadata;
use crate::models::PaymentType;
use diesel::prelude::*;
use serde::Serialize;

/// Operator-supplied metadata attached to a payment at creation time. The
/// `external_id` tags the payment for reconciliation; the `webhook_url` gets
/// an extra notification when the payment is received.
#[derive(Queryable, Insertable, AsChangeset, Serialize, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = payment_metadata)]
#[diesel(primary_key(payment_type, payment_id))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PaymentMetadata {
    #[serde(skip)]
    pub payment_type: i32,
    pub payment_id: String,
    pub external_id: Option<String>,
    pub webhook_url: Option<String>,
    pub created_at: i64,
}

impl PaymentMetadata {
    pub fn insert(
        conn: &mut SqliteConnection,
        payment_type: PaymentType,
        payment_id: &str,
        external_id: Option<String>,
        webhook_url: Option<String>,
        created_at: i64,
    ) -> anyhow::Result<PaymentMetadata> {
        let row = PaymentMetadata {
            payment_type: payment_type as i32,
            payment_id: payment_id.to_string(),
            external_id,
            webhook_url,
            created_at,
        };
        diesel::insert_into(payment_metadata::table)
            .values(&row)
            .execute(conn)?;
        Ok(row)
    }

    pub fn get(
        conn: &mut SqliteConnection,
        payment_type: PaymentType,
        payment_id: &str,
    ) -> anyhow::Result<Option<PaymentMetadata>> {
        Ok(payment_metadata::table
            .find((payment_type as i32, payment_id))
            .first(conn)
            .optional()?)
    }
}
