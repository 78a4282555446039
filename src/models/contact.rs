use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;

use crate::models::Error;

/// Address book entry maintained automatically for mailboxes that opt in.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct MailContact {
    pub id: i64,
    pub user: String,
    pub email: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ContactRepository {
    pool: PgPool,
}

impl ContactRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or refresh a `(user, email)` contact. A changed display name
    /// overwrites the stored one.
    pub async fn upsert(
        &self,
        user: &str,
        email: &str,
        display_name: Option<&str>,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO mail_contacts ("user", email, display_name)
            VALUES ($1, $2, $3)
            ON CONFLICT ("user", email)
            DO UPDATE SET display_name = COALESCE(EXCLUDED.display_name, mail_contacts.display_name)
            "#,
        )
        .bind(user)
        .bind(email.to_lowercase())
        .bind(display_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_for_user(&self, user: &str) -> Result<Vec<MailContact>, Error> {
        Ok(sqlx::query_as::<_, MailContact>(
            r#"SELECT * FROM mail_contacts WHERE "user" = $1 ORDER BY email"#,
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await?)
    }
}
