use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;

use crate::models::Error;

/// One known IP, grouped so lookups only ever touch a small slice of the
/// table: the first two octets (IPv4) or first three hextets (IPv6).
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct IpBlacklistEntry {
    pub id: i64,
    pub ip_address: String,
    pub ip_version: String,
    pub ip_address_expanded: String,
    pub ip_group: String,
    pub host: Option<String>,
    pub is_blacklisted: bool,
    pub blacklist_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub fn ip_version(ip: &IpAddr) -> &'static str {
    match ip {
        IpAddr::V4(_) => "IPv4",
        IpAddr::V6(_) => "IPv6",
    }
}

/// Fully expanded textual form: dotted quad for IPv4, all eight
/// zero-padded hextets for IPv6.
pub fn expand_ip(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            segments
                .iter()
                .map(|s| format!("{s:04x}"))
                .collect::<Vec<_>>()
                .join(":")
        }
    }
}

/// Lookup group of an address: first two octets / first three hextets of
/// the expanded form.
pub fn ip_group(ip: &IpAddr) -> String {
    let expanded = expand_ip(ip);
    match ip {
        IpAddr::V4(_) => expanded.split('.').take(2).collect::<Vec<_>>().join("."),
        IpAddr::V6(_) => expanded.split(':').take(3).collect::<Vec<_>>().join(":"),
    }
}

#[derive(Clone)]
pub struct BlacklistRepository {
    pool: PgPool,
}

impl BlacklistRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Group-scoped lookup. When the address is unknown a non-blacklisted
    /// entry is created so repeat lookups stay cheap.
    pub async fn lookup_or_create(&self, ip_address: &str) -> Result<IpBlacklistEntry, Error> {
        let ip = IpAddr::from_str(ip_address)
            .map_err(|_| Error::Internal(format!("invalid ip address: {ip_address}")))?;
        let group = ip_group(&ip);
        let expanded = expand_ip(&ip);

        let entries = sqlx::query_as::<_, IpBlacklistEntry>(
            "SELECT * FROM ip_blacklist WHERE ip_group = $1",
        )
        .bind(&group)
        .fetch_all(&self.pool)
        .await?;

        if let Some(entry) = entries
            .into_iter()
            .find(|e| e.ip_address_expanded == expanded)
        {
            return Ok(entry);
        }

        Ok(sqlx::query_as::<_, IpBlacklistEntry>(
            r#"
            INSERT INTO ip_blacklist
                (ip_address, ip_version, ip_address_expanded, ip_group, is_blacklisted)
            VALUES ($1, $2, $3, $4, FALSE)
            ON CONFLICT (ip_address_expanded) DO UPDATE SET ip_group = EXCLUDED.ip_group
            RETURNING *
            "#,
        )
        .bind(ip.to_string())
        .bind(ip_version(&ip))
        .bind(&expanded)
        .bind(&group)
        .fetch_one(&self.pool)
        .await?)
    }

    pub async fn blacklist(
        &self,
        ip_address: &str,
        reason: Option<&str>,
    ) -> Result<IpBlacklistEntry, Error> {
        let entry = self.lookup_or_create(ip_address).await?;
        Ok(sqlx::query_as::<_, IpBlacklistEntry>(
            "UPDATE ip_blacklist SET is_blacklisted = TRUE, blacklist_reason = $2 WHERE id = $1 RETURNING *",
        )
        .bind(entry.id)
        .bind(reason)
        .fetch_one(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ipv4_grouping() {
        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        assert_eq!(ip_version(&ip), "IPv4");
        assert_eq!(expand_ip(&ip), "203.0.113.7");
        assert_eq!(ip_group(&ip), "203.0");
    }

    #[test]
    fn ipv6_grouping_expands_first() {
        let ip: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(ip_version(&ip), "IPv6");
        assert_eq!(
            expand_ip(&ip),
            "2001:0db8:0000:0000:0000:0000:0000:0001"
        );
        assert_eq!(ip_group(&ip), "2001:0db8:0000");
    }
}
