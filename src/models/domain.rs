use aws_lc_rs::{encoding::AsDer, rsa::KeySize, signature::KeyPair};
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::config::MailSettings;
use crate::models::Error;

/// A tenant-owned sending/receiving domain, keyed by FQDN.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct MailDomain {
    pub name: String,
    pub enabled: bool,
    pub is_verified: bool,
    pub is_root_domain: bool,
    pub dkim_key_size: i32,
    /// Days to keep newsletters sent from this domain.
    pub newsletter_retention: i32,
    /// Pins all outbound mail of this domain to one edge agent.
    pub outgoing_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One DKIM signing key. At most one enabled key per domain.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DkimKey {
    pub id: i64,
    pub domain_name: String,
    pub selector: String,
    /// PKCS#8 DER private key bytes.
    pub private_key: Vec<u8>,
    /// Base64 of the X.509 SubjectPublicKeyInfo, as published in DNS.
    pub public_key: String,
    pub key_size: i32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DnsRecord {
    pub record_type: String,
    pub host: String,
    pub value: String,
    pub ttl: u32,
}

impl MailDomain {
    /// The DNS records a tenant has to publish before the domain verifies:
    /// SPF, the DKIM public key, DMARC and MX.
    pub fn dns_records(&self, dkim: &DkimKey, settings: &MailSettings) -> Vec<DnsRecord> {
        let ttl = settings.default_ttl;
        let dmarc_policy = if self.is_root_domain {
            "reject"
        } else {
            "quarantine"
        };

        vec![
            DnsRecord {
                record_type: "TXT".to_owned(),
                host: self.name.clone(),
                value: format!(
                    "v=spf1 include:{}.{} ~all",
                    settings.spf_host, settings.root_domain_name
                ),
                ttl,
            },
            DnsRecord {
                record_type: "TXT".to_owned(),
                host: format!("{}._domainkey.{}", dkim.selector, self.name),
                value: format!("v=DKIM1; k=rsa; p={}", dkim.public_key),
                ttl,
            },
            DnsRecord {
                record_type: "TXT".to_owned(),
                host: format!("_dmarc.{}", self.name),
                value: format!(
                    "v=DMARC1; p={dmarc_policy}; rua=mailto:dmarc@{}",
                    settings.root_domain_name
                ),
                ttl,
            },
            DnsRecord {
                record_type: "MX".to_owned(),
                host: self.name.clone(),
                value: format!("10 mx.{}", settings.root_domain_name),
                ttl,
            },
        ]
    }
}

fn generate_rsa_keypair(key_size: u32) -> Result<(Vec<u8>, String), Error> {
    let size = match key_size {
        0..=2048 => KeySize::Rsa2048,
        2049..=3072 => KeySize::Rsa3072,
        _ => KeySize::Rsa4096,
    };
    let keypair = aws_lc_rs::rsa::KeyPair::generate(size)?;
    let private = keypair.as_der()?.as_ref().to_vec();
    let public = Base64::encode_string(keypair.public_key().as_der()?.as_ref());
    Ok((private, public))
}

#[derive(Clone)]
pub struct DomainRepository {
    pool: PgPool,
}

impl DomainRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a domain together with its first enabled DKIM key.
    pub async fn create(
        &self,
        name: &str,
        settings: &MailSettings,
    ) -> Result<(MailDomain, DkimKey), Error> {
        let name = name.to_lowercase();
        let is_root = name == settings.root_domain_name;
        let key_size = settings.default_dkim_key_size;
        let (private_key, public_key) = generate_rsa_keypair(key_size)?;

        let mut tx = self.pool.begin().await?;

        let domain = sqlx::query_as::<_, MailDomain>(
            r#"
            INSERT INTO mail_domains
                (name, enabled, is_verified, is_root_domain, dkim_key_size, newsletter_retention)
            VALUES ($1, TRUE, FALSE, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(&name)
        .bind(is_root)
        .bind(key_size as i32)
        .bind(settings.newsletter_retention as i32)
        .fetch_one(&mut *tx)
        .await?;

        let dkim = sqlx::query_as::<_, DkimKey>(
            r#"
            INSERT INTO dkim_keys (domain_name, selector, private_key, public_key, key_size, enabled)
            VALUES ($1, $2, $3, $4, $5, TRUE)
            RETURNING *
            "#,
        )
        .bind(&name)
        .bind(&settings.default_dkim_selector)
        .bind(&private_key)
        .bind(&public_key)
        .bind(key_size as i32)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok((domain, dkim))
    }

    pub async fn get(&self, name: &str) -> Result<Option<MailDomain>, Error> {
        Ok(
            sqlx::query_as::<_, MailDomain>("SELECT * FROM mail_domains WHERE name = $1")
                .bind(name.to_lowercase())
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// The enabled DKIM key of a domain, if any.
    pub async fn active_dkim_key(&self, domain: &str) -> Result<Option<DkimKey>, Error> {
        Ok(sqlx::query_as::<_, DkimKey>(
            "SELECT * FROM dkim_keys WHERE domain_name = $1 AND enabled ORDER BY created_at DESC LIMIT 1",
        )
        .bind(domain.to_lowercase())
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Rotate the DKIM key: a new enabled key disables every prior key of
    /// the domain in the same transaction, and the domain drops back to
    /// unverified until the new record is published.
    pub async fn rotate_dkim_key(
        &self,
        domain: &str,
        selector: &str,
        key_size: u32,
    ) -> Result<DkimKey, Error> {
        let domain = domain.to_lowercase();
        let (private_key, public_key) = generate_rsa_keypair(key_size)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE dkim_keys SET enabled = FALSE WHERE domain_name = $1")
            .bind(&domain)
            .execute(&mut *tx)
            .await?;

        let key = sqlx::query_as::<_, DkimKey>(
            r#"
            INSERT INTO dkim_keys (domain_name, selector, private_key, public_key, key_size, enabled)
            VALUES ($1, $2, $3, $4, $5, TRUE)
            RETURNING *
            "#,
        )
        .bind(&domain)
        .bind(selector)
        .bind(&private_key)
        .bind(&public_key)
        .bind(key_size as i32)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE mail_domains SET is_verified = FALSE, dkim_key_size = $2, updated_at = now() WHERE name = $1",
        )
        .bind(&domain)
        .bind(key_size as i32)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(key)
    }

    pub async fn set_verified(&self, domain: &str, verified: bool) -> Result<(), Error> {
        sqlx::query(
            "UPDATE mail_domains SET is_verified = $2, updated_at = now() WHERE name = $1",
        )
        .bind(domain.to_lowercase())
        .bind(verified)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_settings() -> MailSettings {
        let mut settings = crate::config::MailSettings::from_env();
        settings.root_domain_name = "mail.test".to_owned();
        settings.spf_host = "spf".to_owned();
        settings.default_ttl = 300;
        settings
    }

    fn test_domain(name: &str, root: bool) -> MailDomain {
        MailDomain {
            name: name.to_owned(),
            enabled: true,
            is_verified: false,
            is_root_domain: root,
            dkim_key_size: 2048,
            newsletter_retention: 7,
            outgoing_agent: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn test_key(domain: &str) -> DkimKey {
        let (private_key, public_key) = generate_rsa_keypair(2048).unwrap();
        DkimKey {
            id: 1,
            domain_name: domain.to_owned(),
            selector: "mf1".to_owned(),
            private_key,
            public_key,
            key_size: 2048,
            enabled: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn generated_key_round_trips_into_signer() {
        let (private_key, public_key) = generate_rsa_keypair(2048).unwrap();
        assert!(!public_key.is_empty());
        // the stored DER must load back as a signing key
        mail_auth::common::crypto::RsaKey::<mail_auth::common::crypto::Sha256>::from_pkcs8_der(
            &private_key,
        )
        .unwrap();
    }

    #[test]
    fn dns_records_for_subdomain_and_root() {
        let settings = test_settings();
        let domain = test_domain("example.test", false);
        let key = test_key("example.test");

        let records = domain.dns_records(&key, &settings);
        assert_eq!(records.len(), 4);
        assert!(records[0].value.starts_with("v=spf1 include:spf.mail.test"));
        assert_eq!(records[1].host, "mf1._domainkey.example.test");
        assert!(records[1].value.contains(&key.public_key));
        assert!(records[2].value.contains("p=quarantine"));
        assert_eq!(records[3].record_type, "MX");

        let root = test_domain("mail.test", true);
        let records = root.dns_records(&key, &settings);
        assert!(records[2].value.contains("p=reject"));
    }
}
