use anyhow::{Context, Result};

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub database_url: String,
    pub redis_url: String,
    pub http_addr: String,
    /// Shared secret for webhook HMAC verification. When unset, deliveries
    /// are accepted unsigned; the gateway logs this as insecure.
    pub webhook_secret: Option<String>,
    /// Base URL of the hosted payment page. When unset, invoices are
    /// created without payment links.
    pub checkout_base_url: Option<String>,
    /// Validity of freshly minted share links, in days.
    pub share_link_ttl_days: i64,
    /// Upper bound on external collaborator calls, in seconds.
    pub collaborator_timeout_secs: u64,
    pub db_max_connections: u32,
}

impl ServiceConfig {
    pub fn from_env(default_http_addr: &str) -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is required")?;
        let redis_url = std::env::var("REDIS_URL").context("REDIS_URL is required")?;
        let http_addr =
            std::env::var("HTTP_ADDR").unwrap_or_else(|_| default_http_addr.to_string());
        let webhook_secret = std::env::var("PAYMENT_WEBHOOK_SECRET")
            .ok()
            .filter(|value| !value.is_empty());
        let checkout_base_url = std::env::var("CHECKOUT_BASE_URL")
            .ok()
            .filter(|value| !value.is_empty());
        let share_link_ttl_days = std::env::var("SHARE_LINK_TTL_DAYS")
            .ok()
            .map(|value| value.parse::<i64>())
            .transpose()
            .context("SHARE_LINK_TTL_DAYS must be an integer")?
            .unwrap_or(30);
        let collaborator_timeout_secs = std::env::var("COLLABORATOR_TIMEOUT_SECS")
            .ok()
            .map(|value| value.parse::<u64>())
            .transpose()
            .context("COLLABORATOR_TIMEOUT_SECS must be an integer")?
            .unwrap_or(5);
        let db_max_connections = database_max_connections(10)?;

        Ok(Self {
            database_url,
            redis_url,
            http_addr,
            webhook_secret,
            checkout_base_url,
            share_link_ttl_days,
            collaborator_timeout_secs,
            db_max_connections,
        })
    }

    /// Workers skip the HTTP surface and run a smaller pool by default.
    pub fn worker_from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is required")?;
        let redis_url = std::env::var("REDIS_URL").context("REDIS_URL is required")?;
        let db_max_connections = database_max_connections(5)?;

        Ok(Self {
            database_url,
            redis_url,
            http_addr: String::new(),
            webhook_secret: None,
            checkout_base_url: None,
            share_link_ttl_days: 30,
            collaborator_timeout_secs: 5,
            db_max_connections,
        })
    }
}

fn database_max_connections(default: u32) -> Result<u32> {
    std::env::var("DATABASE_MAX_CONNECTIONS")
        .ok()
        .map(|value| value.parse::<u32>())
        .transpose()
        .context("DATABASE_MAX_CONNECTIONS must be an integer")
        .map(|value| value.unwrap_or(default))
}
