use anyhow::{Context, Result, bail};

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &["change-me-to-a-random-string", "dev-secret-change-me"];

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: String,
    pub host: String,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let jwt_secret = lookup("CLASSCHAT_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("CLASSCHAT_JWT_SECRET is unset or still a placeholder");
        }

        let port = match lookup("CLASSCHAT_PORT") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("CLASSCHAT_PORT is not a port number: {}", raw))?,
            None => 3000,
        };

        Ok(Self {
            jwt_secret,
            db_path: lookup("CLASSCHAT_DB_PATH").unwrap_or_else(|| "classchat.db".into()),
            host: lookup("CLASSCHAT_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
        })
    }
}
