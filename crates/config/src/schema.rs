/// Config schema: the JSON document read at startup.
use serde::{Deserialize, Serialize};

fn default_port() -> u16 {
    8000
}

fn default_base_path() -> String {
    "/".to_string()
}

/// Root configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_base_path", rename = "basePath")]
    pub base_path: String,

    #[serde(rename = "secureCookies")]
    pub secure_cookies: bool,

    pub database: Database,

    #[serde(rename = "databaseUrl")]
    pub database_url: String,

    #[serde(rename = "frontendUrl")]
    pub frontend_url: Option<String>,

    #[serde(rename = "emailSettings")]
    pub email_settings: EmailSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            base_path: default_base_path(),
            secure_cookies: true,
            database: Database::Postgres,
            database_url: String::new(),
            frontend_url: None,
            email_settings: EmailSettings::default(),
        }
    }
}

impl Config {
    /// Checks the invariant the loader can't default its way out of: there is
    /// no sensible fallback store, so a missing `databaseUrl` is fatal.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database_url.trim().is_empty() {
            anyhow::bail!("databaseUrl is required");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Database {
    Postgres,
    #[serde(alias = "mariadb")]
    Mysql,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EmailSettings {
    pub identity: String,
    pub username: String,
    pub password: String,
    pub host: String,
}
