//! Resdesk configuration loader.
//!
//! A TOML file (`$RESDESK_CONFIG` or `~/.resdesk/config.toml`), then
//! environment overrides, then `validate()`. Every section is optional so a
//! deployment can run from environment variables alone.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SYSTEM_PROMPT: &str = "Tu es l'assistant du restaurant. Réponds en français, \
de façon brève et chaleureuse. Aide les clients à consulter le menu, à passer commande et \
à connaître les horaires. Si tu ne connais pas la réponse, dis-le simplement et propose \
de transmettre la demande à un membre de l'équipe.";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResdeskConfig {
    pub general: GeneralConfig,
    pub keys: KeysConfig,
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub menu: Option<MenuConfig>,
    pub channels: ChannelsConfig,
    pub alerts: AlertsConfig,
    pub delivery: DeliveryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub model: String,
    pub system_prompt: String,
    /// Sent to the customer whenever a reply could not be produced.
    pub fallback_text: String,
    pub goodbye_text: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            fallback_text: "Désolé, une erreur s'est produite. Un membre de l'équipe va vous répondre rapidement.".to_string(),
            goodbye_text: "Merci pour votre message, à bientôt !".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub admin_api_key: Option<String>,
    pub http_timeout_seconds: u64,
    pub http_max_in_flight: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            admin_api_key: None,
            http_timeout_seconds: 30,
            http_max_in_flight: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: "~/.resdesk/data/resdesk.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MenuConfig {
    pub url: String,
    #[serde(default = "default_menu_filename")]
    pub filename: String,
    #[serde(default)]
    pub caption: String,
}

fn default_menu_filename() -> String {
    "menu.pdf".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub whatsapp: WhatsAppConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WhatsAppConfig {
    pub enabled: bool,
    pub access_token: String,
    pub phone_number_id: String,
    /// Echoed back during the platform's webhook subscription handshake.
    pub verify_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub webhook_url: Option<String>,
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub poll_interval_seconds: u64,
    pub worker_interval_seconds: u64,
    pub credential_file: String,
    pub push_bind_addr: Option<String>,
    pub push_token: Option<String>,
    pub console: bool,
    /// Also forward every presented notification to `[alerts]`.
    pub forward_alerts: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_key: None,
            poll_interval_seconds: 15,
            worker_interval_seconds: 60,
            credential_file: "~/.resdesk/credentials.json".to_string(),
            push_bind_addr: None,
            push_token: None,
            console: true,
            forward_alerts: false,
        }
    }
}

impl DeliveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn worker_interval(&self) -> Duration {
        Duration::from_secs(self.worker_interval_seconds)
    }
}

impl ResdeskConfig {
    pub async fn load(path: Option<PathBuf>) -> Result<Self> {
        Ok(Self::load_with_path(path).await?.0)
    }

    /// A missing file is only tolerated at the default location.
    pub async fn load_with_path(path: Option<PathBuf>) -> Result<(Self, PathBuf)> {
        let explicit = path
            .or_else(|| std::env::var_os("RESDESK_CONFIG").map(PathBuf::from))
            .map(|p| expand_home(&p.to_string_lossy()))
            .transpose()?;
        let path = match &explicit {
            Some(path) => path.clone(),
            None => default_config_path(),
        };

        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::parse(&contents)
                .with_context(|| format!("parse config {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && explicit.is_none() => {
                tracing::warn!(config_path = %path.display(), "no config file; using defaults and environment");
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides(|name| std::env::var(name).ok());
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// `lookup` is the environment; blank values are ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("RESDESK_MODEL") {
            self.general.model = v;
        }
        if let Some(v) = get("OPENAI_API_KEY") {
            self.keys.openai_api_key = Some(v);
        }
        if let Some(v) = get("ANTHROPIC_API_KEY") {
            self.keys.anthropic_api_key = Some(v);
        }
        if let Some(v) = get("RESDESK_ADMIN_API_KEY") {
            self.server.admin_api_key = Some(v);
        }
        if let Some(v) = get("WHATSAPP_ACCESS_TOKEN") {
            self.channels.whatsapp.access_token = v;
            self.channels.whatsapp.enabled = true;
        }
        if let Some(v) = get("WHATSAPP_PHONE_NUMBER_ID") {
            self.channels.whatsapp.phone_number_id = v;
        }
        if let Some(v) = get("WHATSAPP_VERIFY_TOKEN") {
            self.channels.whatsapp.verify_token = Some(v);
        }
        if let Some(v) = get("RESDESK_API_URL") {
            self.delivery.api_url = Some(v);
        }
        if let Some(v) = get("RESDESK_API_KEY") {
            self.delivery.api_key = Some(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.general.model.trim().is_empty() {
            return Err(anyhow::anyhow!("general.model is required"));
        }
        if self.general.fallback_text.trim().is_empty() {
            return Err(anyhow::anyhow!("general.fallback_text must not be empty"));
        }
        self.bind_addr()?;
        if self.server.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("server.http_timeout_seconds must be > 0"));
        }
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.http_max_in_flight must be > 0"));
        }
        if self.store.backend == StoreBackend::Sqlite && self.store.path.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "store.path is required for the sqlite backend"
            ));
        }
        if let Some(menu) = &self.menu {
            if menu.url.trim().is_empty() {
                return Err(anyhow::anyhow!("menu.url must not be empty"));
            }
        }
        let whatsapp = &self.channels.whatsapp;
        if whatsapp.enabled
            && (whatsapp.access_token.trim().is_empty()
                || whatsapp.phone_number_id.trim().is_empty())
        {
            return Err(anyhow::anyhow!(
                "channels.whatsapp requires access_token and phone_number_id when enabled"
            ));
        }
        if self.delivery.poll_interval_seconds == 0 || self.delivery.worker_interval_seconds == 0 {
            return Err(anyhow::anyhow!("delivery intervals must be > 0"));
        }
        if let Some(addr) = &self.delivery.push_bind_addr {
            addr.parse::<SocketAddr>()
                .map_err(|e| anyhow::anyhow!("delivery.push_bind_addr {addr:?} is invalid: {e}"))?;
        }
        Ok(())
    }

    /// `serve` refuses to start without an admin key: every dashboard route
    /// would answer 401.
    pub fn require_admin_key(&self) -> Result<&str> {
        self.server
            .admin_api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!("server.admin_api_key (or RESDESK_ADMIN_API_KEY) is required")
            })
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server.bind_addr.parse().map_err(|e| {
            anyhow::anyhow!("server.bind_addr {:?} is invalid: {e}", self.server.bind_addr)
        })
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.server.http_timeout_seconds)
    }

    /// Picks the key matching the model family; `None` means no completion
    /// backend, so every turn ends in the fallback reply.
    pub fn api_key_for_model(&self) -> Option<String> {
        let model = self.general.model.to_ascii_lowercase();
        let key = if model.starts_with("claude-") {
            self.keys.anthropic_api_key.clone()
        } else {
            self.keys.openai_api_key.clone()
        };
        key.filter(|s| !s.trim().is_empty())
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".resdesk").join("config.toml")
}

pub fn expand_home(path: &str) -> Result<PathBuf> {
    let trimmed = path.trim().to_string();
    if !trimmed.starts_with("~/") {
        return Ok(PathBuf::from(trimmed));
    }
    let home = std::env::var("HOME").map_err(|_| anyhow::anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(trimmed.replacen("~", &home, 1)))
}
