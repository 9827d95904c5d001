use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use bridge_core::BridgeConfig;
use serde::Deserialize;
use shared::domain::UserId;

pub const DEFAULT_CONFIG_PATH: &str = "bridge.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub homeserver_url: String,
    pub homeserver_domain: String,
    pub as_token: String,
    pub bot_localpart: String,
    pub database_url: String,
    pub username_template: String,
    pub displayname_template: String,
    pub connect_timeout_secs: u64,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            homeserver_url: "http://localhost:8008".into(),
            homeserver_domain: "localhost".into(),
            as_token: String::new(),
            bot_localpart: "whatsappbot".into(),
            database_url: "sqlite://./data/bridge.db".into(),
            username_template: "whatsapp_{}".into(),
            displayname_template: "{} (WhatsApp)".into(),
            connect_timeout_secs: 20,
            log_level: "info".into(),
        }
    }
}

impl Settings {
    pub fn bot_user_id(&self) -> UserId {
        UserId(format!("@{}:{}", self.bot_localpart, self.homeserver_domain))
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            homeserver_domain: self.homeserver_domain.clone(),
            username_template: self.username_template.clone(),
            displayname_template: self.displayname_template.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            ..BridgeConfig::default()
        }
    }
}

/// Keys accepted in the TOML file. Anything missing keeps its default.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    homeserver_url: Option<String>,
    homeserver_domain: Option<String>,
    as_token: Option<String>,
    bot_localpart: Option<String>,
    database_url: Option<String>,
    username_template: Option<String>,
    displayname_template: Option<String>,
    connect_timeout_secs: Option<u64>,
    log_level: Option<String>,
}

/// Defaults, then the TOML file, then the environment.
///
/// An explicit `path` must exist; the default `bridge.toml` is optional.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    let raw = match path {
        Some(path) => Some(
            fs::read_to_string(path)
                .with_context(|| format!("failed to read config file '{}'", path.display()))?,
        ),
        None => fs::read_to_string(DEFAULT_CONFIG_PATH).ok(),
    };
    if let Some(raw) = raw {
        let file: FileSettings = toml::from_str(&raw).context("invalid config file")?;
        apply_file(&mut settings, file);
    }

    apply_env(&mut settings, |key| std::env::var(key).ok())?;
    Ok(settings)
}

fn apply_file(settings: &mut Settings, file: FileSettings) {
    let FileSettings {
        homeserver_url,
        homeserver_domain,
        as_token,
        bot_localpart,
        database_url,
        username_template,
        displayname_template,
        connect_timeout_secs,
        log_level,
    } = file;

    if let Some(v) = homeserver_url {
        settings.homeserver_url = v;
    }
    if let Some(v) = homeserver_domain {
        settings.homeserver_domain = v;
    }
    if let Some(v) = as_token {
        settings.as_token = v;
    }
    if let Some(v) = bot_localpart {
        settings.bot_localpart = v;
    }
    if let Some(v) = database_url {
        settings.database_url = v;
    }
    if let Some(v) = username_template {
        settings.username_template = v;
    }
    if let Some(v) = displayname_template {
        settings.displayname_template = v;
    }
    if let Some(v) = connect_timeout_secs {
        settings.connect_timeout_secs = v;
    }
    if let Some(v) = log_level {
        settings.log_level = v;
    }
}

/// `BRIDGE_*` variables, overridden in turn by their `APP__*` aliases.
fn apply_env(
    settings: &mut Settings,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<()> {
    let var = |name: &str| {
        lookup(&format!("APP__{name}")).or_else(|| lookup(&format!("BRIDGE_{name}")))
    };

    if let Some(v) = var("HOMESERVER_URL") {
        settings.homeserver_url = v;
    }
    if let Some(v) = var("HOMESERVER_DOMAIN") {
        settings.homeserver_domain = v;
    }
    if let Some(v) = var("AS_TOKEN") {
        settings.as_token = v;
    }
    if let Some(v) = var("BOT_LOCALPART") {
        settings.bot_localpart = v;
    }
    if let Some(v) = var("DATABASE_URL").or_else(|| lookup("DATABASE_URL")) {
        settings.database_url = v;
    }
    if let Some(v) = var("USERNAME_TEMPLATE") {
        settings.username_template = v;
    }
    if let Some(v) = var("DISPLAYNAME_TEMPLATE") {
        settings.displayname_template = v;
    }
    if let Some(v) = var("CONNECT_TIMEOUT_SECS") {
        settings.connect_timeout_secs = v
            .parse()
            .with_context(|| format!("invalid connect timeout '{v}'"))?;
    }
    if let Some(v) = var("LOG_LEVEL") {
        settings.log_level = v;
    }
    Ok(())
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
