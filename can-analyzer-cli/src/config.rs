//! Configuration loading and parsing

use anyhow::{bail, Context, Result};
use can_analyzer::{FilterRule, FilterScope, SessionConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Main application configuration (loaded from session.toml)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(rename = "session", default)]
    pub sessions: Vec<SessionEntry>,
}

/// One `[[session]]` table
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionEntry {
    #[serde(flatten)]
    pub config: SessionConfig,

    /// Write every logging-path frame as a JSON line to this file
    pub log_file: Option<PathBuf>,

    #[serde(default)]
    pub dbc: Vec<DbcEntry>,

    #[serde(default)]
    pub filter: Vec<FilterEntry>,

    #[serde(default)]
    pub tx: Vec<TxEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DbcEntry {
    pub path: PathBuf,
    /// Catalog key; defaults to the file name
    pub key: Option<String>,
}

/// A filter rule, session-wide unless `catalog` is given
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilterEntry {
    pub catalog: Option<String>,
    #[serde(flatten)]
    pub rule: FilterRule,
}

impl FilterEntry {
    pub fn scope(&self) -> FilterScope {
        match &self.catalog {
            Some(key) => FilterScope::Catalog(key.clone()),
            None => FilterScope::Session,
        }
    }
}

/// A transmission: raw (`id` + `data`) or encoded (`catalog` + `message` + `signals`)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TxEntry {
    pub id: Option<u32>,
    #[serde(default)]
    pub extended: bool,
    #[serde(default)]
    pub data: Vec<u8>,

    pub catalog: Option<String>,
    pub message: Option<String>,
    #[serde(default)]
    pub signals: HashMap<String, f64>,

    /// Periodic when set, one-shot otherwise
    pub period_ms: Option<u64>,
}

impl TxEntry {
    fn validate(&self) -> Result<()> {
        match (&self.id, &self.message) {
            (Some(_), Some(_)) => bail!("tx entry sets both 'id' and 'message'"),
            (None, None) => bail!("tx entry needs either 'id' or 'message'"),
            (None, Some(message)) if self.catalog.is_none() => {
                bail!("tx entry for message '{}' needs a 'catalog'", message)
            }
            _ => Ok(()),
        }
    }
}

/// Load configuration from a TOML file
///
/// Relative DBC and log paths are resolved against the config file's directory.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let mut config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for session in &mut config.sessions {
        for dbc in &mut session.dbc {
            dbc.path = base.join(&dbc.path);
        }
        if let Some(log_file) = &mut session.log_file {
            *log_file = base.join(&*log_file);
        }
    }

    validate(&config)?;
    Ok(config)
}

fn validate(config: &AppConfig) -> Result<()> {
    if config.sessions.is_empty() {
        bail!("configuration defines no [[session]]");
    }
    for session in &config.sessions {
        session
            .config
            .validate()
            .with_context(|| format!("Invalid session '{}'", session.config.name))?;
        for tx in &session.tx {
            tx.validate()
                .with_context(|| format!("Invalid tx entry in session '{}'", session.config.name))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use can_analyzer::FilterMode;
    use std::io::Write;

    const EXAMPLE: &str = r#"
        [[session]]
        name = "Powertrain"
        trace_capacity = 5000
        log_file = "powertrain.jsonl"
        interface = { interface = "virtual", channel = "vcan0" }

        [[session.dbc]]
        path = "powertrain.dbc"

        [[session.filter]]
        catalog = "powertrain.dbc"
        mode = "include"
        ids = [0x100]

        [[session.tx]]
        id = 0x7DF
        data = [2, 1, 12]
        period_ms = 100

        [[session]]
        name = "Body"
        interface = { interface = "virtual", channel = "vcan0", bitrate = 250000 }

        [[session.tx]]
        catalog = "body.dbc"
        message = "DoorStatus"
        signals = { DriverDoor = 1.0 }
    "#;

    #[test]
    fn test_config_deserialization() {
        let config: AppConfig = toml::from_str(EXAMPLE).unwrap();
        assert_eq!(config.sessions.len(), 2);

        let pt = &config.sessions[0];
        assert_eq!(pt.config.name, "Powertrain");
        assert_eq!(pt.config.trace_capacity, 5000);
        assert_eq!(pt.config.max_points_per_series, 20_000);
        assert_eq!(pt.dbc[0].path, PathBuf::from("powertrain.dbc"));
        assert_eq!(pt.filter[0].rule.mode, FilterMode::Include);
        assert!(pt.filter[0].rule.ids.contains(&0x100));
        assert_eq!(pt.filter[0].scope(), FilterScope::Catalog("powertrain.dbc".into()));
        assert_eq!(pt.tx[0].period_ms, Some(100));

        let body = &config.sessions[1];
        assert_eq!(body.config.interface.bitrate, 250_000);
        assert_eq!(body.tx[0].signals["DriverDoor"], 1.0);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_paths_are_relative_to_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.toml");
        fs::File::create(&path)
            .unwrap()
            .write_all(EXAMPLE.as_bytes())
            .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.sessions[0].dbc[0].path, dir.path().join("powertrain.dbc"));
        assert_eq!(
            config.sessions[0].log_file.as_deref(),
            Some(dir.path().join("powertrain.jsonl").as_path())
        );
    }

    #[test]
    fn test_demo_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../demos/session.toml");
        let config = load_config(&path).unwrap();
        assert_eq!(config.sessions.len(), 2);
        assert!(config.sessions[0].dbc[0].path.ends_with("powertrain.dbc"));
        assert_eq!(config.sessions[1].filter[0].scope(), FilterScope::Session);
    }

    #[test]
    fn test_invalid_tx_entry() {
        let config: AppConfig = toml::from_str(
            r#"
            [[session]]
            name = "A"
            interface = { interface = "virtual", channel = "vcan0" }

            [[session.tx]]
            message = "DoorStatus"
            "#,
        )
        .unwrap();
        assert!(validate(&config).is_err());
    }
}
