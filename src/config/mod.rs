/// Configuration management for the bpmnway engine
///
/// Handles server configuration, storage selection, engine pacing, connector
/// endpoints and the system variables injected into every new instance.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Engine behaviour
    pub engine: EngineConfig,
    /// Connector name -> base URL of the external HTTP service
    pub connectors: HashMap<String, String>,
    /// Variables seeded into every new instance (e.g. `_frontend_url`)
    pub system_variables: HashMap<String, String>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Which persistence backend the engine writes event records to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Sqlite,
    Postgres,
    Memory,
}

impl StorageKind {
    /// `BPMNWAY_STORAGE` wins; otherwise `POSTGRES_PROVIDER=postgres` selects Postgres
    pub fn select(storage: Option<&str>, provider: Option<&str>) -> Self {
        match storage.map(str::trim) {
            Some("memory") => StorageKind::Memory,
            Some("postgres") => StorageKind::Postgres,
            Some("sqlite") => StorageKind::Sqlite,
            _ if provider.map(str::trim) == Some("postgres") => StorageKind::Postgres,
            _ => StorageKind::Sqlite,
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding `database.sqlite` (default: "database")
    pub data_dir: String,
    /// Storage backend
    pub storage: StorageKind,
    /// Connection settings used when `storage` is `Postgres`
    pub postgres: PostgresConfig,
}

/// Postgres connection settings, read from the `POSTGRES_*` variables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    pub database: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            database: "bpmnway".to_string(),
        }
    }
}

impl PostgresConfig {
    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("POSTGRES_HOST").unwrap_or(defaults.host),
            port: std::env::var("POSTGRES_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            user: std::env::var("POSTGRES_USER").unwrap_or(defaults.user),
            password: std::env::var("POSTGRES_PASSWORD").unwrap_or(defaults.password),
            database: std::env::var("POSTGRES_DB_NAME").unwrap_or(defaults.database),
        }
    }
}

impl DatabaseConfig {
    /// Full path of the SQLite database file
    pub fn sqlite_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("database.sqlite")
    }
}

/// What the run loop does when it pops an end event while other tokens are pending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndPolicy {
    /// Stop the instance at the first end event, abandoning other branches
    Halt,
    /// Consume the end token and keep stepping until no tokens remain
    Drain,
}

/// Engine behaviour knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory scanned for `*.bpmn` definitions
    pub models_dir: String,
    /// Optional pacing delay after each step, in milliseconds
    pub step_delay_ms: u64,
    /// End-event handling
    pub end_policy: EndPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            models_dir: "models".to_string(),
            step_delay_ms: 0,
            end_policy: EndPolicy::Halt,
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for container deployment
    fn default() -> Self {
        let port = std::env::var("BPMNWAY_PORT")
            .or_else(|_| std::env::var("PORT"))
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let storage = StorageKind::select(
            std::env::var("BPMNWAY_STORAGE").ok().as_deref(),
            std::env::var("POSTGRES_PROVIDER").ok().as_deref(),
        );

        let end_policy = match std::env::var("BPMNWAY_END_POLICY").as_deref() {
            Ok("drain") => EndPolicy::Drain,
            _ => EndPolicy::Halt,
        };

        let mut system_variables = HashMap::new();
        if let Ok(url) = std::env::var("FRONTEND_URL") {
            system_variables.insert("_frontend_url".to_string(), url);
        }

        Self {
            server: ServerConfig {
                host: std::env::var("BPMNWAY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port,
            },
            database: DatabaseConfig {
                data_dir: std::env::var("BPMNWAY_DATA_DIR")
                    .unwrap_or_else(|_| "database".to_string()),
                storage,
                postgres: PostgresConfig::from_env(),
            },
            engine: EngineConfig {
                models_dir: std::env::var("BPMNWAY_MODELS_DIR")
                    .unwrap_or_else(|_| "models".to_string()),
                step_delay_ms: std::env::var("BPMNWAY_STEP_DELAY_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
                end_policy,
            },
            connectors: connectors_from_env(),
            system_variables,
        }
    }
}

/// Collect connector base URLs from the environment
///
/// The well-known `<NAME>_CONNECTOR_URL` variables are read first, then
/// `BPMNWAY_CONNECTORS="name=url,name=url"` entries override them.
fn connectors_from_env() -> HashMap<String, String> {
    let mut connectors = HashMap::new();

    for name in ["baserow", "sendgrid", "pdf"] {
        let key = format!("{}_CONNECTOR_URL", name.to_uppercase());
        if let Ok(url) = std::env::var(&key) {
            connectors.insert(name.to_string(), url);
        }
    }

    if let Ok(list) = std::env::var("BPMNWAY_CONNECTORS") {
        connectors.extend(parse_connector_list(&list));
    }

    connectors
}

/// Parse `name=url,name=url` pairs, skipping malformed entries
pub fn parse_connector_list(list: &str) -> HashMap<String, String> {
    list.split(',')
        .filter_map(|pair| {
            let (name, url) = pair.split_once('=')?;
            let (name, url) = (name.trim(), url.trim());
            if name.is_empty() || url.is_empty() {
                None
            } else {
                Some((name.to_string(), url.to_string()))
            }
        })
        .collect()
}
