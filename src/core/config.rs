/// Configuration documents for the backup tools
///
/// Both tools read JSON. A missing or unparseable document is fatal; individual
/// database entries are validated one by one so a broken entry only skips itself.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::engine::{DatabaseTarget, EngineKind, ExecutionMode};
use crate::core::error::{BackupError, BackupResult};
use crate::core::lifecycle::LifecyclePolicy;
use crate::utils::{DEFAULT_BACKUP_DIR, DEFAULT_COMMAND_TIMEOUT, DEFAULT_MAX_BACKUPS};

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Err(anyhow!("Configuration file not found: {}", path.display()));
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

fn parse_duration(field: &str, value: &str) -> BackupResult<Duration> {
    humantime::parse_duration(value.trim()).map_err(|e| {
        BackupError::ConfigValidation(format!("{} has an invalid duration '{}': {}", field, value, e))
    })
}

/// Overrides for the container stop state machine, durations as `"15s"`, `"1m"`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleSettings {
    pub max_retries: Option<u32>,
    pub stop_timeout: Option<String>,
    pub poll_interval: Option<String>,
    pub max_wait: Option<String>,
    pub cooldown: Option<String>,
}

impl LifecycleSettings {
    pub fn policy(&self) -> BackupResult<LifecyclePolicy> {
        let mut policy = LifecyclePolicy::default();

        if let Some(retries) = self.max_retries {
            if retries == 0 {
                return Err(BackupError::ConfigValidation(
                    "lifecycle.max_retries must be at least 1".to_string(),
                ));
            }
            policy.max_retries = retries;
        }
        if let Some(v) = &self.stop_timeout {
            policy.stop_timeout = parse_duration("lifecycle.stop_timeout", v)?;
        }
        if let Some(v) = &self.poll_interval {
            policy.poll_interval = parse_duration("lifecycle.poll_interval", v)?;
        }
        if let Some(v) = &self.max_wait {
            policy.max_wait = parse_duration("lifecycle.max_wait", v)?;
        }
        if let Some(v) = &self.cooldown {
            policy.cooldown = parse_duration("lifecycle.cooldown", v)?;
        }

        if policy.poll_interval.is_zero() {
            return Err(BackupError::ConfigValidation(
                "lifecycle.poll_interval must be greater than zero".to_string(),
            ));
        }

        Ok(policy)
    }
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from(DEFAULT_BACKUP_DIR)
}

/// Volumes and containers handled by `backup-dockers`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerBackupConfig {
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub containers: Vec<String>,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub lifecycle: LifecycleSettings,
}

impl DockerBackupConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = read_json(path.as_ref())?;
        config
            .lifecycle
            .policy()
            .context("Invalid lifecycle settings")?;
        Ok(config)
    }

    /// Artifact path for a volume or container, `<backup_dir>/<name>.tar`
    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.backup_dir.join(format!("{}.tar", name))
    }
}

/// Ports are accepted as numbers or numeric strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    Number(u64),
    Text(String),
}

impl PortValue {
    fn resolve(&self) -> Option<u16> {
        match self {
            PortValue::Number(n) => u16::try_from(*n).ok(),
            PortValue::Text(s) => s.trim().parse().ok(),
        }
        .filter(|p| *p != 0)
    }
}

impl std::fmt::Display for PortValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortValue::Number(n) => write!(f, "{}", n),
            PortValue::Text(s) => f.write_str(s),
        }
    }
}

/// A database entry as written in the document, before validation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDatabaseEntry {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub host: Option<String>,
    pub port: Option<PortValue>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub backup_path: Option<String>,
    #[serde(default)]
    pub use_docker_exec: bool,
    pub docker_container: Option<String>,
    pub max_backups: Option<usize>,
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl RawDatabaseEntry {
    /// Parse one element of the `databases` list; shape errors stay local to the entry
    pub fn from_value(value: &serde_json::Value) -> BackupResult<Self> {
        if !value.is_object() {
            return Err(BackupError::ConfigValidation(
                "database entry must be an object".to_string(),
            ));
        }
        serde_json::from_value(value.clone()).map_err(|e| {
            let name = value
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or("unknown");
            BackupError::ConfigValidation(format!("entry {}: {}", name, e))
        })
    }

    pub fn label(&self) -> &str {
        present(&self.name).unwrap_or("unknown")
    }

    pub fn validate(&self) -> BackupResult<DatabaseTarget> {
        let label = self.label().to_string();
        let missing = |field: &str| {
            BackupError::ConfigValidation(format!(
                "missing required field '{}' for database {}",
                field, label
            ))
        };

        let name = present(&self.name).ok_or_else(|| missing("name"))?;
        let kind = present(&self.kind).ok_or_else(|| missing("type"))?;
        let host = present(&self.host).ok_or_else(|| missing("host"))?;
        let port = self.port.as_ref().ok_or_else(|| missing("port"))?;
        let database = present(&self.database).ok_or_else(|| missing("database"))?;
        let backup_path = present(&self.backup_path).ok_or_else(|| missing("backup_path"))?;

        let engine = EngineKind::parse(kind).ok_or_else(|| {
            BackupError::ConfigValidation(format!("unsupported database type: {}", kind))
        })?;

        let port = port.resolve().ok_or_else(|| {
            BackupError::ConfigValidation(format!("invalid port '{}' for database {}", port, label))
        })?;

        let user = match (engine, present(&self.user)) {
            (_, Some(user)) => Some(user.to_string()),
            (EngineKind::MariaDb, None) => return Err(missing("user")),
            (EngineKind::PostgreSql, None) => Some("postgres".to_string()),
            (EngineKind::MongoDb, None) => None,
        };

        let container = present(&self.docker_container).map(str::to_string);
        let mode = match (self.use_docker_exec, &container) {
            (true, Some(c)) => ExecutionMode::Container(c.clone()),
            (true, None) => {
                return Err(BackupError::ConfigValidation(format!(
                    "use_docker_exec is set but docker_container is missing for database {}",
                    label
                )))
            }
            (false, _) => ExecutionMode::Direct,
        };

        let max_backups = self.max_backups.unwrap_or(DEFAULT_MAX_BACKUPS);
        if max_backups == 0 {
            return Err(BackupError::ConfigValidation(format!(
                "max_backups must be at least 1 for database {}",
                label
            )));
        }

        Ok(DatabaseTarget {
            name: name.to_string(),
            engine,
            host: host.to_string(),
            port,
            user,
            password: self.password.clone(),
            database: database.to_string(),
            backup_path: PathBuf::from(backup_path),
            container,
            mode,
            max_backups,
        })
    }
}

/// Databases handled by `db-backup`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Kept loose so one malformed entry cannot reject the whole document
    pub databases: Vec<serde_json::Value>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub command_timeout: Option<String>,
}

impl DatabaseConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let value: serde_json::Value = read_json(path)?;

        match value.get("databases") {
            None => return Err(anyhow!("Missing 'databases' section in {}", path.display())),
            Some(d) if !d.is_array() => {
                return Err(anyhow!("'databases' must be a list in {}", path.display()))
            }
            Some(_) => {}
        }

        let config: Self = serde_json::from_value(value)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.command_timeout()?;
        Ok(config)
    }

    pub fn command_timeout(&self) -> BackupResult<Duration> {
        match &self.command_timeout {
            Some(v) => parse_duration("command_timeout", v),
            None => Ok(DEFAULT_COMMAND_TIMEOUT),
        }
    }

    /// Every entry in document order, parsed but not validated
    pub fn entries(&self) -> Vec<BackupResult<RawDatabaseEntry>> {
        self.databases.iter().map(RawDatabaseEntry::from_value).collect()
    }

    /// First entry whose `name` equals `name`
    pub fn find(&self, name: &str) -> Option<BackupResult<RawDatabaseEntry>> {
        self.databases
            .iter()
            .find(|v| v.get("name").and_then(|n| n.as_str()) == Some(name))
            .map(RawDatabaseEntry::from_value)
    }

    /// Names of all entries, `unknown` for unnamed ones
    pub fn names(&self) -> Vec<String> {
        self.databases
            .iter()
            .map(|v| {
                v.get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or("unknown")
                    .to_string()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        file
    }

    fn entry(value: serde_json::Value) -> BackupResult<DatabaseTarget> {
        RawDatabaseEntry::from_value(&value)?.validate()
    }

    #[test]
    fn test_docker_config_defaults() {
        let file = write_config(r#"{"volumes": ["pg_data"], "containers": ["web1"]}"#);
        let config = DockerBackupConfig::load(file.path()).unwrap();

        assert_eq!(config.volumes, vec!["pg_data"]);
        assert_eq!(config.backup_dir, PathBuf::from("/mnt/pendrak"));
        assert_eq!(config.webhook_url, None);
        assert_eq!(config.lifecycle.policy().unwrap(), LifecyclePolicy::default());
        assert_eq!(
            config.artifact_path("web1"),
            PathBuf::from("/mnt/pendrak/web1.tar")
        );
    }

    #[test]
    fn test_lifecycle_overrides() {
        let file = write_config(
            r#"{"lifecycle": {"max_retries": 5, "stop_timeout": "30s", "max_wait": "1m"}}"#,
        );
        let config = DockerBackupConfig::load(file.path()).unwrap();
        let policy = config.lifecycle.policy().unwrap();

        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.stop_timeout, Duration::from_secs(30));
        assert_eq!(policy.max_wait, Duration::from_secs(60));
        assert_eq!(policy.poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_documents_are_fatal() {
        assert!(DockerBackupConfig::load("/nonexistent/config.json").is_err());

        let file = write_config("{ not json");
        assert!(DockerBackupConfig::load(file.path()).is_err());

        let file = write_config(r#"{"lifecycle": {"cooldown": "soon"}}"#);
        assert!(DockerBackupConfig::load(file.path()).is_err());

        let file = write_config(r#"{"webhook_url": "http://x"}"#);
        assert!(DatabaseConfig::load(file.path()).is_err());

        let file = write_config(r#"{"databases": {"name": "shop"}}"#);
        let err = DatabaseConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("must be a list"));
    }

    #[test]
    fn test_database_config_keeps_bad_entries_local() {
        let file = write_config(
            r#"{
                "databases": [
                    {"name": "shop", "type": "mariadb", "host": "db", "port": 3306,
                     "user": "root", "password": "pw", "database": "shop",
                     "backup_path": "/backups/shop"},
                    {"name": "broken", "type": "oracle"},
                    "not an object"
                ],
                "command_timeout": "30m"
            }"#,
        );
        let config = DatabaseConfig::load(file.path()).unwrap();
        let entries = config.entries();

        assert_eq!(entries.len(), 3);
        assert!(entries[0].as_ref().unwrap().validate().is_ok());
        assert!(entries[1].as_ref().unwrap().validate().is_err());
        assert!(entries[2].is_err());
        assert_eq!(config.command_timeout().unwrap(), Duration::from_secs(1800));
        assert_eq!(config.names(), vec!["shop", "broken", "unknown"]);
        assert!(config.find("shop").is_some());
        assert!(config.find("missing").is_none());
    }

    #[test]
    fn test_validation_rules() {
        let base = json!({
            "name": "app", "type": "PostgreSQL", "host": "db", "port": "5432",
            "database": "app", "backup_path": "/backups/app"
        });
        let target = entry(base.clone()).unwrap();
        assert_eq!(target.engine, EngineKind::PostgreSql);
        assert_eq!(target.port, 5432);
        assert_eq!(target.user.as_deref(), Some("postgres"));
        assert_eq!(target.mode, ExecutionMode::Direct);
        assert_eq!(target.max_backups, 3);

        let mut mariadb = base.clone();
        mariadb["type"] = json!("mariadb");
        let err = entry(mariadb).unwrap_err();
        assert!(err.to_string().contains("'user'"));

        let mut no_host = base.clone();
        no_host.as_object_mut().unwrap().remove("host");
        assert!(entry(no_host).unwrap_err().to_string().contains("'host'"));

        let mut exec_without_container = base.clone();
        exec_without_container["use_docker_exec"] = json!(true);
        assert!(entry(exec_without_container).is_err());

        let mut bad_port = base.clone();
        bad_port["port"] = json!(70000);
        assert!(entry(bad_port).is_err());
    }

    #[test]
    fn test_container_reference_without_exec_stays_direct() {
        let target = entry(json!({
            "name": "events", "type": "mongodb", "host": "localhost", "port": 27017,
            "database": "events", "backup_path": "/backups/events",
            "docker_container": "mongo", "max_backups": 5
        }))
        .unwrap();

        assert_eq!(target.mode, ExecutionMode::Direct);
        assert_eq!(target.container.as_deref(), Some("mongo"));
        assert_eq!(target.user, None);
        assert_eq!(target.max_backups, 5);

        let exec = entry(json!({
            "name": "events", "type": "mongodb", "host": "localhost", "port": 27017,
            "database": "events", "backup_path": "/backups/events",
            "use_docker_exec": true, "docker_container": "mongo"
        }))
        .unwrap();
        assert_eq!(exec.mode, ExecutionMode::Container("mongo".to_string()));
    }
}
