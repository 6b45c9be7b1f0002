use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicationConfig {
    #[serde(default = "default_publication")]
    pub publication: String,
    #[serde(default)]
    pub create_publication: bool,
    #[serde(default = "default_slot_prefix")]
    pub slot_prefix: String,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            publication: default_publication(),
            create_publication: false,
            slot_prefix: default_slot_prefix(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("DELTASTREAM")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        settings.try_deserialize()
    }

    /// Connection settings for the regular (snapshot) connections.
    pub fn postgres_config(&self) -> tokio_postgres::Config {
        let pg = &self.postgres;
        let mut config = tokio_postgres::Config::new();
        config
            .host(&pg.host)
            .port(pg.port)
            .user(&pg.username)
            .dbname(&pg.database)
            .connect_timeout(pg.connect_timeout())
            .application_name("pg-deltastream");
        if let Some(password) = &pg.password {
            config.password(password);
        }
        config
    }
}

impl PostgresConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl ReplicationConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn default_port() -> u16 {
    5432
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_publication() -> String {
    "deltastream".to_string()
}

fn default_slot_prefix() -> String {
    "delta".to_string()
}

fn default_keepalive_interval_secs() -> u64 {
    10
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[postgres]
host = "db.internal"
database = "app"
username = "replicator"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.postgres.port, 5432);
        assert_eq!(config.postgres.password, None);
        assert_eq!(config.replication.publication, "deltastream");
        assert_eq!(config.replication.slot_prefix, "delta");
        assert_eq!(config.replication.keepalive_interval(), Duration::from_secs(10));
        assert!(!config.replication.create_publication);
    }

    #[test]
    fn test_postgres_config_keeps_special_characters() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[postgres]
host = "localhost"
port = 5433
database = "app"
username = "u@corp"
password = "p@ss/w?rd#1"
connect_timeout_secs = 3
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        let pg = config.postgres_config();
        assert_eq!(pg.get_user(), Some("u@corp"));
        assert_eq!(pg.get_password(), Some("p@ss/w?rd#1".as_bytes()));
        assert_eq!(pg.get_dbname(), Some("app"));
        assert_eq!(pg.get_ports(), &[5433]);
        assert_eq!(
            pg.get_hosts(),
            &[tokio_postgres::config::Host::Tcp("localhost".to_string())]
        );
        assert_eq!(pg.get_connect_timeout(), Some(&Duration::from_secs(3)));
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[postgres]
host = "db.internal"
database = "app"
username = "replicator"

[replication]
shutdown_timeout_secs = 2
"#
        )
        .unwrap();

        // Only this test reads the key.
        std::env::set_var("DELTASTREAM__REPLICATION__SHUTDOWN_TIMEOUT_SECS", "42");
        let config = Config::from_file(file.path());
        std::env::remove_var("DELTASTREAM__REPLICATION__SHUTDOWN_TIMEOUT_SECS");

        let config = config.unwrap();
        assert_eq!(config.replication.shutdown_timeout(), Duration::from_secs(42));
        assert_eq!(config.postgres.host, "db.internal");
    }

    #[test]
    fn test_keepalive_interval_never_zero() {
        let replication = ReplicationConfig {
            keepalive_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(replication.keepalive_interval(), Duration::from_secs(1));
    }
}
