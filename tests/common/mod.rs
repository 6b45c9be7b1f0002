use pg_deltastream::config::{Config, PostgresConfig, ReplicationConfig};
use std::env;
use tokio_postgres::{Client, NoTls};

/// Get test configuration from environment variables
pub fn get_test_config() -> Config {
    // Use TEST_ prefix for test environment variables
    let postgres = PostgresConfig {
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .unwrap_or(5432),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: Some(env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string())),
        connect_timeout_secs: 30,
    };

    let replication = ReplicationConfig {
        publication: format!("test_publication_{}", std::process::id()),
        create_publication: true,
        slot_prefix: "test".to_string(),
        keepalive_interval_secs: 1, // Frequent status updates for tests
        shutdown_timeout_secs: 5,
    };

    Config {
        postgres,
        replication,
    }
}

/// Regular connection for seeding and inspecting the test database.
pub async fn connect(config: &Config) -> Client {
    let (client, connection) = config
        .postgres_config()
        .connect(NoTls)
        .await
        .expect("Failed to connect to test database");
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("Test connection error: {}", e);
        }
    });
    client
}

/// Creates an empty table unique to this test process.
pub async fn create_table(client: &Client, table: &str) {
    client
        .batch_execute(&format!(
            "DROP TABLE IF EXISTS {table};
             CREATE TABLE {table} (id INT PRIMARY KEY, name TEXT NOT NULL);"
        ))
        .await
        .expect("Failed to create test table");
}

pub async fn cleanup(client: &Client, config: &Config, table: &str) {
    client
        .batch_execute(&format!(
            "DROP TABLE IF EXISTS {table};
             DROP PUBLICATION IF EXISTS {};",
            config.replication.publication
        ))
        .await
        .ok();
}

/// Slots currently present on the server.
pub async fn slot_names(client: &Client) -> Vec<String> {
    client
        .query("SELECT slot_name::text FROM pg_replication_slots", &[])
        .await
        .expect("Failed to list replication slots")
        .iter()
        .map(|row| row.get(0))
        .collect()
}
