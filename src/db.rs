//! Scylla session bootstrap.
//!
//! Connection settings come from `config.{ENV}.toml`:
//!
//! ```toml
//! [scylla]
//! hosts = ["127.0.0.1:9042"]
//! keyspace = "generations"
//! ```

use std::time::Duration;
use std::{env, fs};

use scylla::client::caching_session::CachingSession;
use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use toml::Value;

const CACHE_SIZE: usize = 1000;

/// Builds the session used by [`ScyllaStore`](crate::store::scylla::ScyllaStore).
/// Misconfiguration is fatal: this runs once at process start.
pub async fn db_session() -> CachingSession {
    dotenv::dotenv().ok();

    let env = env::var("ENV").expect("ENV must be set");
    let config_file = format!("config.{}.toml", env);

    let contents = fs::read_to_string(&config_file).expect("Unable to read config file");
    let config = contents.parse::<Value>().expect("Unable to parse TOML");

    let hosts = config["scylla"]["hosts"].as_array().expect("Missing hosts");
    let keyspace = config["scylla"]["keyspace"]
        .as_str()
        .expect("Missing keyspace");

    let known_nodes: Vec<&str> = hosts
        .iter()
        .map(|host| host.as_str().expect("host must be a string"))
        .collect();

    let session: Session = SessionBuilder::new()
        .known_nodes(&known_nodes)
        .connection_timeout(Duration::from_secs(3))
        .use_keyspace(keyspace, false)
        .build()
        .await
        .unwrap_or_else(|e| {
            panic!(
                "Unable to connect to scylla hosts: {:?}. \nError: {}",
                known_nodes, e
            )
        });

    CachingSession::from(session, CACHE_SIZE)
}
