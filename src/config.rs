//! YAML configuration with `${VAR:-default}` environment substitution.
//!
//! The substitution is a pre-pass over the raw text: every `${NAME}` or
//! `${NAME:-default}` token is replaced before the result is handed to
//! `serde_yaml`, so the structured sections below stay plain, typed YAML.

use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub rabbitmq: RabbitMqConfig,
    pub websocket: WebsocketConfig,
    pub services: ServicesConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl DatabaseConfig {
    /// The engine speaks to SQLite directly (physical schema layout is an
    /// external collaborator); `database` is read as a file path here.
    pub fn sqlite_url(&self) -> String {
        format!("sqlite://{}", self.database)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RabbitMqConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl RabbitMqConfig {
    pub fn amqp_url(&self) -> String {
        format!("amqp://{}:{}@{}:{}/", self.user, self.password, self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebsocketConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServicesConfig {
    pub ride_service: u16,
    pub driver_location_service: u16,
    pub admin_service: u16,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;
        let substituted = substitute_env(&raw);
        serde_yaml::from_str(&substituted).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

/// Replaces every `${NAME}` / `${NAME:-default}` occurrence in `text` with
/// the named environment variable, or the default if the variable is unset
/// (empty string if neither is given). Unlike the hand-rolled YAML-subset
/// parser this is modeled on, this pre-pass runs over the whole file once
/// and then hands a normal YAML document to `serde_yaml`.
fn substitute_env(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let inside = &after[..end];
        let (var_name, default) = match inside.split_once(":-") {
            Some((name, def)) => (name, def),
            None => (inside, ""),
        };
        let value = std::env::var(var_name).unwrap_or_else(|_| default.to_string());
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(String),
    #[error("failed to parse config: {0}")]
    ParseError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_set_variable_over_its_default() {
        std::env::set_var("RIDE_ENGINE_TEST_VAR", "from-env");
        let out = substitute_env("host: ${RIDE_ENGINE_TEST_VAR:-fallback}");
        assert_eq!(out, "host: from-env");
        std::env::remove_var("RIDE_ENGINE_TEST_VAR");
    }

    #[test]
    fn falls_back_to_default_when_unset() {
        std::env::remove_var("RIDE_ENGINE_DEFINITELY_UNSET");
        let out = substitute_env("port: ${RIDE_ENGINE_DEFINITELY_UNSET:-5432}");
        assert_eq!(out, "port: 5432");
    }

    #[test]
    fn falls_back_to_empty_string_when_no_default_given_and_unset() {
        std::env::remove_var("RIDE_ENGINE_NO_DEFAULT");
        let out = substitute_env("user: ${RIDE_ENGINE_NO_DEFAULT}");
        assert_eq!(out, "user: ");
    }

    #[test]
    fn loads_a_full_document_end_to_end() {
        std::env::set_var("RIDE_ENGINE_TEST_DB_PASS", "hunter2");
        let yaml = r#"
database:
  host: localhost
  port: 5432
  user: postgres
  password: ${RIDE_ENGINE_TEST_DB_PASS:-changeme}
  database: ride_engine.db
rabbitmq:
  host: localhost
  port: 5672
  user: guest
  password: ${RIDE_ENGINE_TEST_RMQ_PASS:-guest}
websocket:
  port: 8080
services:
  ride_service: 8081
  driver_location_service: 8082
  admin_service: 8083
"#;
        let substituted = substitute_env(yaml);
        let cfg: Config = serde_yaml::from_str(&substituted).unwrap();
        assert_eq!(cfg.database.password, "hunter2");
        assert_eq!(cfg.rabbitmq.password, "guest");
        std::env::remove_var("RIDE_ENGINE_TEST_DB_PASS");
    }
}
