//! Process configuration.
//!
//! Values come either from a YAML document or from environment variables.
//! Anything left out falls back to the defaults below.

use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;

const SSL_MODES: [&str; 6] = [
    "disable",
    "allow",
    "prefer",
    "require",
    "verify-ca",
    "verify-full",
];

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub cache_ttl_secs: u64,
    pub cache_capacity: u64,
    pub cache_control: String,
    pub disable_gzip: bool,
    pub debug: bool,
    pub query_timeout_secs: u64,
    /// Redis instance shared by every server, if any.
    pub redis_url: Option<String>,
    /// Lifetime of tiles in Redis, written like `1h30m` or `90s`.
    pub redis_cache_duration: String,
    pub database: DatabaseConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub ssl_mode: String,
    pub max_connections: u32,
    pub read_only: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 8095,
            allowed_origins: vec![String::from("https://*"), String::from("http://*")],
            cache_ttl_secs: 3600,
            cache_capacity: 10_000,
            cache_control: String::from("private, max-age=300"),
            disable_gzip: false,
            debug: false,
            query_timeout_secs: 30,
            redis_url: None,
            redis_cache_duration: String::from("1h"),
            database: DatabaseConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            host: String::from("localhost"),
            port: 5432,
            user: String::from("postgres"),
            password: String::new(),
            name: String::from("postgres"),
            ssl_mode: String::from("require"),
            max_connections: 10,
            read_only: true,
        }
    }
}

impl Config {
    /// Parses a YAML configuration document.
    pub fn from_yaml(data: &str) -> Result<Config, Error> {
        let config: Config = serde_yaml::from_str(data)?;
        config.validate()
    }

    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Config, Error> {
        Config::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Config, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        let db = &mut config.database;

        set_parsed(&lookup, "PORT", &mut config.port)?;
        if let Some(origins) = lookup("ALLOWED_ORIGINS") {
            config.allowed_origins = origins.split_whitespace().map(String::from).collect();
        }
        set_parsed(&lookup, "CACHE_TTL_SECS", &mut config.cache_ttl_secs)?;
        set_parsed(&lookup, "CACHE_CAPACITY", &mut config.cache_capacity)?;
        set_string(&lookup, "CACHE_CONTROL_HEADER", &mut config.cache_control);
        set_parsed(&lookup, "DISABLE_GZIP", &mut config.disable_gzip)?;
        set_parsed(&lookup, "DEBUG", &mut config.debug)?;
        set_parsed(&lookup, "QUERY_TIMEOUT_SECS", &mut config.query_timeout_secs)?;
        config.redis_url = lookup("REDIS_URL").filter(|url| !url.trim().is_empty());
        set_string(&lookup, "REDIS_CACHE_DURATION", &mut config.redis_cache_duration);

        set_string(&lookup, "POSTGRES_HOST", &mut db.host);
        set_parsed(&lookup, "POSTGRES_PORT", &mut db.port)?;
        set_string(&lookup, "POSTGRES_USER", &mut db.user);
        set_string(&lookup, "POSTGRES_PASS", &mut db.password);
        set_string(&lookup, "POSTGRES_DB_NAME", &mut db.name);
        set_string(&lookup, "POSTGRES_SSL_MODE", &mut db.ssl_mode);
        set_parsed(&lookup, "POSTGRES_MAX_CONNECTIONS", &mut db.max_connections)?;

        config.validate()
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn redis_cache_ttl(&self) -> Result<Duration, Error> {
        parse_duration(&self.redis_cache_duration)
    }

    fn validate(self) -> Result<Config, Error> {
        if !SSL_MODES.contains(&self.database.ssl_mode.as_str()) {
            return Err(Error::Config(format!(
                "unknown ssl mode `{}`, expected one of {}",
                self.database.ssl_mode,
                SSL_MODES.join(", ")
            )));
        }
        if self.query_timeout_secs == 0 {
            return Err(Error::Config(String::from("the query timeout must be positive")));
        }
        if self.database.max_connections == 0 {
            return Err(Error::Config(String::from(
                "at least one database connection is required",
            )));
        }
        if self.redis_cache_ttl()?.as_secs() == 0 {
            return Err(Error::Config(String::from(
                "the redis cache duration must be at least a second",
            )));
        }

        Ok(self)
    }
}

/// Parses durations such as `1h`, `90s` or `1h30m15s`. Units are `h`, `m`,
/// `s` and `ms`.
fn parse_duration(input: &str) -> Result<Duration, Error> {
    let invalid = || Error::Config(format!("invalid duration `{}`", input));

    let mut rest = input.trim();
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        let value: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "h" => Duration::from_secs(value.saturating_mul(3600)),
            "m" => Duration::from_secs(value.saturating_mul(60)),
            "s" => Duration::from_secs(value),
            "ms" => Duration::from_millis(value),
            _ => return Err(invalid()),
        };
        total = total.saturating_add(part);
        rest = &rest[unit_len..];
    }

    Ok(total)
}

fn set_string<F>(lookup: &F, key: &str, target: &mut String)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(key) {
        *target = value;
    }
}

fn set_parsed<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<(), Error>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(value) = lookup(key) {
        *target = value
            .trim()
            .parse()
            .map_err(|err| Error::Config(format!("{}=`{}`: {}", key, value, err)))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(Config::default(), config);
        assert_eq!(8095, config.port);
        assert_eq!(Duration::from_secs(3600), config.cache_ttl());
        assert!(config.database.read_only);
    }

    #[test]
    fn test_environment_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("PORT", "9000"),
            ("ALLOWED_ORIGINS", "https://maps.example.com  http://localhost*"),
            ("DISABLE_GZIP", "true"),
            ("DEBUG", "true"),
            ("POSTGRES_HOST", "db"),
            ("POSTGRES_PORT", "6432"),
            ("POSTGRES_PASS", "p@ss word"),
            ("POSTGRES_SSL_MODE", "disable"),
        ]))
        .unwrap();

        assert_eq!(9000, config.port);
        assert_eq!(
            vec!["https://maps.example.com", "http://localhost*"],
            config.allowed_origins
        );
        assert!(config.disable_gzip);
        assert!(config.debug);
        assert_eq!("db", config.database.host);
        assert_eq!(6432, config.database.port);
        assert_eq!("p@ss word", config.database.password);
        assert_eq!("disable", config.database.ssl_mode);
    }

    #[test]
    fn test_invalid_environment() {
        assert!(Config::from_lookup(lookup(&[("PORT", "eighty")])).is_err());
        assert!(Config::from_lookup(lookup(&[("DEBUG", "yes please")])).is_err());
        assert!(Config::from_lookup(lookup(&[("POSTGRES_SSL_MODE", "sometimes")])).is_err());
        assert!(Config::from_lookup(lookup(&[("QUERY_TIMEOUT_SECS", "0")])).is_err());
    }

    #[test]
    fn test_parse_yaml() {
        let config = Config::from_yaml(
            "
port: 8080
cache_ttl_secs: 60
database:
  host: postgis
  name: gis
  ssl_mode: prefer
",
        )
        .unwrap();

        assert_eq!(8080, config.port);
        assert_eq!(Duration::from_secs(60), config.cache_ttl());
        assert_eq!("postgis", config.database.host);
        assert_eq!("gis", config.database.name);
        assert_eq!(5432, config.database.port);
        assert_eq!(Config::default().allowed_origins, config.allowed_origins);
    }

    #[test]
    fn test_redis_settings() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(None, config.redis_url);
        assert_eq!(Duration::from_secs(3600), config.redis_cache_ttl().unwrap());

        let config = Config::from_lookup(lookup(&[
            ("REDIS_URL", "redis://cache:6379/0"),
            ("REDIS_CACHE_DURATION", "1h30m15s"),
        ]))
        .unwrap();
        assert_eq!(Some("redis://cache:6379/0"), config.redis_url.as_deref());
        assert_eq!(Duration::from_secs(5415), config.redis_cache_ttl().unwrap());

        let config = Config::from_lookup(lookup(&[("REDIS_URL", " ")])).unwrap();
        assert_eq!(None, config.redis_url);

        assert!(Config::from_lookup(lookup(&[("REDIS_CACHE_DURATION", "hourly")])).is_err());
        assert!(Config::from_lookup(lookup(&[("REDIS_CACHE_DURATION", "500ms")])).is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(Duration::from_secs(90), parse_duration("90s").unwrap());
        assert_eq!(Duration::from_secs(120), parse_duration("2m").unwrap());
        assert_eq!(Duration::from_millis(1500), parse_duration("1s500ms").unwrap());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("5d").is_err());
    }

    #[test]
    fn test_yaml_rejects_unknown_keys() {
        assert!(Config::from_yaml("prot: 8080").is_err());
    }
}
