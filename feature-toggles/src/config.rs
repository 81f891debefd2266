use std::net::SocketAddr;
use std::ops::Deref;
use std::str::FromStr;

use envconfig::Envconfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlexBool(pub bool);

impl FromStr for FlexBool {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(FlexBool(true)),
            "false" | "0" | "no" | "off" | "" => Ok(FlexBool(false)),
            _ => Err(format!("Invalid boolean value: {}", s)),
        }
    }
}

impl From<FlexBool> for bool {
    fn from(flex: FlexBool) -> Self {
        flex.0
    }
}

impl Deref for FlexBool {
    type Target = bool;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A comma separated list of token secrets, used to seed the token store on startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretList(pub Vec<String>);

impl FromStr for SecretList {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(SecretList(
            s.split(',')
                .map(str::trim)
                .filter(|secret| !secret.is_empty())
                .map(String::from)
                .collect(),
        ))
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:4242")]
    pub address: SocketAddr,

    /// Postgres connection string. The in-memory store is used when unset.
    pub database_url: Option<String>,

    #[envconfig(default = "10")]
    pub max_pg_connections: u32,

    #[envconfig(default = "true")]
    pub run_migrations: FlexBool,

    #[envconfig(default = "1000")]
    pub max_concurrency: usize,

    #[envconfig(default = "false")]
    pub enable_metrics: FlexBool,

    #[envconfig(default = "false")]
    pub debug: FlexBool,

    #[envconfig(default = "")]
    pub init_admin_api_tokens: SecretList,

    #[envconfig(default = "")]
    pub init_client_api_tokens: SecretList,

    #[envconfig(default = "")]
    pub init_frontend_api_tokens: SecretList,
}

impl Config {
    pub fn default_test_config() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 0)),
            database_url: None,
            max_pg_connections: 10,
            run_migrations: FlexBool(false),
            max_concurrency: 1000,
            enable_metrics: FlexBool(false),
            debug: FlexBool(false),
            init_admin_api_tokens: SecretList::default(),
            init_client_api_tokens: SecretList::default(),
            init_frontend_api_tokens: SecretList::default(),
        }
    }
}
