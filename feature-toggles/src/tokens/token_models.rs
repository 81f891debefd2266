use std::collections::BTreeSet;
use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const WILDCARD: &str = "*";
const MULTI_PROJECT_MARKER: &str = "[]";
const MAX_SECRET_LENGTH: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    #[serde(alias = "ADMIN")]
    Admin,
    #[serde(alias = "CLIENT")]
    Client,
    #[serde(alias = "FRONTEND")]
    Frontend,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Admin => "admin",
            TokenType::Client => "client",
            TokenType::Frontend => "frontend",
        }
    }
}

impl Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TokenType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "admin" => Ok(TokenType::Admin),
            "client" => Ok(TokenType::Client),
            "frontend" => Ok(TokenType::Frontend),
            other => Err(format!("{other} is not a valid token type")),
        }
    }
}

/// Why a secret was rejected before any store lookup.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum InvalidTokenReason {
    #[error("empty")]
    IsEmpty,
    #[error("too_long")]
    IsTooLong,
    #[error("not_ascii")]
    IsNotAscii,
    #[error("malformed")]
    IsMalformed,
}

/// Projects a token may read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectAccess {
    All,
    Only(BTreeSet<String>),
}

impl ProjectAccess {
    pub fn from_projects<I, S>(projects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let projects: BTreeSet<String> = projects.into_iter().map(Into::into).collect();
        if projects.contains(WILDCARD) {
            ProjectAccess::All
        } else {
            ProjectAccess::Only(projects)
        }
    }

    pub fn allows(&self, project: &str) -> bool {
        match self {
            ProjectAccess::All => true,
            ProjectAccess::Only(projects) => projects.contains(project),
        }
    }
}

/// Environments a token may read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentAccess {
    All,
    Only(String),
}

impl EnvironmentAccess {
    pub fn parse(environment: &str) -> Self {
        if environment == WILDCARD {
            EnvironmentAccess::All
        } else {
            EnvironmentAccess::Only(environment.to_string())
        }
    }

    pub fn allows(&self, environment: &str) -> bool {
        match self {
            EnvironmentAccess::All => true,
            EnvironmentAccess::Only(allowed) => allowed == environment,
        }
    }

    pub fn concrete(&self) -> Option<&str> {
        match self {
            EnvironmentAccess::All => None,
            EnvironmentAccess::Only(environment) => Some(environment),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenScope {
    pub projects: ProjectAccess,
    pub environment: EnvironmentAccess,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiToken {
    pub secret: String,
    pub token_name: String,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    pub projects: Vec<String>,
    pub environment: String,
    pub created_at: DateTime<Utc>,
}

impl ApiToken {
    pub fn scope(&self) -> TokenScope {
        TokenScope {
            projects: ProjectAccess::from_projects(self.projects.iter().cloned()),
            environment: EnvironmentAccess::parse(&self.environment),
        }
    }

    /// Builds a token from a pre-shared secret, taking project and environment from its shape.
    /// Used to seed tokens from configuration.
    pub fn from_secret(
        secret: &str,
        token_type: TokenType,
        created_at: DateTime<Utc>,
    ) -> Result<ApiToken, InvalidTokenReason> {
        let shape = parse_secret(secret)?;
        let projects = match shape.project {
            Some(project) => vec![project],
            // Multi-project secrets carry no project list, there is nothing to seed from.
            None => return Err(InvalidTokenReason::IsMalformed),
        };
        Ok(ApiToken {
            secret: secret.to_string(),
            token_name: format!("init-{}", token_type),
            token_type,
            projects,
            environment: shape.environment,
            created_at,
        })
    }
}

/// The parts a secret encodes: `<project-part>:<environment>.<hash>`.
#[derive(Debug, PartialEq, Eq)]
pub struct SecretShape {
    /// `None` for multi-project (`[]`) secrets.
    pub project: Option<String>,
    pub environment: String,
}

/// Check if a secret is the right shape. It may not actually be a known token.
pub fn validate_secret(secret: &str) -> Result<(), InvalidTokenReason> {
    parse_secret(secret).map(|_| ())
}

pub fn parse_secret(secret: &str) -> Result<SecretShape, InvalidTokenReason> {
    if secret.is_empty() {
        return Err(InvalidTokenReason::IsEmpty);
    }

    if secret.len() > MAX_SECRET_LENGTH {
        return Err(InvalidTokenReason::IsTooLong);
    }

    if !secret.is_ascii() {
        return Err(InvalidTokenReason::IsNotAscii);
    }

    let (project, rest) = secret
        .split_once(':')
        .ok_or(InvalidTokenReason::IsMalformed)?;
    let (environment, hash) = rest
        .split_once('.')
        .ok_or(InvalidTokenReason::IsMalformed)?;

    if project.is_empty() || environment.is_empty() || hash.is_empty() {
        return Err(InvalidTokenReason::IsMalformed);
    }

    Ok(SecretShape {
        project: (project != MULTI_PROJECT_MARKER).then(|| project.to_string()),
        environment: environment.to_string(),
    })
}

pub fn random_hash(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Generates a fresh secret for the given projects and environment.
pub fn generate_secret(projects: &[String], environment: &str) -> String {
    let project_part = match projects {
        [single] => single.as_str(),
        _ => MULTI_PROJECT_MARKER,
    };
    format!("{}:{}.{}", project_part, environment, random_hash(32))
}
