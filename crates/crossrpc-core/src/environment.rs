//! The three execution contexts that can host a crossrpc runtime.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Which side of the protocol a context runs on.
///
/// The serialized form is the `env`/`fenv` tag carried by every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Environment {
    #[serde(rename = "server")]
    Server,
    #[serde(rename = "client")]
    Client,
    /// An embedded browser surface hosted inside a client.
    #[serde(rename = "browser-surface", alias = "cef")]
    Browser,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Server => "server",
            Environment::Client => "client",
            Environment::Browser => "browser-surface",
        }
    }
}

/// An `env`/`fenv` tag that names no known context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown environment tag: {0}")]
pub struct UnknownEnvironment(pub String);

impl FromStr for Environment {
    type Err = UnknownEnvironment;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(Environment::Server),
            "client" => Ok(Environment::Client),
            "browser-surface" | "cef" => Ok(Environment::Browser),
            other => Err(UnknownEnvironment(other.to_string())),
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
