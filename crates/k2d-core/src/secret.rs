//! Credential values that stay out of logs.
//!
//! A secret is written in the config file either literally or as an
//! `env:VAR_NAME` reference that is resolved when the value is used.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

const ENV_PREFIX: &str = "env:";
const REDACTED: &str = "<redacted>";

/// A credential that is redacted in `Debug` and `Serialize` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wrap a literal value or an `env:` reference.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Name of the environment variable this secret points at, if any.
    pub fn env_var(&self) -> Option<&str> {
        self.0.strip_prefix(ENV_PREFIX).map(str::trim)
    }

    /// Resolve to the plaintext credential.
    pub fn expose(&self) -> crate::Result<String> {
        match self.env_var() {
            Some(var) => std::env::var(var).map_err(|_| {
                crate::Error::Config(format!("environment variable {} is not set", var))
            }),
            None => Ok(self.0.clone()),
        }
    }

    /// True when the configured value is empty.
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.env_var() {
            Some(var) => write!(f, "Secret(env:{})", var),
            None => write!(f, "Secret({})", REDACTED),
        }
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.env_var().is_some() {
            serializer.serialize_str(&self.0)
        } else {
            serializer.serialize_str(REDACTED)
        }
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Secret)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_secret_is_redacted() {
        let secret = Secret::new("Endpoint=sb://ns/;SharedAccessKey=abc");
        assert_eq!(format!("{:?}", secret), "Secret(<redacted>)");
        assert_eq!(
            secret.expose().unwrap(),
            "Endpoint=sb://ns/;SharedAccessKey=abc"
        );
        assert_eq!(serde_json::to_string(&secret).unwrap(), "\"<redacted>\"");
    }

    #[test]
    fn test_env_secret_resolves() {
        std::env::set_var("K2D_TEST_SECRET_RESOLVES", "s3cr3t");
        let secret = Secret::new("env:K2D_TEST_SECRET_RESOLVES");
        assert_eq!(secret.env_var(), Some("K2D_TEST_SECRET_RESOLVES"));
        assert_eq!(secret.expose().unwrap(), "s3cr3t");
        assert_eq!(
            format!("{:?}", secret),
            "Secret(env:K2D_TEST_SECRET_RESOLVES)"
        );
    }

    #[test]
    fn test_missing_env_secret_is_config_error() {
        let secret = Secret::new("env:K2D_TEST_SECRET_DEFINITELY_UNSET");
        let err = secret.expose().unwrap_err();
        assert!(err.to_string().contains("K2D_TEST_SECRET_DEFINITELY_UNSET"));
    }
}
