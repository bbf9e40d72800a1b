use serde::Deserialize;
use std::fmt;

/// Registry credential read from config. Formatting only reveals the length, the value is
/// reachable through [`SecretString::expose_secret`] when building an `Authorization` header.
#[derive(Deserialize, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    #[cfg(test)]
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose_secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<REDACTED, length {}>", self.0.len())
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_is_redacted() {
        let secret = SecretString::new("hunter2");
        assert_eq!(secret.to_string(), "<REDACTED, length 7>");
        assert_eq!(format!("{:?}", secret), "<REDACTED, length 7>");
        assert_eq!(secret.expose_secret(), "hunter2");
    }

    #[test]
    fn test_secret_deserializes_from_plain_string() {
        let secret: SecretString = serde_yaml_ng::from_str("\"s3cr3t\"").unwrap();
        assert_eq!(secret.expose_secret(), "s3cr3t");
    }
}
