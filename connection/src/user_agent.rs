//! User agent validation for the bitcoin p2p protocol.
//!
//! Bitcoin Core and most other implementations use the `/name:version/`
//! convention for user agent strings in version messages; this module
//! enforces it for the agent the crawler advertises about itself.

use std::fmt;

/// Errors that can occur during user agent validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAgentError {
    /// The user agent format is invalid (must be `/name:version/`).
    InvalidFormat,
    /// The name component is missing or empty.
    MissingName,
    /// The version component is missing or empty.
    MissingVersion,
}

impl fmt::Display for UserAgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserAgentError::InvalidFormat => {
                write!(f, "User agent must follow format '/name:version/'")
            }
            UserAgentError::MissingName => {
                write!(f, "User agent name component cannot be empty")
            }
            UserAgentError::MissingVersion => {
                write!(f, "User agent version component cannot be empty")
            }
        }
    }
}

impl std::error::Error for UserAgentError {}

/// A validated Bitcoin Core-style user agent string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAgent(String);

impl UserAgent {
    /// Validate and wrap a user agent string.
    ///
    /// # Example
    ///
    /// ```
    /// use peer_census_connection::UserAgent;
    ///
    /// assert!(UserAgent::new("/peer-census:0.1.0/".to_string()).is_ok());
    /// assert!(UserAgent::new("peer-census 0.1.0".to_string()).is_err());
    /// ```
    pub fn new(user_agent: String) -> Result<Self, UserAgentError> {
        // Peel the enclosing slashes, then split on the single colon
        // separating name from version.
        let body = user_agent
            .strip_prefix('/')
            .and_then(|rest| rest.strip_suffix('/'))
            .ok_or(UserAgentError::InvalidFormat)?;

        let (name, version) = body.split_once(':').ok_or(UserAgentError::InvalidFormat)?;
        if version.contains(':') {
            return Err(UserAgentError::InvalidFormat);
        }
        if name.is_empty() {
            return Err(UserAgentError::MissingName);
        }
        if version.is_empty() {
            return Err(UserAgentError::MissingVersion);
        }

        Ok(UserAgent(user_agent))
    }

    /// Build a user agent from name and version components.
    pub fn from_name_version(name: &str, version: &str) -> Self {
        UserAgent(format!("/{name}:{version}/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
