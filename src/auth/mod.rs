//! Authentication and authorization collaborator
//!
//! The broker core only sees the `Authenticator` trait: one async call to
//! check CONNECT credentials and one synchronous ACL check per topic access.
//! `check_acl` stays synchronous so it can run inside store validators and
//! on the fan-out path without awaiting.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

use crate::acl::AclRules;
use crate::config::{AclConfig, AuthConfig};
use crate::protocol::ProtocolVersion;

pub use crate::acl::AclAction;


/// Credentials presented in CONNECT
#[derive(Debug, Clone)]
pub struct AuthOptions {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub protocol_version: ProtocolVersion,
}

/// Authorization failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Credentials rejected
    AuthDenied,
    /// Topic access rejected
    AclDenied,
    /// The provider itself failed
    Internal(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthDenied => write!(f, "authentication denied"),
            Self::AclDenied => write!(f, "access denied"),
            Self::Internal(msg) => write!(f, "auth provider error: {}", msg),
        }
    }
}

impl std::error::Error for AuthError {}

/// Pluggable authentication and ACL provider
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verify CONNECT credentials
    async fn authenticate(&self, options: &AuthOptions) -> Result<(), AuthError>;

    /// Check whether a client may read (subscribe/receive) or write (publish) a topic
    fn check_acl(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic: &str,
        action: AclAction,
    ) -> Result<(), AuthError>;
}

/// Accepts every client and every topic
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn authenticate(&self, _options: &AuthOptions) -> Result<(), AuthError> {
        Ok(())
    }

    fn check_acl(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _topic: &str,
        _action: AclAction,
    ) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Users and ACL rules taken from the configuration file
pub struct StaticAuthenticator {
    /// Whether credentials are checked
    enabled: bool,
    /// User credentials map (username -> UserEntry)
    users: HashMap<String, UserEntry>,
    acl: AclRules,
}

/// Internal user entry
struct UserEntry {
    /// Password (plaintext)
    password: String,
    /// ACL role (if any)
    role: Option<String>,
}

impl StaticAuthenticator {
    pub fn new(auth: &AuthConfig, acl: &AclConfig) -> Self {
        let users = auth
            .users
            .iter()
            .map(|user| {
                (
                    user.username.clone(),
                    UserEntry {
                        password: user.password.clone(),
                        role: user.role.clone(),
                    },
                )
            })
            .collect();

        Self {
            enabled: auth.enabled,
            users,
            acl: AclRules::new(acl),
        }
    }

    /// Get the ACL role for a username
    pub fn user_role(&self, username: &str) -> Option<&str> {
        self.users.get(username).and_then(|u| u.role.as_deref())
    }

    fn verify_password(password: Option<&[u8]>, stored: &str) -> bool {
        match password.map(std::str::from_utf8) {
            Some(Ok(pwd)) => pwd == stored,
            _ => false,
        }
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, options: &AuthOptions) -> Result<(), AuthError> {
        if !self.enabled {
            return Ok(());
        }

        let Some(username) = options.username.as_deref() else {
            // Anonymous access is decided by the broker before calling us
            return Ok(());
        };

        match self.users.get(username) {
            Some(user) if Self::verify_password(options.password.as_deref(), &user.password) => {
                Ok(())
            }
            _ => Err(AuthError::AuthDenied),
        }
    }

    fn check_acl(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic: &str,
        action: AclAction,
    ) -> Result<(), AuthError> {
        let role = username.and_then(|u| self.user_role(u));
        if self.acl.allows(client_id, username, role, topic, action) {
            Ok(())
        } else {
            Err(AuthError::AclDenied)
        }
    }
}
