//! Password authentication
//!
//! One configured username/password pair. Both halves are always compared in
//! full so the time taken does not reveal which one was wrong, or how much of
//! it matched.

use crate::config::Secret;
use crate::{Error, Result};
use tracing::{info, warn};

/// Compare two byte strings without short-circuiting on the first mismatch
///
/// When the lengths differ, `supplied` is compared against itself so the
/// work done still scales with the input, and the result is `false`.
pub fn constant_time_eq(supplied: &[u8], expected: &[u8]) -> bool {
    let lengths_match = supplied.len() == expected.len();
    let reference = if lengths_match { expected } else { supplied };

    let diff = supplied
        .iter()
        .zip(reference)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b));

    lengths_match & (diff == 0)
}

/// The configured login
#[derive(Debug, Clone)]
pub struct Credentials {
    username: String,
    password: Secret,
}

impl Credentials {
    /// Credentials accepting exactly `username` with `password`
    pub fn new(username: impl Into<String>, password: Secret) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }

    /// The accepted username
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Check a password login attempt
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthenticationRejected`] unless both username and
    /// password match.
    pub fn verify(&self, username: &str, password: &str) -> Result<()> {
        let user_ok = constant_time_eq(username.as_bytes(), self.username.as_bytes());
        let pass_ok = constant_time_eq(password.as_bytes(), self.password.expose().as_bytes());

        if user_ok & pass_ok {
            info!(
                event = "auth_success",
                user = %username,
                method = "password",
                "Authentication succeeded"
            );
            Ok(())
        } else {
            warn!(
                event = "auth_failure",
                user = %username,
                method = "password",
                "Authentication failed"
            );
            Err(Error::AuthenticationRejected(format!(
                "invalid credentials for {username}"
            )))
        }
    }
}
