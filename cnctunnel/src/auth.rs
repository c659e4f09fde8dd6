//! Admin UI login.
//!
//! The UI posts the admin username and a base64-encoded password and gets an
//! API key back, which it sends in the `api_key` header on every later call.
//! One key is live at a time; logging in again replaces it.

use std::sync::{Mutex, PoisonError};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("password is not valid base64")]
    MalformedPassword,
    #[error("invalid username or password")]
    InvalidCredentials,
}

pub struct AdminAuth {
    /// Per-process salt so keys from an earlier run never validate.
    nonce: [u8; 16],
    api_key: Mutex<Option<String>>,
}

impl Default for AdminAuth {
    fn default() -> Self {
        Self::new()
    }
}

fn ct_str_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

impl AdminAuth {
    pub fn new() -> Self {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self {
            nonce,
            api_key: Mutex::new(None),
        }
    }

    fn derive_key(&self, admin_password: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.nonce);
        hasher.update(admin_password.as_bytes());
        STANDARD.encode(hasher.finalize())
    }

    /// Check credentials against the configured admin account and issue a key.
    pub fn login(
        &self,
        username: &str,
        password_b64: &str,
        admin_username: &str,
        admin_password: &str,
    ) -> Result<String, AuthError> {
        let decoded = STANDARD
            .decode(password_b64)
            .map_err(|_| AuthError::MalformedPassword)?;
        let password = String::from_utf8(decoded).map_err(|_| AuthError::MalformedPassword)?;

        // Both comparisons always run.
        let user_ok = ct_str_eq(username, admin_username);
        let pass_ok = ct_str_eq(&password, admin_password);
        if !(user_ok & pass_ok) {
            return Err(AuthError::InvalidCredentials);
        }

        let key = self.derive_key(admin_password);
        *self.api_key.lock().unwrap_or_else(PoisonError::into_inner) = Some(key.clone());
        Ok(key)
    }

    pub fn check(&self, key: &str) -> bool {
        self.api_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()
            .is_some_and(|current| ct_str_eq(current, key))
    }

    /// Invalidate the live key.
    pub fn revoke(&self) {
        *self.api_key.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(s: &str) -> String {
        STANDARD.encode(s)
    }

    #[test]
    fn login_issues_checkable_key() {
        let auth = AdminAuth::new();
        let key = auth
            .login("admin", &b64("secret"), "admin", "secret")
            .unwrap();

        assert!(auth.check(&key));
        assert!(!auth.check("not-the-key"));
    }

    #[test]
    fn no_key_before_login() {
        let auth = AdminAuth::new();
        assert!(!auth.check(""));
    }

    #[test]
    fn wrong_credentials_rejected() {
        let auth = AdminAuth::new();
        assert_eq!(
            auth.login("admin", &b64("wrong"), "admin", "secret"),
            Err(AuthError::InvalidCredentials)
        );
        assert_eq!(
            auth.login("root", &b64("secret"), "admin", "secret"),
            Err(AuthError::InvalidCredentials)
        );
    }

    #[test]
    fn malformed_password_rejected() {
        let auth = AdminAuth::new();
        assert_eq!(
            auth.login("admin", "%%%", "admin", "secret"),
            Err(AuthError::MalformedPassword)
        );
    }

    #[test]
    fn keys_differ_between_processes() {
        let a = AdminAuth::new();
        let b = AdminAuth::new();
        let key_a = a.login("admin", &b64("pw"), "admin", "pw").unwrap();
        assert!(!b.check(&key_a));
    }

    #[test]
    fn revoke_invalidates_key() {
        let auth = AdminAuth::new();
        let key = auth.login("admin", &b64("pw"), "admin", "pw").unwrap();
        auth.revoke();
        assert!(!auth.check(&key));
    }
}
