//! Authentication credentials.
//!
//! Credentials are consumed exactly once, during the start/start-ok exchange,
//! and dropped immediately afterwards — they never outlive the handshake.

/// Produces an authentication response for the peer's offered mechanisms.
pub trait Credentials: Send {
    /// Pick a mechanism from the peer's space-separated list and produce the
    /// opaque response bytes for it.
    ///
    /// Returns `None` when no offered mechanism is usable with these
    /// credentials, which aborts the handshake.
    fn response_for(&self, mechanisms: &str) -> Option<(String, Vec<u8>)>;
}

/// Username/password credentials for the PLAIN mechanism.
pub struct PlainCredentials {
    username: String,
    password: String,
}

impl PlainCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// The protocol's conventional default account.
    pub fn guest() -> Self {
        Self::new("guest", "guest")
    }
}

impl Default for PlainCredentials {
    fn default() -> Self {
        Self::guest()
    }
}

// The password must not leak through debug logging.
impl std::fmt::Debug for PlainCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials for PlainCredentials {
    fn response_for(&self, mechanisms: &str) -> Option<(String, Vec<u8>)> {
        if !mechanisms.split_whitespace().any(|m| m == "PLAIN") {
            return None;
        }
        let response = format!("\0{}\0{}", self.username, self.password).into_bytes();
        Some(("PLAIN".to_string(), response))
    }
}
