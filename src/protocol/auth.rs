//! Basic and Digest authentication for publish and play requests.
//!
//! The realm defaults to `EasyDarwin` for compatibility with clients that
//! pin it; deployments can override it. Digest nonces are per-session:
//! generated on the first 401 and re-usable for the life of the session.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use md5::{Digest, Md5};

use crate::error::{Error, Result};

/// Realm presented in challenges unless overridden.
pub const DEFAULT_REALM: &str = "EasyDarwin";

/// Which challenge scheme the server issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Basic,
    Digest,
}

/// Which credential table a request is checked against. ANNOUNCE maps to
/// publishers, DESCRIBE to players.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialRole {
    Publisher,
    Player,
}

/// Credential store and scheme selection.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub scheme: AuthScheme,
    pub realm: String,
    publishers: HashMap<String, String>,
    players: HashMap<String, String>,
}

impl AuthConfig {
    pub fn new(scheme: AuthScheme) -> Self {
        Self {
            scheme,
            realm: DEFAULT_REALM.to_string(),
            publishers: HashMap::new(),
            players: HashMap::new(),
        }
    }

    pub fn realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }

    /// Add credentials allowed to publish (ANNOUNCE/RECORD).
    pub fn publisher(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.publishers.insert(user.into(), password.into());
        self
    }

    /// Add credentials allowed to play (DESCRIBE/PLAY).
    pub fn player(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.players.insert(user.into(), password.into());
        self
    }

    fn password(&self, role: CredentialRole, user: &str) -> Option<&str> {
        let table = match role {
            CredentialRole::Publisher => &self.publishers,
            CredentialRole::Player => &self.players,
        };
        table.get(user).map(String::as_str)
    }
}

/// Validates Authorization headers and issues challenges.
pub struct Authenticator {
    config: AuthConfig,
}

impl Authenticator {
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    pub fn scheme(&self) -> AuthScheme {
        self.config.scheme
    }

    /// Fresh nonce value for a Digest challenge.
    pub fn generate_nonce() -> String {
        let seed: [u8; 16] = rand::random();
        let mut hasher = Md5::new();
        hasher.update(seed);
        hex_digest(hasher)
    }

    /// The `WWW-Authenticate` value for a 401. `nonce` is ignored for Basic.
    pub fn challenge(&self, nonce: &str) -> String {
        match self.config.scheme {
            AuthScheme::Basic => format!(r#"Basic realm="{}""#, self.config.realm),
            AuthScheme::Digest => format!(
                r#"Digest realm="{}", nonce="{}", algorithm="MD5""#,
                self.config.realm, nonce
            ),
        }
    }

    /// Check an Authorization header against the configured credentials.
    pub fn verify(
        &self,
        authorization: &str,
        method: &str,
        nonce: &str,
        role: CredentialRole,
    ) -> Result<()> {
        let authorization = authorization.trim();
        if let Some(encoded) = authorization.strip_prefix("Basic ") {
            return self.verify_basic(encoded.trim(), role);
        }
        if let Some(fields) = authorization.strip_prefix("Digest ") {
            return self.verify_digest(fields, method, nonce, role);
        }
        Err(Error::AuthFailed("unsupported authorization scheme".into()))
    }

    fn verify_basic(&self, encoded: &str, role: CredentialRole) -> Result<()> {
        let decoded = BASE64
            .decode(encoded)
            .map_err(|_| Error::AuthFailed("base64 decode failed".into()))?;
        let decoded = String::from_utf8_lossy(&decoded);
        let (user, password) = decoded
            .split_once(':')
            .ok_or_else(|| Error::AuthFailed("malformed basic credentials".into()))?;
        match self.config.password(role, user) {
            Some(expected) if expected == password => Ok(()),
            _ => Err(Error::AuthFailed(format!("bad credentials for {user:?}"))),
        }
    }

    fn verify_digest(
        &self,
        fields: &str,
        method: &str,
        nonce: &str,
        role: CredentialRole,
    ) -> Result<()> {
        let fields = parse_digest_fields(fields);
        let user = fields
            .get("username")
            .ok_or_else(|| Error::AuthFailed("digest missing username".into()))?;
        let uri = fields
            .get("uri")
            .ok_or_else(|| Error::AuthFailed("digest missing uri".into()))?;
        let response = fields
            .get("response")
            .ok_or_else(|| Error::AuthFailed("digest missing response".into()))?;
        if nonce.is_empty() || fields.get("nonce").map(String::as_str) != Some(nonce) {
            return Err(Error::AuthFailed("stale or missing nonce".into()));
        }
        let password = self
            .config
            .password(role, user)
            .ok_or_else(|| Error::AuthFailed(format!("unknown user {user:?}")))?;

        let expected = digest_response(user, &self.config.realm, password, method, uri, nonce);
        if expected == *response {
            Ok(())
        } else {
            Err(Error::AuthFailed(format!("bad digest for {user:?}")))
        }
    }
}

/// RFC 2617 MD5 digest: `MD5(HA1:nonce:HA2)`.
pub fn digest_response(
    user: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
) -> String {
    let ha1 = md5_hex(&format!("{user}:{realm}:{password}"));
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    md5_hex(&format!("{ha1}:{nonce}:{ha2}"))
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex_digest(hasher)
}

fn hex_digest(hasher: Md5) -> String {
    hasher
        .finalize()
        .iter()
        .fold(String::with_capacity(32), |mut out, byte| {
            use std::fmt::Write;
            let _ = write!(out, "{byte:02x}");
            out
        })
}

/// Parse `key="value", key=value, ...` pairs. Values are not expected to
/// contain commas; RTSP clients in practice keep them clean.
fn parse_digest_fields(fields: &str) -> HashMap<String, String> {
    fields
        .split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((
                key.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_string(),
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_auth() -> Authenticator {
        Authenticator::new(
            AuthConfig::new(AuthScheme::Digest)
                .publisher("pub", "pubpass")
                .player("viewer", "viewpass"),
        )
    }

    fn basic_auth() -> Authenticator {
        Authenticator::new(AuthConfig::new(AuthScheme::Basic).player("viewer", "viewpass"))
    }

    fn digest_header(user: &str, password: &str, method: &str, uri: &str, nonce: &str) -> String {
        let response = digest_response(user, DEFAULT_REALM, password, method, uri, nonce);
        format!(
            r#"Digest username="{user}", realm="{DEFAULT_REALM}", nonce="{nonce}", uri="{uri}", response="{response}""#
        )
    }

    #[test]
    fn test_basic_accepts_good_credentials() {
        let header = format!("Basic {}", BASE64.encode("viewer:viewpass"));
        assert!(basic_auth()
            .verify(&header, "DESCRIBE", "", CredentialRole::Player)
            .is_ok());
    }

    #[test]
    fn test_basic_rejects_bad_password() {
        let header = format!("Basic {}", BASE64.encode("viewer:wrong"));
        assert!(basic_auth()
            .verify(&header, "DESCRIBE", "", CredentialRole::Player)
            .is_err());
    }

    #[test]
    fn test_basic_role_separation() {
        // player credentials must not authorize publishing
        let header = format!("Basic {}", BASE64.encode("viewer:viewpass"));
        assert!(basic_auth()
            .verify(&header, "ANNOUNCE", "", CredentialRole::Publisher)
            .is_err());
    }

    #[test]
    fn test_digest_accepts_correct_response() {
        let auth = digest_auth();
        let nonce = Authenticator::generate_nonce();
        let header = digest_header("viewer", "viewpass", "DESCRIBE", "rtsp://h/live/a", &nonce);
        assert!(auth
            .verify(&header, "DESCRIBE", &nonce, CredentialRole::Player)
            .is_ok());
    }

    #[test]
    fn test_digest_nonce_reusable_within_session() {
        let auth = digest_auth();
        let nonce = Authenticator::generate_nonce();
        let header = digest_header("viewer", "viewpass", "DESCRIBE", "rtsp://h/live/a", &nonce);
        for _ in 0..2 {
            assert!(auth
                .verify(&header, "DESCRIBE", &nonce, CredentialRole::Player)
                .is_ok());
        }
    }

    #[test]
    fn test_digest_rejects_wrong_nonce() {
        let auth = digest_auth();
        let header = digest_header("viewer", "viewpass", "DESCRIBE", "rtsp://h/live/a", "stale");
        assert!(auth
            .verify(&header, "DESCRIBE", "expected", CredentialRole::Player)
            .is_err());
    }

    #[test]
    fn test_digest_rejects_wrong_password() {
        let auth = digest_auth();
        let nonce = Authenticator::generate_nonce();
        let header = digest_header("viewer", "wrong", "DESCRIBE", "rtsp://h/live/a", &nonce);
        assert!(auth
            .verify(&header, "DESCRIBE", &nonce, CredentialRole::Player)
            .is_err());
    }

    #[test]
    fn test_digest_method_is_bound() {
        let auth = digest_auth();
        let nonce = Authenticator::generate_nonce();
        let header = digest_header("viewer", "viewpass", "DESCRIBE", "rtsp://h/live/a", &nonce);
        assert!(auth
            .verify(&header, "SETUP", &nonce, CredentialRole::Player)
            .is_err());
    }

    #[test]
    fn test_challenge_formats() {
        let auth = digest_auth();
        let challenge = auth.challenge("abc123");
        assert_eq!(
            challenge,
            r#"Digest realm="EasyDarwin", nonce="abc123", algorithm="MD5""#
        );
        assert_eq!(basic_auth().challenge(""), r#"Basic realm="EasyDarwin""#);
    }

    #[test]
    fn test_custom_realm() {
        let auth = Authenticator::new(
            AuthConfig::new(AuthScheme::Basic)
                .realm("relay")
                .player("u", "p"),
        );
        assert_eq!(auth.challenge(""), r#"Basic realm="relay""#);
    }

    #[test]
    fn test_nonce_is_hex_and_unique() {
        let a = Authenticator::generate_nonce();
        let b = Authenticator::generate_nonce();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_unsupported_scheme_rejected() {
        assert!(basic_auth()
            .verify("Bearer token", "DESCRIBE", "", CredentialRole::Player)
            .is_err());
    }
}
