//! Message types for the broker protocol
//!
//! The exchange is a single round-trip over a fresh TCP connection:
//!
//! 1. The gateway sends one JSON object terminated by a newline:
//!    `{"type":"auth","username":"...","password":"..."}`
//! 2. The backend either writes exactly [`TOKEN_LEN`] bytes (the token) and
//!    closes the connection, or closes it without a token.
//!
//! Any other response length is a failure. There is no version negotiation.

use std::fmt;

use serde::Serialize;
use zeroize::Zeroizing;

use crate::error::BrokerError;

/// Maximum username length in bytes.
pub const MAX_USERNAME_LEN: usize = 32;

/// Maximum password length in bytes.
pub const MAX_PASSWORD_LEN: usize = 64;

/// Size of the per-user token returned on success.
pub const TOKEN_LEN: usize = 64;

/// A username/password pair that passed local validation
pub struct Credentials {
    username: String,
    password: Zeroizing<String>,
}

impl Credentials {
    /// Validate and capture a credential pair.
    ///
    /// Both fields must be non-empty and within the protocol bounds;
    /// anything else is rejected here, before the backend is contacted.
    pub fn new(username: &str, password: &str) -> Result<Self, BrokerError> {
        if username.is_empty() || username.len() > MAX_USERNAME_LEN {
            return Err(BrokerError::InvalidUsername {
                len: username.len(),
                max: MAX_USERNAME_LEN,
            });
        }
        if password.is_empty() || password.len() > MAX_PASSWORD_LEN {
            return Err(BrokerError::InvalidPassword {
                len: password.len(),
                max: MAX_PASSWORD_LEN,
            });
        }

        Ok(Self {
            username: username.to_string(),
            password: Zeroizing::new(password.to_string()),
        })
    }

    /// The validated username
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Build the wire request for these credentials
    pub fn request(&self) -> BrokerRequest<'_> {
        BrokerRequest::Auth {
            username: &self.username,
            password: &self.password,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Requests understood by the backend
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BrokerRequest<'a> {
    /// Exchange a username and password for a token
    Auth {
        username: &'a str,
        password: &'a str,
    },
}

impl BrokerRequest<'_> {
    /// Encode as a newline-terminated JSON line.
    ///
    /// The buffer holds the password in clear and is wiped on drop.
    pub fn encode_line(&self) -> Result<Zeroizing<Vec<u8>>, BrokerError> {
        let mut line = Zeroizing::new(serde_json::to_vec(self)?);
        line.push(b'\n');
        Ok(line)
    }
}

/// Opaque per-user token issued by the backend
///
/// Only ever built from a response of exactly [`TOKEN_LEN`] bytes. The
/// buffer is zeroed when the token is dropped.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(Zeroizing<[u8; TOKEN_LEN]>);

impl Token {
    /// Parse a backend response into a token
    pub fn from_response(response: &[u8]) -> Result<Self, BrokerError> {
        if response.len() != TOKEN_LEN {
            return Err(BrokerError::MalformedResponse {
                len: response.len(),
                expected: TOKEN_LEN,
            });
        }

        let mut bytes = Zeroizing::new([0u8; TOKEN_LEN]);
        bytes.copy_from_slice(response);
        Ok(Self(bytes))
    }

    /// Raw token bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }

    /// The token as a process argument
    #[cfg(unix)]
    pub fn as_os_str(&self) -> &std::ffi::OsStr {
        use std::os::unix::ffi::OsStrExt;
        std::ffi::OsStr::from_bytes(self.as_bytes())
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_bounds() {
        assert!(Credentials::new("alice", "hunter22").is_ok());
        assert!(Credentials::new(&"u".repeat(32), &"p".repeat(64)).is_ok());

        assert!(matches!(
            Credentials::new("", "pw"),
            Err(BrokerError::InvalidUsername { len: 0, .. })
        ));
        assert!(matches!(
            Credentials::new(&"u".repeat(33), "pw"),
            Err(BrokerError::InvalidUsername { len: 33, .. })
        ));
        assert!(matches!(
            Credentials::new("alice", ""),
            Err(BrokerError::InvalidPassword { len: 0, .. })
        ));
        assert!(matches!(
            Credentials::new("alice", &"p".repeat(65)),
            Err(BrokerError::InvalidPassword { len: 65, .. })
        ));
    }

    #[test]
    fn test_request_wire_format() {
        let creds = Credentials::new("alice", "s3cr\"t").unwrap();
        let line = creds.request().encode_line().unwrap();

        assert_eq!(line.last(), Some(&b'\n'));
        let value: serde_json::Value = serde_json::from_slice(&line[..line.len() - 1]).unwrap();
        assert_eq!(value["type"], "auth");
        assert_eq!(value["username"], "alice");
        assert_eq!(value["password"], "s3cr\"t");
        assert_eq!(value.as_object().unwrap().len(), 3);
    }

    #[test]
    fn test_token_requires_exact_length() {
        let token = Token::from_response(&[b'k'; TOKEN_LEN]).unwrap();
        assert_eq!(token.as_bytes().len(), TOKEN_LEN);

        assert!(matches!(
            Token::from_response(&[b'k'; TOKEN_LEN - 1]),
            Err(BrokerError::MalformedResponse { len: 63, .. })
        ));
        assert!(matches!(
            Token::from_response(&[b'k'; TOKEN_LEN + 1]),
            Err(BrokerError::MalformedResponse { len: 65, .. })
        ));
        assert!(Token::from_response(&[]).is_err());
    }

    #[test]
    fn test_secrets_are_redacted_in_debug() {
        let creds = Credentials::new("alice", "topsecret").unwrap();
        let token = Token::from_response(&[b'z'; TOKEN_LEN]).unwrap();

        assert!(!format!("{:?}", creds).contains("topsecret"));
        assert!(!format!("{:?}", token).contains('z'));
    }
}
