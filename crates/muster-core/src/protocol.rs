//! Enrollment wire protocol.
//!
//! Agents speak a single-record text protocol over the TLS connection. The
//! request is one utf-8 line of whitespace-separated tokens:
//!
//! ```text
//! OSSEC A:'<name>' [G:'<group>'] [K:'<key_hash>'] [P:'<password>']
//! ```
//!
//! `A:` is required; the other tokens are optional. The success response
//! hands the agent its identity and raw key in one record:
//!
//! ```text
//! OSSEC K:'<id> <name> <ip> <rawkey>'
//! ```
//!
//! A rejected request receives a reason line starting with `ERROR: `
//! followed by the generic [`ERROR_UNABLE_TO_ADD`] line.

use thiserror::Error;

/// Request header token.
const HEADER: &str = "OSSEC";

/// Generic rejection line sent after the specific reason.
pub const ERROR_UNABLE_TO_ADD: &str = "ERROR: Unable to add agent";

/// Maximum accepted request size in bytes. Anything larger is dropped
/// before parsing.
pub const MAX_REQUEST_SIZE: usize = 65_536 + 4_096;

/// Errors from parsing an enrollment request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The record did not start with the `OSSEC` header.
    #[error("invalid request header")]
    MissingHeader,

    /// No `A:'<name>'` token was present.
    #[error("missing agent name")]
    MissingName,

    /// A token value was not wrapped in single quotes.
    #[error("malformed token: {token}")]
    MalformedToken {
        /// The offending token.
        token: String,
    },

    /// An unrecognized token appeared in the record.
    #[error("unknown token: {token}")]
    UnknownToken {
        /// The offending token.
        token: String,
    },

    /// The agent name failed validation.
    #[error("invalid agent name: {name}")]
    InvalidName {
        /// The rejected name.
        name: String,
    },
}

/// A parsed enrollment request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentRequest {
    /// Requested agent name.
    pub name: String,
    /// Centralized group to assign, if any.
    pub group: Option<String>,
    /// SHA-256 digest of the key the agent already holds, if re-enrolling.
    pub key_hash: Option<String>,
    /// Enrollment password, if the server demands one.
    pub password: Option<String>,
}

impl EnrollmentRequest {
    /// Parses a request record.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] when the header, the required `A:` token,
    /// or any token shape is wrong. Validation beyond shape (name charset
    /// and length) is also enforced here so that dispatch never sees an
    /// unusable name.
    pub fn parse(record: &str) -> Result<Self, ProtocolError> {
        let mut tokens = record.split_whitespace();
        if tokens.next() != Some(HEADER) {
            return Err(ProtocolError::MissingHeader);
        }

        let mut name = None;
        let mut group = None;
        let mut key_hash = None;
        let mut password = None;

        for token in tokens {
            if let Some(value) = quoted_value(token, "A:") {
                name = Some(value?.to_string());
            } else if let Some(value) = quoted_value(token, "G:") {
                group = Some(value?.to_string());
            } else if let Some(value) = quoted_value(token, "K:") {
                key_hash = Some(value?.to_string());
            } else if let Some(value) = quoted_value(token, "P:") {
                password = Some(value?.to_string());
            } else {
                return Err(ProtocolError::UnknownToken {
                    token: token.to_string(),
                });
            }
        }

        let name = name.ok_or(ProtocolError::MissingName)?;
        validate_name(&name)?;

        Ok(Self {
            name,
            group,
            key_hash,
            password,
        })
    }

    /// Renders the request back to its wire form. `Parse(Format(req))`
    /// yields `req` for any well-formed request.
    #[must_use]
    pub fn format(&self) -> String {
        let mut out = format!("{HEADER} A:'{}'", self.name);
        if let Some(group) = &self.group {
            out.push_str(&format!(" G:'{group}'"));
        }
        if let Some(key_hash) = &self.key_hash {
            out.push_str(&format!(" K:'{key_hash}'"));
        }
        if let Some(password) = &self.password {
            out.push_str(&format!(" P:'{password}'"));
        }
        out
    }
}

/// Formats the success response carrying the minted identity.
#[must_use]
pub fn format_key_response(id: &str, name: &str, ip: &str, key: &str) -> String {
    format!("{HEADER} K:'{id} {name} {ip} {key}'")
}

/// Formats a rejection reason line.
#[must_use]
pub fn format_error(reason: &str) -> String {
    format!("ERROR: {reason}")
}

/// Extracts the `'<value>'` payload of a token with the given prefix.
/// Returns `None` when the prefix does not match, `Some(Err(..))` when it
/// matches but the quoting is broken.
fn quoted_value<'a>(
    token: &'a str,
    prefix: &str,
) -> Option<Result<&'a str, ProtocolError>> {
    let rest = token.strip_prefix(prefix)?;
    let value = rest
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .filter(|v| !v.is_empty());
    Some(value.ok_or_else(|| ProtocolError::MalformedToken {
        token: token.to_string(),
    }))
}

/// Agent names are at least two characters of `[A-Za-z0-9_.-]`.
fn validate_name(name: &str) -> Result<(), ProtocolError> {
    let valid = name.len() >= 2
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(ProtocolError::InvalidName {
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_request() {
        let req = EnrollmentRequest::parse("OSSEC A:'web01'").unwrap();
        assert_eq!(req.name, "web01");
        assert_eq!(req.group, None);
        assert_eq!(req.key_hash, None);
        assert_eq!(req.password, None);
    }

    #[test]
    fn parses_full_request() {
        let req =
            EnrollmentRequest::parse("OSSEC A:'web01' G:'dmz' K:'abc123' P:'hunter2'").unwrap();
        assert_eq!(req.name, "web01");
        assert_eq!(req.group.as_deref(), Some("dmz"));
        assert_eq!(req.key_hash.as_deref(), Some("abc123"));
        assert_eq!(req.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn format_parse_round_trip() {
        let req = EnrollmentRequest {
            name: "db-01.prod".to_string(),
            group: Some("databases".to_string()),
            key_hash: Some("f".repeat(64)),
            password: Some("hunter2".to_string()),
        };
        assert_eq!(EnrollmentRequest::parse(&req.format()).unwrap(), req);
    }

    #[test]
    fn rejects_missing_header() {
        assert_eq!(
            EnrollmentRequest::parse("HELLO A:'web01'"),
            Err(ProtocolError::MissingHeader)
        );
    }

    #[test]
    fn rejects_missing_name() {
        assert_eq!(
            EnrollmentRequest::parse("OSSEC G:'dmz'"),
            Err(ProtocolError::MissingName)
        );
    }

    #[test]
    fn rejects_unquoted_token() {
        assert!(matches!(
            EnrollmentRequest::parse("OSSEC A:web01"),
            Err(ProtocolError::MalformedToken { .. })
        ));
    }

    #[test]
    fn rejects_empty_name_token() {
        assert!(matches!(
            EnrollmentRequest::parse("OSSEC A:''"),
            Err(ProtocolError::MalformedToken { .. })
        ));
    }

    #[test]
    fn rejects_unknown_token() {
        assert!(matches!(
            EnrollmentRequest::parse("OSSEC A:'web01' X:'huh'"),
            Err(ProtocolError::UnknownToken { .. })
        ));
    }

    #[test]
    fn rejects_short_or_bad_names() {
        assert!(matches!(
            EnrollmentRequest::parse("OSSEC A:'w'"),
            Err(ProtocolError::InvalidName { .. })
        ));
        assert!(
            matches!(
                EnrollmentRequest::parse("OSSEC A:'web 01'"),
                Err(ProtocolError::MalformedToken { .. })
            ),
            "a space splits the token, breaking its quoting"
        );
        assert!(matches!(
            EnrollmentRequest::parse("OSSEC A:'web/01'"),
            Err(ProtocolError::InvalidName { .. })
        ));
    }

    #[test]
    fn key_response_shape() {
        let response = format_key_response("001", "web01", "203.0.113.7", "ab12");
        assert_eq!(response, "OSSEC K:'001 web01 203.0.113.7 ab12'");
    }

    #[test]
    fn error_lines() {
        assert_eq!(format_error("Invalid password"), "ERROR: Invalid password");
        assert_eq!(ERROR_UNABLE_TO_ADD, "ERROR: Unable to add agent");
    }
}
