//! The federation `Authorization` header.
//!
//! Grammar, shared by the sender and the receiver:
//!
//! ```text
//! Authorization: sign="<base64 signature>", expire="<RFC3339>", origin="<domain>"
//! ```
//!
//! `expire` is the expiry of the signing key and doubles as its lookup key:
//! the receiver asks the origin for the key with exactly that expiry.

use std::fmt;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

use crate::error::{FederationError, FederationResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FederationAuth {
    pub signature: String,
    pub expire: DateTime<Utc>,
    pub origin: String,
}

impl FederationAuth {
    pub fn new(signature: String, expires_at: i64, origin: String) -> FederationResult<Self> {
        let expire = Utc
            .timestamp_opt(expires_at, 0)
            .single()
            .ok_or_else(|| FederationError::Internal(anyhow::anyhow!("key expiry out of range")))?;
        Ok(Self {
            signature,
            expire,
            origin,
        })
    }

    /// Parse a header value. Unknown parameters are ignored; missing or
    /// repeated ones are an authentication failure.
    pub fn parse(value: &str) -> FederationResult<Self> {
        let mut signature = None;
        let mut expire = None;
        let mut origin = None;

        for part in value.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, raw) = part
                .split_once('=')
                .ok_or_else(|| auth_error(format!("malformed parameter {:?}", part)))?;
            let raw = raw.trim();
            let unquoted = raw
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .ok_or_else(|| auth_error(format!("parameter {} must be quoted", key.trim())))?;

            let slot = match key.trim() {
                "sign" => &mut signature,
                "expire" => &mut expire,
                "origin" => &mut origin,
                _ => continue,
            };
            if slot.replace(unquoted.to_string()).is_some() {
                return Err(auth_error(format!("parameter {} repeated", key.trim())));
            }
        }

        let signature = signature
            .filter(|s| !s.is_empty())
            .ok_or_else(|| auth_error("missing sign".to_string()))?;
        let origin = origin
            .filter(|s| !s.is_empty())
            .ok_or_else(|| auth_error("missing origin".to_string()))?;
        let expire = expire.ok_or_else(|| auth_error("missing expire".to_string()))?;
        let expire = parse_expire(&expire)
            .ok_or_else(|| auth_error(format!("unparsable expire {:?}", expire)))?;

        Ok(Self {
            signature,
            expire,
            origin,
        })
    }

    /// Key expiry as unix seconds.
    pub fn expires_at(&self) -> i64 {
        self.expire.timestamp()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expire <= now
    }
}

impl fmt::Display for FederationAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sign=\"{}\", expire=\"{}\", origin=\"{}\"",
            self.signature,
            format_expire(&self.expire),
            self.origin
        )
    }
}

/// Canonical RFC3339 rendering of a key expiry.
pub fn format_expire(expire: &DateTime<Utc>) -> String {
    expire.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Render unix seconds the way headers and key responses carry them.
pub fn format_expires_at(expires_at: i64) -> Option<String> {
    Utc.timestamp_opt(expires_at, 0).single().map(|dt| format_expire(&dt))
}

pub fn parse_expire(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn auth_error(msg: String) -> FederationError {
    FederationError::Authentication(format!("invalid Authorization header: {}", msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_then_parse() {
        let auth = FederationAuth::new("c2lnbmF0dXJl".into(), 1_900_000_000, "a.example".into())
            .unwrap();
        let rendered = auth.to_string();
        assert_eq!(
            rendered,
            r#"sign="c2lnbmF0dXJl", expire="2030-03-17T17:46:40Z", origin="a.example""#
        );
        assert_eq!(FederationAuth::parse(&rendered).unwrap(), auth);
    }

    #[test]
    fn test_parse_tolerates_order_and_unknown_params() {
        let auth = FederationAuth::parse(
            r#"origin="b.example:8443",  version="2", expire="2030-01-01T00:00:00+00:00", sign="AAAA""#,
        )
        .unwrap();
        assert_eq!(auth.origin, "b.example:8443");
        assert_eq!(auth.signature, "AAAA");
        assert_eq!(format_expire(&auth.expire), "2030-01-01T00:00:00Z");
    }

    #[test]
    fn test_parse_rejects_missing_or_broken_params() {
        let cases = [
            "",
            r#"sign="AAAA", expire="2030-01-01T00:00:00Z""#,
            r#"sign="AAAA", origin="a.example""#,
            r#"expire="2030-01-01T00:00:00Z", origin="a.example""#,
            r#"sign=AAAA, expire="2030-01-01T00:00:00Z", origin="a.example""#,
            r#"sign="AAAA", expire="yesterday", origin="a.example""#,
            r#"sign="AAAA", sign="BBBB", expire="2030-01-01T00:00:00Z", origin="a.example""#,
        ];
        for case in cases {
            assert!(
                matches!(
                    FederationAuth::parse(case),
                    Err(FederationError::Authentication(_))
                ),
                "accepted {:?}",
                case
            );
        }
    }

    #[test]
    fn test_expiry_check() {
        let auth = FederationAuth::new("AAAA".into(), 1_000, "a.example".into()).unwrap();
        assert!(auth.is_expired_at(Utc::now()));
        assert_eq!(auth.expires_at(), 1_000);
    }
}
