use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

///
/// Claims carried in a verified ID token, keyed by claim name.
///
/// The payload is kept as the raw JSON object so that provider-specific
/// claims survive round trips; the standard claims used during validation
/// are exposed through typed accessors.
///
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Claims(Map<String, Value>);

impl Claims {
    /// Returns the raw value of the named claim, if present.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// The `sub` claim, when present and a string.
    pub fn subject(&self) -> Option<&str> {
        self.0.get("sub").and_then(Value::as_str)
    }

    /// The `iss` claim, when present and a string.
    pub fn issuer(&self) -> Option<&str> {
        self.0.get("iss").and_then(Value::as_str)
    }

    /// The `aud` claim. A bare string and an array of strings are both
    /// accepted serializations; either yields the flattened list.
    pub fn audiences(&self) -> Option<Vec<&str>> {
        match self.0.get("aud") {
            Some(Value::String(aud)) => Some(vec![aud.as_str()]),
            Some(Value::Array(auds)) => Some(auds.iter().filter_map(Value::as_str).collect()),
            _ => None,
        }
    }

    /// The `exp` claim as an instant, when present and numeric.
    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.0.get("exp").and_then(seconds_to_utc)
    }

    /// The `iat` claim as an instant, when present and numeric.
    pub fn issue_time(&self) -> Option<DateTime<Utc>> {
        self.0.get("iat").and_then(seconds_to_utc)
    }

    /// Number of claims present.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no claims are present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over all claims in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

// Claim timestamps are numeric UNIX seconds; some issuers emit them as
// floating point.
fn seconds_to_utc(value: &Value) -> Option<DateTime<Utc>> {
    let secs = value.as_i64().or_else(|| value.as_f64().map(|s| s as i64))?;
    Utc.timestamp_opt(secs, 0).single()
}

/// Composite claim error produced by [`ClaimsValidator`]; translated into the
/// public error kinds by the verifier.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub(crate) enum ClaimsError {
    #[error("{0}")]
    Expired(String),
    #[error("{0}")]
    InvalidIssuer(String),
    #[error("{0}")]
    InvalidAudience(String),
}

/// Validates the standard expiry/issuer/audience claims against the
/// configured project identity.
#[derive(Clone, Debug)]
pub(crate) struct ClaimsValidator {
    issuer: String,
    audience: String,
}

impl ClaimsValidator {
    pub fn new(issuer: String, audience: String) -> Self {
        ClaimsValidator { issuer, audience }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Runs the checks in a fixed order; the first violated rule determines
    /// the reported error: expired, then invalid issuer, then invalid
    /// audience. Expiry is only checked when the claim is present; a missing
    /// issuer or audience claim is a mismatch.
    pub fn validate(&self, claims: &Claims, now: DateTime<Utc>) -> Result<(), ClaimsError> {
        if let Some(expiration) = claims.expiration() {
            if now >= expiration {
                return Err(ClaimsError::Expired(format!(
                    "token expired at {} (current time is {})",
                    expiration, now
                )));
            }
        }

        match claims.issuer() {
            Some(issuer) if issuer == self.issuer => {}
            Some(issuer) => {
                return Err(ClaimsError::InvalidIssuer(format!(
                    "expected `{}` (found `{}`)",
                    self.issuer, issuer
                )));
            }
            None => {
                return Err(ClaimsError::InvalidIssuer(
                    "missing issuer claim".to_string(),
                ));
            }
        }

        match claims.audiences() {
            Some(audiences) if audiences.iter().any(|aud| *aud == self.audience) => {}
            Some(audiences) => {
                return Err(ClaimsError::InvalidAudience(format!(
                    "must contain `{}` (found audiences: {})",
                    self.audience,
                    audiences
                        .iter()
                        .map(|aud| format!("`{}`", aud))
                        .collect::<Vec<_>>()
                        .join(", ")
                )));
            }
            None => {
                return Err(ClaimsError::InvalidAudience(
                    "missing audiences claim".to_string(),
                ));
            }
        }

        Ok(())
    }
}
