use std::fmt::{Debug, Formatter, Result as FormatterResult};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use url::Url;

use crate::cache::KeyCache;
use crate::claims::{Claims, ClaimsValidator};
use crate::error::Error;
use crate::jwt::{JsonWebToken, SignatureError, JWS_ALG_RS256};
use crate::keys::{KeyFetcher, KeySet};
use crate::{TokenVerifier, DEFAULT_ISSUER_PREFIX, DEFAULT_KEY_URL};

///
/// Verifies ID tokens issued for a single project against the issuer's
/// published signing keys.
///
/// One instance owns one key cache. Instances are safe to call from many
/// threads at once; share one behind an [`Arc`] rather than constructing one
/// per request, so the cache is actually shared.
///
pub struct IdTokenVerifier {
    project_id: String,
    validator: ClaimsValidator,
    fetcher: KeyFetcher,
    cache: KeyCache,
    time_fn: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl IdTokenVerifier {
    /// Creates a verifier for the given project using the default Google
    /// secure-token endpoints and the system clock.
    ///
    /// The key cache starts empty and expired; keys are fetched on first
    /// verification, or eagerly via [`refresh_keys`](Self::refresh_keys).
    pub fn new(project_id: impl Into<String>) -> Result<Self, Error> {
        let project_id = project_id.into();
        let key_url = Url::parse(DEFAULT_KEY_URL).expect("default key URL is valid");
        Ok(IdTokenVerifier {
            validator: ClaimsValidator::new(
                format!("{}{}", DEFAULT_ISSUER_PREFIX, project_id),
                project_id.clone(),
            ),
            project_id,
            fetcher: KeyFetcher::new(key_url)?,
            cache: KeyCache::new(),
            time_fn: Arc::new(Utc::now),
        })
    }

    /// Overrides the URL the signing keys are fetched from.
    pub fn set_key_url(mut self, url: Url) -> Self {
        self.fetcher.set_url(url);
        self
    }

    /// Overrides the issuer prefix; the expected issuer becomes
    /// `prefix + project_id`.
    pub fn set_issuer_prefix(mut self, prefix: &str) -> Self {
        self.validator = ClaimsValidator::new(
            format!("{}{}", prefix, self.project_id),
            self.project_id.clone(),
        );
        self
    }

    /// Overrides the source of the current time. Intended for deterministic
    /// expiry and staleness tests.
    pub fn set_time_fn<F>(mut self, time_fn: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        self.time_fn = Arc::new(time_fn);
        self
    }

    /// The project this verifier accepts tokens for.
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// The exact issuer value tokens must carry.
    pub fn issuer(&self) -> &str {
        self.validator.issuer()
    }

    /// Eagerly refreshes the cached signing keys, subject to the same
    /// double-checked staleness guard the verification path uses: if the
    /// cache is already fresh this is a no-op.
    pub fn refresh_keys(&self) -> Result<(), Error> {
        self.cache.refresh((self.time_fn)(), &self.fetcher)
    }

    /// Verifies a compact-serialized ID token and returns the subject (user
    /// ID) along with all claims it carries.
    pub fn verify(&self, token: &str) -> Result<(String, Claims), Error> {
        if token.is_empty() {
            return Err(Error::EmptyToken);
        }

        let token = JsonWebToken::parse(token)?;

        let now = (self.time_fn)();
        if self.cache.is_stale(now) {
            log::debug!("signing keys are stale");
            // An opportunistic refresh failure is not fatal: whatever keys
            // are cached (possibly none) are still tried, and the next call
            // will observe staleness again.
            if let Err(err) = self.cache.refresh(now, &self.fetcher) {
                log::warn!("failed to refresh signing keys: {}", err);
            }
        }

        let keys = self.cache.keys();
        self.check_signature(&token, &keys)?;

        match token.claims().issue_time() {
            Some(issued_at) if now >= issued_at => {}
            Some(issued_at) => {
                return Err(Error::NotIssuedYet(format!(
                    "token issued at {} (current time is {})",
                    issued_at, now
                )));
            }
            None => {
                return Err(Error::NotIssuedYet("missing issued-at claim".to_string()));
            }
        }

        self.validator.validate(token.claims(), now)?;

        let user_id = token
            .claims()
            .subject()
            .ok_or(Error::MissingSubject)?
            .to_string();
        Ok((user_id, token.into_claims()))
    }

    // Tries the key named by the header hint first, then falls back to an
    // exhaustive pass over the cached keys, so a token whose kid does not
    // match any published key ID can still verify against some key. Only a
    // plain signature mismatch moves the search on; any other failure aborts.
    fn check_signature(&self, token: &JsonWebToken, keys: &KeySet) -> Result<(), Error> {
        let header = token.header();
        if header.alg != JWS_ALG_RS256 {
            return Err(Error::SignatureVerificationFailed(format!(
                "disallowed signature algorithm `{}` (expected `{}`)",
                header.alg, JWS_ALG_RS256
            )));
        }

        let hinted = header.kid.as_deref();
        if let Some(key) = hinted.and_then(|kid| keys.get(kid)) {
            match token.verify_signature(key) {
                Ok(()) => return Ok(()),
                Err(SignatureError::Mismatch) => {}
                Err(err) => return Err(Error::SignatureVerificationFailed(err.to_string())),
            }
        }

        for (kid, key) in keys.iter() {
            if hinted == Some(kid.as_str()) {
                continue;
            }
            match token.verify_signature(key) {
                Ok(()) => return Ok(()),
                Err(SignatureError::Mismatch) => {}
                Err(err) => return Err(Error::SignatureVerificationFailed(err.to_string())),
            }
        }

        Err(Error::SignatureVerificationFailed(
            "no cached key validated the token signature".to_string(),
        ))
    }
}

impl TokenVerifier for IdTokenVerifier {
    fn verify(&self, token: &str) -> Result<(String, Claims), Error> {
        IdTokenVerifier::verify(self, token)
    }
}

impl Debug for IdTokenVerifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatterResult {
        f.debug_struct("IdTokenVerifier")
            .field("project_id", &self.project_id)
            .field("issuer", &self.validator.issuer())
            .field("key_url", &self.fetcher.url().as_str())
            .field("cached_keys", &self.cache.keys().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    // Points the fetcher at a closed port so an attempted refresh fails fast
    // instead of reaching the real key server.
    fn offline_verifier() -> IdTokenVerifier {
        IdTokenVerifier::new("my-project")
            .expect("verifier")
            .set_key_url(Url::parse("http://127.0.0.1:1/").expect("url"))
            .set_time_fn(|| Utc.timestamp_opt(1_454_400_000, 0).single().unwrap())
    }

    fn unsigned_token(header: serde_json::Value, claims: serde_json::Value) -> String {
        format!(
            "{}.{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap()),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap()),
            URL_SAFE_NO_PAD.encode(b"bad_hash"),
        )
    }

    #[test]
    fn empty_token_is_rejected() {
        assert_eq!(offline_verifier().verify(""), Err(Error::EmptyToken));
    }

    #[test]
    fn non_compact_token_is_malformed() {
        match offline_verifier().verify("invalid token") {
            Err(Error::MalformedToken(msg)) => assert!(msg.contains("expected 3")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn disallowed_algorithm_is_rejected_before_key_search() {
        let token = unsigned_token(json!({"alg": "HS256"}), json!({"sub": "user-1"}));
        match offline_verifier().verify(&token) {
            Err(Error::SignatureVerificationFailed(msg)) => {
                assert!(msg.contains("disallowed signature algorithm"))
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn empty_key_set_is_a_verification_failure() {
        // First-ever use with an unreachable key server: the refresh failure
        // is not fatal, and the empty key set correctly fails verification
        // rather than surfacing a network error.
        let token = unsigned_token(json!({"alg": "RS256"}), json!({"sub": "user-1"}));
        match offline_verifier().verify(&token) {
            Err(Error::SignatureVerificationFailed(msg)) => {
                assert!(msg.contains("no cached key"))
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn issuer_is_prefix_plus_project_id() {
        let verifier = IdTokenVerifier::new("my-project").expect("verifier");
        assert_eq!(verifier.issuer(), "https://securetoken.google.com/my-project");
        let custom = verifier.set_issuer_prefix("https://issuer.example.com/");
        assert_eq!(custom.issuer(), "https://issuer.example.com/my-project");
        assert_eq!(custom.project_id(), "my-project");
    }
}
