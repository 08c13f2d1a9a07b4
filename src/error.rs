use crate::claims::ClaimsError;
use crate::jwt::ParseError;

///
/// Error verifying an ID token or refreshing the signing keys backing it.
///
/// Every failure the crate can produce is one of these kinds; errors from the
/// underlying JWS, crypto, and HTTP layers are translated before they reach
/// the caller. Kinds prefixed with `Key` describe problems talking to the key
/// server and allow callers to distinguish "your token is bad" from "our key
/// cache could not refresh".
///
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The token string was empty.
    #[error("empty authorization token")]
    EmptyToken,
    /// The token is not a valid compact JWS serialization.
    #[error("malformed token: {0}")]
    MalformedToken(String),
    /// The key server response carried no usable `max-age` directive in its
    /// `Cache-Control` header. Freshness information is mandatory because it
    /// bounds how long this process will trust the returned keys.
    #[error("cache-control header doesn't contain a max-age directive")]
    MissingMaxAge,
    /// Network, transport, or JSON-decode failure while fetching keys.
    #[error("failed to fetch signing keys: {0}")]
    KeyFetchFailed(String),
    /// A fetched key could not be parsed as an RSA public key. The whole
    /// fetch fails and the previously cached keys remain in use.
    #[error("failed to parse signing key: {0}")]
    KeyParseFailed(String),
    /// No cached key validated the token's signature.
    #[error("signature verification failed: {0}")]
    SignatureVerificationFailed(String),
    /// The expiry claim is in the past.
    #[error("token expired: {0}")]
    TokenExpired(String),
    /// The issued-at claim is missing or in the future.
    #[error("token not issued yet: {0}")]
    NotIssuedYet(String),
    /// The issuer claim does not match the configured project identity.
    #[error("invalid issuer: {0}")]
    InvalidIssuer(String),
    /// The audience claim does not match the configured project identity.
    #[error("invalid audience: {0}")]
    InvalidAudience(String),
    /// The subject claim is missing or not a string, so no user ID can be
    /// extracted from an otherwise valid token.
    #[error("missing or non-string subject claim")]
    MissingSubject,
}

// The translations below are the only path from collaborator-level errors to
// the public taxonomy; callers never observe the internal types.

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Error::MalformedToken(err.to_string())
    }
}

impl From<ClaimsError> for Error {
    fn from(err: ClaimsError) -> Self {
        match err {
            ClaimsError::Expired(msg) => Error::TokenExpired(msg),
            ClaimsError::InvalidIssuer(msg) => Error::InvalidIssuer(msg),
            ClaimsError::InvalidAudience(msg) => Error::InvalidAudience(msg),
        }
    }
}
