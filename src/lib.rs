#![warn(missing_docs)]
//!
//! Verification of [Firebase Auth](https://firebase.google.com/docs/auth) ID
//! tokens against the Google secure-token signing keys.
//!
//! The verifier fetches the issuer's current public keys, caches them for as
//! long as the key server's `Cache-Control: max-age` allows, and uses them to
//! check RS256 token signatures before validating the standard claims
//! (expiry, issued-at, issuer, audience). Keys are refreshed on demand when
//! the cache goes stale; a verifier is safe to share across threads and at
//! most one concurrent caller performs the network fetch.
//!
//! ```rust,no_run
//! use securetoken::IdTokenVerifier;
//!
//! # fn main() -> Result<(), securetoken::Error> {
//! let verifier = IdTokenVerifier::new("my-project")?;
//!
//! let (user_id, claims) = verifier.verify("eyJhbGciOiJSUzI1NiIsInR5cCI6...")?;
//! println!("verified user {} ({} claims)", user_id, claims.len());
//! # Ok(())
//! # }
//! ```
//!

mod cache;
mod claims;
mod error;
mod jwt;
mod keys;
mod verifier;

pub use claims::Claims;
pub use error::Error;
pub use verifier::IdTokenVerifier;

/// URL the secure-token signing keys are published at.
pub const DEFAULT_KEY_URL: &str =
    "https://www.googleapis.com/robot/v1/metadata/x509/securetoken@system.gserviceaccount.com";

/// Issuer prefix; tokens must carry an `iss` of this prefix followed by the
/// project ID.
pub const DEFAULT_ISSUER_PREFIX: &str = "https://securetoken.google.com/";

///
/// Capability to verify a bearer ID token, returning the authenticated user
/// ID and the token's claims.
///
/// Implemented by [`IdTokenVerifier`]; consumers that want to swap in a stub
/// for testing can depend on this trait instead of the concrete type.
///
pub trait TokenVerifier {
    /// Verifies the compact-serialized `token`.
    fn verify(&self, token: &str) -> Result<(String, Claims), Error>;
}
