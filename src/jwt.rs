use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::claims::Claims;

/// The only signing algorithm the secure-token service issues.
pub(crate) const JWS_ALG_RS256: &str = "RS256";

/// JOSE header of a compact-serialized token. Only the fields consulted
/// during verification are retained.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub(crate) struct JwsHeader {
    pub alg: String,
    pub kid: Option<String>,
    pub typ: Option<String>,
}

/// Structural parse failure; surfaced to callers as a malformed token.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub(crate) enum ParseError {
    #[error("found {0} parts (expected 3)")]
    NotCompact(usize),
    #[error("invalid base64url {section} encoding: {detail}")]
    Encoding {
        section: &'static str,
        detail: String,
    },
    #[error("failed to parse {section} JSON: {detail}")]
    Json {
        section: &'static str,
        detail: String,
    },
}

/// Outcome of checking one candidate key.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub(crate) enum SignatureError {
    /// The signature is simply not valid for this key; trying the remaining
    /// cached keys is appropriate.
    #[error("signature does not match key")]
    Mismatch,
    /// Any other cryptographic failure; retrying against further keys is
    /// pointless.
    #[error("crypto error: {0}")]
    Crypto(String),
}

///
/// A parsed compact JWS token: decoded header and claims plus the raw signed
/// payload and signature needed for verification.
///
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct JsonWebToken {
    header: JwsHeader,
    claims: Claims,
    signing_input: String,
    signature: Vec<u8>,
}

impl JsonWebToken {
    // NB: error details never include the claims encoding, to keep clients
    // from logging sensitive values.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let parts = raw.split('.').collect::<Vec<_>>();
        if parts.len() != 3 {
            return Err(ParseError::NotCompact(parts.len()));
        }

        let header_json = URL_SAFE_NO_PAD
            .decode(parts[0])
            .map_err(|err| ParseError::Encoding {
                section: "header",
                detail: err.to_string(),
            })?;
        let header = serde_json::from_slice(&header_json).map_err(|err| ParseError::Json {
            section: "header",
            detail: err.to_string(),
        })?;

        let claims_json = URL_SAFE_NO_PAD
            .decode(parts[1])
            .map_err(|err| ParseError::Encoding {
                section: "claims",
                detail: err.to_string(),
            })?;
        let claims = serde_json::from_slice(&claims_json).map_err(|err| ParseError::Json {
            section: "claims",
            detail: err.to_string(),
        })?;

        let signature = URL_SAFE_NO_PAD
            .decode(parts[2])
            .map_err(|err| ParseError::Encoding {
                section: "signature",
                detail: err.to_string(),
            })?;

        Ok(JsonWebToken {
            header,
            claims,
            signing_input: format!("{}.{}", parts[0], parts[1]),
            signature,
        })
    }

    pub fn header(&self) -> &JwsHeader {
        &self.header
    }

    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    pub fn into_claims(self) -> Claims {
        self.claims
    }

    /// Verifies the RSA-SHA256 signature over the signing input against one
    /// candidate public key.
    pub fn verify_signature(&self, key: &RsaPublicKey) -> Result<(), SignatureError> {
        let digest = Sha256::digest(self.signing_input.as_bytes());
        key.verify(Pkcs1v15Sign::new::<Sha256>(), digest.as_slice(), &self.signature)
            .map_err(|err| match err {
                rsa::Error::Verification => SignatureError::Mismatch,
                other => SignatureError::Crypto(other.to_string()),
            })
    }
}
