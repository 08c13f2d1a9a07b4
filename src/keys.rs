use std::collections::BTreeMap;
use std::time::Duration;

use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::RsaPublicKey;
use url::Url;
use x509_cert::der::{DecodePem, Encode};
use x509_cert::Certificate;

use crate::error::Error;

/// Timeout for key server fetches (connect + response).
const KEY_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

///
/// The signing keys currently published by the issuer, keyed by key ID.
///
/// Replaced wholesale on refresh, never mutated in place. The sorted map
/// keeps the signature-search order deterministic; the search semantics are
/// order-independent.
///
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct KeySet(BTreeMap<String, RsaPublicKey>);

impl KeySet {
    pub fn get(&self, kid: &str) -> Option<&RsaPublicKey> {
        self.0.get(kid)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RsaPublicKey)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<BTreeMap<String, RsaPublicKey>> for KeySet {
    fn from(keys: BTreeMap<String, RsaPublicKey>) -> Self {
        KeySet(keys)
    }
}

/// Capability to produce a fresh key set plus the number of seconds it may be
/// trusted. The cache refreshes through this seam so it can be exercised
/// without a network.
pub(crate) trait FetchKeys {
    fn fetch(&self) -> Result<(KeySet, u64), Error>;
}

/// Fetches the issuer's current public keys from the configured URL.
#[derive(Clone, Debug)]
pub(crate) struct KeyFetcher {
    http: reqwest::blocking::Client,
    url: Url,
}

impl KeyFetcher {
    pub fn new(url: Url) -> Result<Self, Error> {
        let http = reqwest::blocking::Client::builder()
            .timeout(KEY_FETCH_TIMEOUT)
            .build()
            .map_err(|err| {
                Error::KeyFetchFailed(format!("failed to build HTTP client: {}", err))
            })?;
        Ok(KeyFetcher { http, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn set_url(&mut self, url: Url) {
        self.url = url;
    }
}

impl FetchKeys for KeyFetcher {
    // The cache-control header is checked before the body: a response without
    // a usable max-age is rejected even when the body is otherwise valid,
    // because the max-age bounds how long this process will trust the keys.
    fn fetch(&self) -> Result<(KeySet, u64), Error> {
        log::debug!("requesting signing keys from {}", self.url);

        let response = self
            .http
            .get(self.url.clone())
            .send()
            .map_err(|err| Error::KeyFetchFailed(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::KeyFetchFailed(format!(
                "key server returned HTTP {}",
                status
            )));
        }

        let cache_control = response
            .headers()
            .get(reqwest::header::CACHE_CONTROL)
            .and_then(|value| value.to_str().ok());
        let max_age = extract_max_age(cache_control)?;

        let body: BTreeMap<String, String> = serde_json::from_reader(response)
            .map_err(|err| Error::KeyFetchFailed(format!("failed to decode key JSON: {}", err)))?;

        // Strict parse policy: a partially populated key set would silently
        // narrow future verification, so one bad key fails the whole fetch
        // and the previously cached keys stay in use.
        let mut keys = BTreeMap::new();
        for (kid, pem) in body {
            match parse_public_key(&pem) {
                Ok(key) => {
                    keys.insert(kid, key);
                }
                Err(detail) => {
                    log::warn!("rejecting unparsable signing key `{}`: {}", kid, detail);
                    return Err(Error::KeyParseFailed(format!("key `{}`: {}", kid, detail)));
                }
            }
        }
        log::debug!("fetched {} signing keys (max-age {}s)", keys.len(), max_age);
        Ok((KeySet(keys), max_age))
    }
}

/// Extracts the max-age value from a cache-control header such as
/// `"..., max-age=19008, ..."`. Directive names are case-insensitive and a
/// directive value terminates at the next comma or end of string.
fn extract_max_age(cache_control: Option<&str>) -> Result<u64, Error> {
    let cache_control = cache_control.ok_or(Error::MissingMaxAge)?;
    for directive in cache_control.split(',') {
        if let Some((name, value)) = directive.split_once('=') {
            if name.trim().eq_ignore_ascii_case("max-age") {
                if let Ok(max_age) = value.trim().parse::<u64>() {
                    return Ok(max_age);
                }
            }
        }
    }
    Err(Error::MissingMaxAge)
}

/// Parses one published key. The issuer serves X.509 certificate PEMs; bare
/// SPKI and PKCS#1 public keys are accepted as well.
fn parse_public_key(pem: &str) -> Result<RsaPublicKey, String> {
    if pem.contains("BEGIN CERTIFICATE") {
        let cert = Certificate::from_pem(pem.as_bytes())
            .map_err(|err| format!("invalid certificate: {}", err))?;
        let spki = cert
            .tbs_certificate
            .subject_public_key_info
            .to_der()
            .map_err(|err| format!("invalid subject public key info: {}", err))?;
        RsaPublicKey::from_public_key_der(&spki)
            .map_err(|err| format!("certificate does not carry an RSA public key: {}", err))
    } else if pem.contains("BEGIN RSA PUBLIC KEY") {
        RsaPublicKey::from_pkcs1_pem(pem).map_err(|err| format!("invalid PKCS#1 public key: {}", err))
    } else {
        RsaPublicKey::from_public_key_pem(pem).map_err(|err| format!("invalid public key: {}", err))
    }
}
