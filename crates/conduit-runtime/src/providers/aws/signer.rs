//! AWS Signature Version 4.
//!
//! Header signing for SQS and S3 requests and query-string signing for S3
//! presigned URLs.
//!
//! ## References
//!
//! - [AWS Signature V4](https://docs.aws.amazon.com/general/latest/gr/signature-version-4.html)
//! - [Presigned URLs](https://docs.aws.amazon.com/AmazonS3/latest/API/sigv4-query-string-auth.html)

use super::credentials::AwsCredentials;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use url::Url;

#[cfg(test)]
#[path = "signer_tests.rs"]
mod tests;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Payload hash placeholder for presigned URLs
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Hex SHA-256 of a request payload
pub fn payload_hash(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Percent-encode with the AWS rules (unreserved: `A-Z a-z 0-9 - _ . ~`)
pub fn uri_encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Encode an object key for a URL path, keeping `/` separators
pub fn encode_key_path(key: &str) -> String {
    key.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
}

/// AWS Signature Version 4 signer for one service in one region
#[derive(Debug, Clone)]
pub struct SigV4Signer {
    region: String,
    service: String,
}

impl SigV4Signer {
    pub fn new(region: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            service: service.into(),
        }
    }

    /// Sign a request and return the headers to add to it
    ///
    /// `headers` are the extra headers the request carries and that should be
    /// covered by the signature (names in any case). `host` and `x-amz-date`
    /// are always signed. The returned map holds `Authorization`,
    /// `x-amz-date`, and `x-amz-security-token` for temporary credentials.
    pub fn sign_headers(
        &self,
        credentials: &AwsCredentials,
        method: &str,
        url: &Url,
        headers: &BTreeMap<String, String>,
        payload_hash: &str,
        timestamp: &DateTime<Utc>,
    ) -> BTreeMap<String, String> {
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = timestamp.format("%Y%m%d").to_string();

        let mut canonical: BTreeMap<String, String> = headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string()))
            .collect();
        canonical.insert("host".to_string(), host_header(url));
        canonical.insert("x-amz-date".to_string(), amz_date.clone());
        if let Some(ref token) = credentials.session_token {
            canonical.insert("x-amz-security-token".to_string(), token.to_string());
        }

        let canonical_headers: String = canonical
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();
        let signed_headers = canonical.keys().cloned().collect::<Vec<_>>().join(";");

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method,
            canonical_uri(url),
            canonical_query(url.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned()))),
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = self.credential_scope(&date_stamp);
        let signature = self.signature(
            &credentials.secret_access_key,
            &date_stamp,
            &string_to_sign(&amz_date, &credential_scope, &canonical_request),
        );

        let mut result = BTreeMap::new();
        result.insert(
            "Authorization".to_string(),
            format!(
                "{} Credential={}/{}, SignedHeaders={}, Signature={}",
                ALGORITHM, credentials.access_key_id, credential_scope, signed_headers, signature
            ),
        );
        result.insert("x-amz-date".to_string(), amz_date);
        if let Some(ref token) = credentials.session_token {
            result.insert("x-amz-security-token".to_string(), token.to_string());
        }
        result
    }

    /// Build a presigned URL valid for `expires_in` seconds
    ///
    /// Only the `host` header is signed and the payload is unsigned.
    pub fn presign_url(
        &self,
        credentials: &AwsCredentials,
        method: &str,
        url: &Url,
        expires_in: u64,
        timestamp: &DateTime<Utc>,
    ) -> String {
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = timestamp.format("%Y%m%d").to_string();
        let credential_scope = self.credential_scope(&date_stamp);

        let mut query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        query.push(("X-Amz-Algorithm".to_string(), ALGORITHM.to_string()));
        query.push((
            "X-Amz-Credential".to_string(),
            format!("{}/{}", credentials.access_key_id, credential_scope),
        ));
        query.push(("X-Amz-Date".to_string(), amz_date.clone()));
        query.push(("X-Amz-Expires".to_string(), expires_in.to_string()));
        if let Some(ref token) = credentials.session_token {
            query.push(("X-Amz-Security-Token".to_string(), token.to_string()));
        }
        query.push(("X-Amz-SignedHeaders".to_string(), "host".to_string()));

        let query_string = canonical_query(query);
        let canonical_request = format!(
            "{}\n{}\n{}\nhost:{}\n\nhost\n{}",
            method,
            canonical_uri(url),
            query_string,
            host_header(url),
            UNSIGNED_PAYLOAD
        );

        let signature = self.signature(
            &credentials.secret_access_key,
            &date_stamp,
            &string_to_sign(&amz_date, &credential_scope, &canonical_request),
        );

        let mut base = url.clone();
        base.set_query(None);
        format!("{}?{}&X-Amz-Signature={}", base, query_string, signature)
    }

    fn credential_scope(&self, date_stamp: &str) -> String {
        format!(
            "{}/{}/{}/aws4_request",
            date_stamp, self.region, self.service
        )
    }

    /// Derive the signing key through the 4-level HMAC chain
    ///
    /// 1. kDate = HMAC("AWS4" + secret, date)
    /// 2. kRegion = HMAC(kDate, region)
    /// 3. kService = HMAC(kRegion, service)
    /// 4. kSigning = HMAC(kService, "aws4_request")
    pub fn signing_key(&self, secret_key: &str, date_stamp: &str) -> Vec<u8> {
        let k_secret = format!("AWS4{}", secret_key);
        let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, self.service.as_bytes());
        hmac_sha256(&k_service, b"aws4_request")
    }

    fn signature(&self, secret_key: &str, date_stamp: &str, string_to_sign: &str) -> String {
        let key = self.signing_key(secret_key, date_stamp);
        hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()))
    }
}

fn string_to_sign(amz_date: &str, credential_scope: &str, canonical_request: &str) -> String {
    format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        credential_scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    )
}

/// `Host` header value as reqwest sends it (port only when non-default)
pub fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

fn canonical_uri(url: &Url) -> String {
    // Paths are built pre-encoded; the url crate leaves existing escapes alone.
    let path = url.path();
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

fn canonical_query(pairs: impl IntoIterator<Item = (String, String)>) -> String {
    let mut encoded: Vec<(String, String)> = pairs
        .into_iter()
        .map(|(k, v)| (uri_encode(&k), uri_encode(&v)))
        .collect();
    encoded.sort();
    encoded
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC can take key of any size"),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}
