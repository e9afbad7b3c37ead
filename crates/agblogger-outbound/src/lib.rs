//! Outbound cross-posting safety.
//!
//! Two concerns live here. First, any HTTP request the server makes on
//! behalf of a user (cross-posting to a user-supplied endpoint) goes
//! through an SSRF-safe client: HTTPS only, DNS resolved up front, every
//! resolved address checked against private/loopback/link-local/reserved
//! ranges, and the connection pinned to the vetted addresses so a
//! rebinding DNS answer cannot redirect it. Second, stored platform
//! credentials are sealed with AES-256-GCM under a key derived from the
//! application secret.

use std::net::{IpAddr, SocketAddr};

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use pbkdf2::pbkdf2_hmac_array;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Size of the salt for key derivation.
const SALT_SIZE: usize = 16;
/// Size of the AES-GCM nonce.
const NONCE_SIZE: usize = 12;
/// PBKDF2 iteration count.
const PBKDF2_ITERATIONS: u32 = 100_000;
/// Derived key size (AES-256).
const KEY_SIZE: usize = 32;

/// Outbound failures.
#[derive(Debug, Error)]
pub enum OutboundError {
    /// The URL is unusable under the SSRF policy (scheme, host shape, or
    /// resolved address range).
    #[error("forbidden outbound url: {0}")]
    ForbiddenUrl(String),
    #[error("dns resolution failed for {0}")]
    Resolution(String),
    #[error("outbound request failed")]
    Request(#[from] reqwest::Error),
    #[error("credential sealing failed: {0}")]
    Crypto(String),
}

pub type OutboundResult<T> = Result<T, OutboundError>;

// ---------------------------------------------------------------------------
// SSRF-safe client

/// Validate a user-supplied URL and build a client pinned to its vetted
/// addresses.
///
/// The returned client resolves the URL's host to the addresses checked
/// here and nowhere else; a second DNS answer at connect time cannot
/// change the target.
pub async fn safe_client_for(raw_url: &str) -> OutboundResult<(reqwest::Client, Url)> {
    let url = Url::parse(raw_url).map_err(|_| OutboundError::ForbiddenUrl(raw_url.into()))?;
    if url.scheme() != "https" {
        return Err(OutboundError::ForbiddenUrl(format!("{raw_url} (https required)")));
    }
    let Some(host) = url.host_str().map(str::to_string) else {
        return Err(OutboundError::ForbiddenUrl(raw_url.into()));
    };
    let port = url.port_or_known_default().unwrap_or(443);

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|_| OutboundError::Resolution(host.clone()))?
        .collect();
    if addrs.is_empty() {
        return Err(OutboundError::Resolution(host.clone()));
    }
    for addr in &addrs {
        if !is_public_ip(addr.ip()) {
            return Err(OutboundError::ForbiddenUrl(format!(
                "{raw_url} (resolves to non-public address {})",
                addr.ip()
            )));
        }
    }
    debug!(host, ?addrs, "outbound host vetted");

    let client = reqwest::Client::builder()
        .resolve_to_addrs(&host, &addrs)
        .redirect(reqwest::redirect::Policy::none())
        .build()?;
    Ok((client, url))
}

/// POST a JSON payload to a user-supplied endpoint through the SSRF-safe
/// client. Returns the response body when the status is 2xx.
pub async fn post_json(
    raw_url: &str,
    payload: &serde_json::Value,
    bearer: Option<&str>,
) -> OutboundResult<serde_json::Value> {
    let (client, url) = safe_client_for(raw_url).await?;
    let mut request = client.post(url).json(payload);
    if let Some(token) = bearer {
        request = request.bearer_auth(token);
    }
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(OutboundError::ForbiddenUrl(format!(
            "{raw_url} answered {status}"
        )));
    }
    Ok(response.json().await.unwrap_or(serde_json::Value::Null))
}

/// Whether an address is acceptable as an outbound target.
fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            !(v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_multicast()
                // CGNAT 100.64.0.0/10
                || (octets[0] == 100 && (octets[1] & 0b1100_0000) == 64)
                // 0.0.0.0/8
                || octets[0] == 0
                // Reserved 240.0.0.0/4 (is_broadcast covers 255.255.255.255)
                || octets[0] >= 240)
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_public_ip(IpAddr::V4(mapped));
            }
            let segments = v6.segments();
            !(v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                // Unique local fc00::/7
                || (segments[0] & 0xfe00) == 0xfc00
                // Link local fe80::/10
                || (segments[0] & 0xffc0) == 0xfe80
                // Documentation 2001:db8::/32
                || (segments[0] == 0x2001 && segments[1] == 0x0db8))
        }
    }
}

// ---------------------------------------------------------------------------
// Credential sealing

/// Seal plaintext under the application secret. Output format:
/// `base64(salt ‖ nonce ‖ ciphertext)` with a fresh salt and nonce per
/// call.
pub fn seal(plaintext: &[u8], app_secret: &str) -> OutboundResult<String> {
    let mut salt = [0u8; SALT_SIZE];
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce_bytes);

    let key = derive_key(app_secret, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| OutboundError::Crypto(format!("cipher init: {e:?}")))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| OutboundError::Crypto(format!("encrypt: {e:?}")))?;

    let mut combined = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + ciphertext.len());
    combined.extend_from_slice(&salt);
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(combined))
}

/// Open a sealed credential string.
pub fn unseal(sealed: &str, app_secret: &str) -> OutboundResult<Vec<u8>> {
    let data = BASE64
        .decode(sealed)
        .map_err(|_| OutboundError::Crypto("invalid base64".into()))?;
    if data.len() < SALT_SIZE + NONCE_SIZE + 16 {
        return Err(OutboundError::Crypto("ciphertext too short".into()));
    }
    let salt = &data[..SALT_SIZE];
    let nonce = &data[SALT_SIZE..SALT_SIZE + NONCE_SIZE];
    let ciphertext = &data[SALT_SIZE + NONCE_SIZE..];

    let key = derive_key(app_secret, salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| OutboundError::Crypto(format!("cipher init: {e:?}")))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| OutboundError::Crypto("wrong secret or corrupted data".into()))
}

fn derive_key(app_secret: &str, salt: &[u8]) -> [u8; KEY_SIZE] {
    pbkdf2_hmac_array::<Sha256, KEY_SIZE>(app_secret.as_bytes(), salt, PBKDF2_ITERATIONS)
}

// ---------------------------------------------------------------------------
// Cross-posters

/// Stored credentials for one platform account, sealed at rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformCredentials {
    /// Endpoint to deliver posts to.
    pub endpoint: String,
    /// Optional bearer token for that endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// The capability set a platform integration provides, dispatched by
/// platform tag.
#[derive(Debug, Clone)]
pub enum CrossPoster {
    /// Generic webhook delivery: POST a JSON summary of the post.
    Webhook { credentials: PlatformCredentials },
}

impl CrossPoster {
    /// Build the poster for a platform tag. Unknown platforms are `None`.
    pub fn for_platform(platform: &str, credentials: PlatformCredentials) -> Option<Self> {
        match platform {
            "webhook" => Some(Self::Webhook { credentials }),
            _ => None,
        }
    }

    /// Check the stored credentials against the platform without posting.
    pub async fn validate_credentials(&self) -> OutboundResult<bool> {
        match self {
            Self::Webhook { credentials } => {
                // Vetting the endpoint is the whole check for a webhook.
                safe_client_for(&credentials.endpoint).await?;
                Ok(true)
            }
        }
    }

    /// Deliver a published post.
    pub async fn post(&self, title: &str, url: &str, excerpt: &str) -> OutboundResult<()> {
        match self {
            Self::Webhook { credentials } => {
                let payload = serde_json::json!({
                    "title": title,
                    "url": url,
                    "excerpt": excerpt,
                });
                post_json(&credentials.endpoint, &payload, credentials.token.as_deref()).await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn seal_unseal_roundtrip() {
        let sealed = seal(b"{\"endpoint\":\"https://x\"}", "app-secret").expect("seal");
        let opened = unseal(&sealed, "app-secret").expect("unseal");
        assert_eq!(opened, b"{\"endpoint\":\"https://x\"}");
    }

    #[test]
    fn seal_is_randomized() {
        let a = seal(b"same", "s").expect("a");
        let b = seal(b"same", "s").expect("b");
        assert_ne!(a, b);
    }

    #[test]
    fn unseal_wrong_secret_fails() {
        let sealed = seal(b"data", "right").expect("seal");
        assert!(unseal(&sealed, "wrong").is_err());
        assert!(unseal("not base64!!", "right").is_err());
        assert!(unseal("AAAA", "right").is_err());
    }

    #[test]
    fn private_ranges_rejected() {
        let bad = [
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)),
            IpAddr::V4(Ipv4Addr::new(169, 254, 1, 1)),
            IpAddr::V4(Ipv4Addr::new(100, 64, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            IpAddr::V4(Ipv4Addr::new(240, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(255, 255, 255, 255)),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            IpAddr::V6("fc00::1".parse().expect("ula")),
            IpAddr::V6("fe80::1".parse().expect("link local")),
            IpAddr::V6("::ffff:127.0.0.1".parse().expect("mapped loopback")),
            IpAddr::V6("::ffff:10.0.0.1".parse().expect("mapped private")),
            IpAddr::V6("2001:db8::1".parse().expect("documentation")),
        ];
        for ip in bad {
            assert!(!is_public_ip(ip), "{ip} accepted");
        }
    }

    #[test]
    fn public_addresses_accepted() {
        let good = [
            IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
            IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            IpAddr::V6("2606:4700::1111".parse().expect("v6")),
        ];
        for ip in good {
            assert!(is_public_ip(ip), "{ip} rejected");
        }
    }

    #[tokio::test]
    async fn http_scheme_rejected() {
        let err = safe_client_for("http://example.com/hook").await.expect_err("http");
        assert!(matches!(err, OutboundError::ForbiddenUrl(_)));
    }

    #[tokio::test]
    async fn loopback_host_rejected() {
        // Numeric loopback needs no DNS and must fail the range check.
        let err = safe_client_for("https://127.0.0.1/hook").await.expect_err("loopback");
        assert!(matches!(err, OutboundError::ForbiddenUrl(_)));
    }

    #[tokio::test]
    async fn garbage_url_rejected() {
        assert!(safe_client_for("not a url").await.is_err());
        assert!(safe_client_for("https://").await.is_err());
    }

    #[test]
    fn poster_dispatch_by_platform_tag() {
        let creds =
            PlatformCredentials { endpoint: "https://example.com/hook".into(), token: None };
        assert!(CrossPoster::for_platform("webhook", creds.clone()).is_some());
        assert!(CrossPoster::for_platform("carrier-pigeon", creds).is_none());
    }
}
