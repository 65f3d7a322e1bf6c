//! Safe-Fetch — the hub's outbound HTTP for browser-relayed fetches.
//!
//! Safety properties:
//! - Only absolute http/https URLs.
//! - Hostnames resolving to private, loopback, link-local, CGNAT,
//!   documentation or benchmarking ranges are refused; every resolved
//!   address must be public.
//! - Sensitive request headers are stripped; credentials never forward.
//! - A configurable denylist pattern set is consulted per URL.
//! - Redirects are followed manually, revalidating every hop (5 max).
//! - Request and response bodies are capped at 10 MiB.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};
use std::time::Duration;

use futures_util::StreamExt;
use regex::RegexSet;
use reqwest::Url;

use hub_domain::error::{Error, Result};

pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
const MAX_REDIRECTS: usize = 5;

const STRIPPED_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "x-hub-token",
    "proxy-authorization",
];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Address classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `true` if the address belongs to a private, loopback, link-local or
/// otherwise non-public range.
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()                // 127.0.0.0/8
                || v4.is_private()          // 10/8, 172.16/12, 192.168/16
                || v4.is_link_local()       // 169.254.0.0/16
                || v4.is_broadcast()
                || v4.is_unspecified()
                || is_v4_shared(v4)         // 100.64.0.0/10 (CGNAT)
                || is_v4_documentation(v4)
                || is_v4_benchmarking(v4)   // 198.18.0.0/15
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || is_v6_unique_local(v6)   // fc00::/7
                || is_v6_link_local(v6)     // fe80::/10
        }
    }
}

fn is_v4_shared(ip: &Ipv4Addr) -> bool {
    let o = ip.octets();
    o[0] == 100 && (o[1] & 0xC0) == 64
}

fn is_v4_documentation(ip: &Ipv4Addr) -> bool {
    let o = ip.octets();
    (o[0] == 192 && o[1] == 0 && o[2] == 2)
        || (o[0] == 198 && o[1] == 51 && o[2] == 100)
        || (o[0] == 203 && o[1] == 0 && o[2] == 113)
}

fn is_v4_benchmarking(ip: &Ipv4Addr) -> bool {
    let o = ip.octets();
    o[0] == 198 && (o[1] & 0xFE) == 18
}

fn is_v6_unique_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xFE00) == 0xFC00
}

fn is_v6_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xFFC0) == 0xFE80
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fetcher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

pub struct SafeFetcher {
    client: reqwest::Client,
    blocked: RegexSet,
}

impl SafeFetcher {
    pub fn new(blocked_patterns: &[String]) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Other(format!("building fetch client: {e}")))?;
        let blocked = RegexSet::new(blocked_patterns)
            .map_err(|e| Error::Config(format!("bad blocked pattern: {e}")))?;
        Ok(Self { client, blocked })
    }

    /// Validate one URL hop against the full policy.
    fn validate_url(&self, raw: &str) -> Result<Url> {
        let parsed = Url::parse(raw)
            .map_err(|e| Error::ToolExec(format!("invalid or relative URL: {e}")))?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(Error::ToolExec(format!(
                    "blocked scheme {other}:// (only http/https)"
                )))
            }
        }
        if self.blocked.is_match(raw) {
            return Err(Error::ToolExec("URL matches the blocked pattern list".into()));
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::ToolExec("URL has no host".into()))?;
        let port = parsed.port_or_known_default().unwrap_or(80);

        let addrs: Vec<_> = format!("{host}:{port}")
            .to_socket_addrs()
            .map_err(|e| Error::ToolExec(format!("DNS resolution failed for {host}: {e}")))?
            .collect();
        if addrs.is_empty() {
            return Err(Error::ToolExec(format!("no addresses for {host}")));
        }
        for addr in &addrs {
            if is_private_ip(&addr.ip()) {
                return Err(Error::ToolExec(format!(
                    "blocked request to private address: {host} resolves to {}",
                    addr.ip()
                )));
            }
        }
        Ok(parsed)
    }

    /// Perform a fetch, following redirects manually and revalidating
    /// every hop.
    pub async fn fetch(&self, req: FetchRequest) -> Result<FetchResponse> {
        if req.body.as_ref().map(String::len).unwrap_or(0) > MAX_BODY_BYTES {
            return Err(Error::ToolExec(format!(
                "request body exceeds {MAX_BODY_BYTES} bytes"
            )));
        }

        let method: reqwest::Method = req
            .method
            .to_uppercase()
            .parse()
            .map_err(|_| Error::ToolExec(format!("bad method: {}", req.method)))?;

        let mut url = self.validate_url(&req.url)?;
        for _hop in 0..=MAX_REDIRECTS {
            let mut builder = self.client.request(method.clone(), url.clone());
            for (name, value) in &req.headers {
                if STRIPPED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                    continue;
                }
                builder = builder.header(name, value);
            }
            if let Some(body) = &req.body {
                builder = builder.body(body.clone());
            }

            let resp = builder
                .send()
                .await
                .map_err(|e| Error::ToolExec(format!("fetch failed: {e}")))?;

            let status = resp.status();
            if status.is_redirection() {
                let Some(location) = resp
                    .headers()
                    .get("location")
                    .and_then(|v| v.to_str().ok())
                else {
                    return Err(Error::ToolExec("redirect without Location".into()));
                };
                // Resolve relative redirects against the current hop,
                // then revalidate the result like any other URL.
                let next = url
                    .join(location)
                    .map_err(|e| Error::ToolExec(format!("bad redirect target: {e}")))?;
                url = self.validate_url(next.as_str())?;
                continue;
            }

            let headers: Vec<(String, String)> = resp
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();

            // Stream the body with a hard size cap.
            let mut body = Vec::new();
            let mut stream = resp.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk =
                    chunk.map_err(|e| Error::ToolExec(format!("reading body: {e}")))?;
                if body.len() + chunk.len() > MAX_BODY_BYTES {
                    return Err(Error::ToolExec(format!(
                        "response body exceeds {MAX_BODY_BYTES} bytes"
                    )));
                }
                body.extend_from_slice(&chunk);
            }

            return Ok(FetchResponse {
                status: status.as_u16(),
                headers,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        Err(Error::ToolExec(format!(
            "too many redirects (> {MAX_REDIRECTS})"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn rfc1918_boundaries() {
        // 172.16/12: .15 and .32 are public, .16 through .31 private.
        assert!(!is_private_ip(&v4(172, 15, 0, 1)));
        assert!(is_private_ip(&v4(172, 16, 0, 1)));
        assert!(is_private_ip(&v4(172, 31, 255, 255)));
        assert!(!is_private_ip(&v4(172, 32, 0, 1)));
        assert!(is_private_ip(&v4(10, 1, 2, 3)));
        assert!(is_private_ip(&v4(192, 168, 0, 1)));
    }

    #[test]
    fn link_local_and_loopback() {
        assert!(is_private_ip(&v4(169, 254, 1, 1)));
        assert!(is_private_ip(&v4(127, 0, 0, 1)));
        assert!(is_private_ip(&v4(100, 64, 0, 1))); // CGNAT
        assert!(!is_private_ip(&v4(8, 8, 8, 8)));
    }

    #[test]
    fn ipv6_private_ranges() {
        let ula: IpAddr = "fd12:3456::1".parse().unwrap();
        let ll: IpAddr = "fe80::1".parse().unwrap();
        let public: IpAddr = "2001:4860:4860::8888".parse().unwrap();
        assert!(is_private_ip(&ula));
        assert!(is_private_ip(&ll));
        assert!(!is_private_ip(&public));
        assert!(is_private_ip(&"::1".parse().unwrap()));
    }

    #[test]
    fn url_validation_rejects_bad_schemes_and_relative() {
        let fetcher = SafeFetcher::new(&[]).unwrap();
        assert!(fetcher.validate_url("file:///etc/passwd").is_err());
        assert!(fetcher.validate_url("ftp://example.com/x").is_err());
        assert!(fetcher.validate_url("/relative/path").is_err());
        assert!(fetcher.validate_url("not a url").is_err());
    }

    #[test]
    fn url_validation_blocks_literal_private_hosts() {
        let fetcher = SafeFetcher::new(&[]).unwrap();
        assert!(fetcher.validate_url("http://127.0.0.1/admin").is_err());
        assert!(fetcher.validate_url("http://192.168.1.1/").is_err());
        assert!(fetcher.validate_url("http://[fe80::1]/").is_err());
    }

    #[test]
    fn denylist_patterns_apply() {
        let fetcher = SafeFetcher::new(&["evil\\.corp".into()]).unwrap();
        let err = fetcher.validate_url("https://evil.corp/payload").unwrap_err();
        assert!(err.to_string().contains("blocked pattern"));
    }

    #[test]
    fn sensitive_headers_are_stripped_set() {
        for name in ["Authorization", "cookie", "X-Api-Key"] {
            assert!(STRIPPED_HEADERS.contains(&name.to_ascii_lowercase().as_str()));
        }
    }
}
