// src/types.rs
//! Core records passed between pipeline stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Supported link protocols. Closed set: anything else is rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    Shadowsocksr,
    Hysteria,
    Hysteria2,
    Tuic,
    Wireguard,
}

impl Protocol {
    pub const ALL: [Protocol; 9] = [
        Protocol::Vmess,
        Protocol::Vless,
        Protocol::Trojan,
        Protocol::Shadowsocks,
        Protocol::Shadowsocksr,
        Protocol::Hysteria,
        Protocol::Hysteria2,
        Protocol::Tuic,
        Protocol::Wireguard,
    ];

    /// Map a URI scheme (without `://`) to a protocol. Case-insensitive.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "vmess" => Some(Protocol::Vmess),
            "vless" => Some(Protocol::Vless),
            "trojan" => Some(Protocol::Trojan),
            "ss" => Some(Protocol::Shadowsocks),
            "ssr" => Some(Protocol::Shadowsocksr),
            "hysteria" => Some(Protocol::Hysteria),
            "hysteria2" | "hy2" => Some(Protocol::Hysteria2),
            "tuic" => Some(Protocol::Tuic),
            "wireguard" | "wg" => Some(Protocol::Wireguard),
            _ => None,
        }
    }

    /// Parse a protocol name as written in configuration files.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "shadowsocks" => Some(Protocol::Shadowsocks),
            "shadowsocksr" => Some(Protocol::Shadowsocksr),
            other => Self::from_scheme(other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Vmess => "vmess",
            Protocol::Vless => "vless",
            Protocol::Trojan => "trojan",
            Protocol::Shadowsocks => "shadowsocks",
            Protocol::Shadowsocksr => "shadowsocksr",
            Protocol::Hysteria => "hysteria",
            Protocol::Hysteria2 => "hysteria2",
            Protocol::Tuic => "tuic",
            Protocol::Wireguard => "wireguard",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configured trust/priority grouping of a source. Declaration order is rank
/// order: `Premium` is the best tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTier {
    Premium,
    Reliable,
    Bulk,
    Experimental,
}

impl SourceTier {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "premium" => Some(SourceTier::Premium),
            "reliable" => Some(SourceTier::Reliable),
            "bulk" => Some(SourceTier::Bulk),
            "experimental" => Some(SourceTier::Experimental),
            _ => None,
        }
    }

    /// Prior trust in [0,1] used by the scorer.
    pub fn prior(&self) -> f32 {
        match self {
            SourceTier::Premium => 1.0,
            SourceTier::Reliable => 0.8,
            SourceTier::Bulk => 0.55,
            SourceTier::Experimental => 0.35,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTier::Premium => "premium",
            SourceTier::Reliable => "reliable",
            SourceTier::Bulk => "bulk",
            SourceTier::Experimental => "experimental",
        }
    }
}

/// Body encoding hint for the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentHint {
    #[default]
    Auto,
    Plain,
    Base64,
    Gzip,
}

impl ContentHint {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(ContentHint::Auto),
            "plain" | "text" => Some(ContentHint::Plain),
            "base64" => Some(ContentHint::Base64),
            "gzip" => Some(ContentHint::Gzip),
            _ => None,
        }
    }
}

/// One configured endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub url: String,
    pub tier: SourceTier,
    pub weight: f32,
    #[serde(default)]
    pub expected_protocols: BTreeSet<Protocol>,
    #[serde(default)]
    pub encoding: ContentHint,
}

impl Source {
    /// Host part of the URL, lowercased. Rate limiting is keyed by this.
    pub fn host(&self) -> String {
        reqwest::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
            .unwrap_or_else(|| self.url.to_ascii_lowercase())
    }
}

/// Validated, immutable list of sources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceSet {
    pub sources: Vec<Source>,
}

impl SourceSet {
    pub fn get(&self, id: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Transport security attributes pulled out of a link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityInfo {
    /// Transport layer: `tls`, `reality`, `none`, ...
    pub security: Option<String>,
    /// Cipher / encryption method where the protocol has one.
    pub encryption: Option<String>,
    pub sni: Option<String>,
    /// Certificate verification disabled (`insecure=1`, `allowInsecure=1`).
    #[serde(default)]
    pub insecure: bool,
}

/// Order-independent fingerprint of (protocol, host, port, identifier).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CanonicalKey(pub String);

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One parsed, validated VPN endpoint description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub identifier: String,
    #[serde(default)]
    pub security: SecurityInfo,
    /// Transport hint: `tcp`, `ws`, `grpc`, `udp`, ...
    pub network: Option<String>,
    /// Fragment label, percent-decoded.
    pub name: Option<String>,
    pub raw_uri: String,
    pub source_id: String,
    pub first_seen_at: DateTime<Utc>,
    #[serde(default)]
    pub quality_score: Option<f32>,
    #[serde(default)]
    pub canonical_key: Option<CanonicalKey>,
}

impl Configuration {
    /// Build the canonical key. Host case, trailing dots and brackets around
    /// IPv6 literals are ignored; UUID identifiers are compared lowercase.
    pub fn compute_canonical_key(&self) -> CanonicalKey {
        use sha2::{Digest, Sha256};

        let host = normalize_host(&self.host);
        let ident = match self.protocol {
            Protocol::Vmess | Protocol::Vless | Protocol::Tuic => {
                self.identifier.trim().to_ascii_lowercase()
            }
            _ => self.identifier.trim().to_string(),
        };

        let mut hasher = Sha256::new();
        hasher.update(self.protocol.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(host.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.port.to_be_bytes());
        hasher.update([0u8]);
        hasher.update(ident.as_bytes());
        let digest = hasher.finalize();

        let mut out = String::with_capacity(64);
        for b in digest.iter() {
            use std::fmt::Write as _;
            let _ = write!(&mut out, "{:02x}", b);
        }
        CanonicalKey(out)
    }
}

/// Lowercase, strip IPv6 brackets and trailing dots.
pub fn normalize_host(host: &str) -> String {
    host.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}
