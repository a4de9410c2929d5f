// src/parse/protocols.rs
//! Per-protocol structural parsers. `parse_link` is the closed dispatch table:
//! adding a `Protocol` variant fails to compile until it gets an arm here.

use serde::Deserialize;
use serde_json::Value;

use super::link::{percent_decode, split_host_port, split_link, validate_host, LinkParts};
use super::screen::Screener;
use crate::decode::decode_base64_any;
use crate::error::ParseError;
use crate::types::{Protocol, SecurityInfo};

/// Fields every protocol produces before the record gets its provenance.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ParsedLink {
    pub host: String,
    pub port: u16,
    pub identifier: String,
    pub security: SecurityInfo,
    pub network: Option<String>,
    pub name: Option<String>,
}

const SS_CIPHERS: [&str; 21] = [
    "aes-128-gcm",
    "aes-192-gcm",
    "aes-256-gcm",
    "chacha20-ietf-poly1305",
    "xchacha20-ietf-poly1305",
    "chacha20-poly1305",
    "2022-blake3-aes-128-gcm",
    "2022-blake3-aes-256-gcm",
    "2022-blake3-chacha20-poly1305",
    "aes-128-cfb",
    "aes-192-cfb",
    "aes-256-cfb",
    "aes-128-ctr",
    "aes-192-ctr",
    "aes-256-ctr",
    "camellia-256-cfb",
    "chacha20-ietf",
    "chacha20",
    "rc4-md5",
    "none",
    "plain",
];

/// `rest` is everything after `scheme://`.
pub(crate) fn parse_link(
    protocol: Protocol,
    rest: &str,
    screener: &Screener,
) -> Result<ParsedLink, ParseError> {
    match protocol {
        Protocol::Vmess => parse_vmess(rest, screener),
        Protocol::Vless => parse_vless(rest),
        Protocol::Trojan => parse_trojan(rest),
        Protocol::Shadowsocks => parse_shadowsocks(rest, screener),
        Protocol::Shadowsocksr => parse_shadowsocksr(rest, screener),
        Protocol::Hysteria => parse_hysteria(rest),
        Protocol::Hysteria2 => parse_hysteria2(rest),
        Protocol::Tuic => parse_tuic(rest),
        Protocol::Wireguard => parse_wireguard(rest),
    }
}

fn canonical_uuid(protocol: Protocol, s: &str) -> Result<String, ParseError> {
    let s = s.trim();
    // Only the hyphenated 36-char form is accepted; braces/urn forms are not links.
    if s.len() != 36 {
        return Err(ParseError::malformed(protocol, "identifier is not a uuid"));
    }
    uuid::Uuid::parse_str(s)
        .map(|u| u.hyphenated().to_string())
        .map_err(|_| ParseError::malformed(protocol, "identifier is not a uuid"))
}

fn required_secret(protocol: Protocol, s: Option<&str>, what: &str) -> Result<String, ParseError> {
    s.map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ParseError::malformed(protocol, format!("missing {what}")))
}

fn lower(s: Option<&str>) -> Option<String> {
    s.map(|v| v.trim().to_ascii_lowercase()).filter(|v| !v.is_empty())
}

// --- vmess: base64(JSON) ---

#[derive(Debug, Deserialize)]
struct VmessJson {
    #[serde(default)]
    ps: Option<String>,
    #[serde(default)]
    add: Option<String>,
    #[serde(default)]
    port: Option<Value>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    scy: Option<String>,
    #[serde(default)]
    net: Option<String>,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    tls: Option<String>,
    #[serde(default)]
    sni: Option<String>,
}

fn parse_vmess(rest: &str, screener: &Screener) -> Result<ParsedLink, ParseError> {
    const P: Protocol = Protocol::Vmess;
    let payload = rest.split('#').next().unwrap_or_default().trim();
    let bytes = decode_base64_any(payload).ok_or_else(|| ParseError::malformed(P, "payload is not base64"))?;
    let text = String::from_utf8(bytes).map_err(|_| ParseError::malformed(P, "payload is not utf-8"))?;
    screener.screen_text(&text)?;
    let v: VmessJson =
        serde_json::from_str(&text).map_err(|e| ParseError::malformed(P, format!("payload json: {e}")))?;

    let host = v
        .add
        .as_deref()
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ParseError::malformed(P, "missing add"))?
        .to_string();
    validate_host(P, &host)?;

    let port_raw = match v.port {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s,
        _ => return Err(ParseError::malformed(P, "missing port")),
    };
    let port = super::link::parse_port(P, &port_raw)?;
    let identifier = canonical_uuid(P, v.id.as_deref().unwrap_or_default())?;

    let security = match lower(v.tls.as_deref()).as_deref() {
        Some("tls") => Some("tls".to_string()),
        Some("reality") => Some("reality".to_string()),
        _ => Some("none".to_string()),
    };
    let sni = lower(v.sni.as_deref()).or_else(|| lower(v.host.as_deref()));

    Ok(ParsedLink {
        host,
        port,
        identifier,
        security: SecurityInfo {
            security,
            encryption: lower(v.scy.as_deref()).or(Some("auto".into())),
            sni,
            insecure: false,
        },
        network: lower(v.net.as_deref()).or(Some("tcp".into())),
        name: v.ps.filter(|s| !s.trim().is_empty()),
    })
}

// --- vless ---

fn parse_vless(rest: &str) -> Result<ParsedLink, ParseError> {
    const P: Protocol = Protocol::Vless;
    let parts = split_link(P, rest)?;
    let identifier = canonical_uuid(P, parts.userinfo.as_deref().unwrap_or_default())?;
    let security = lower(parts.param(&["security"])).unwrap_or_else(|| "none".into());
    if security == "reality" && parts.param(&["pbk", "publickey"]).is_none() {
        return Err(ParseError::malformed(P, "reality link without pbk"));
    }
    Ok(ParsedLink {
        identifier,
        security: SecurityInfo {
            security: Some(security),
            encryption: lower(parts.param(&["encryption"])).or(Some("none".into())),
            sni: lower(parts.param(&["sni", "servername", "peer"])),
            insecure: parts.flag(&["allowinsecure", "insecure"]),
        },
        network: lower(parts.param(&["type", "network"])).or(Some("tcp".into())),
        name: parts.fragment.clone(),
        host: parts.host,
        port: parts.port,
    })
}

// --- trojan ---

fn parse_trojan(rest: &str) -> Result<ParsedLink, ParseError> {
    const P: Protocol = Protocol::Trojan;
    let parts = split_link(P, rest)?;
    let identifier = required_secret(P, parts.userinfo.as_deref(), "password")?;
    Ok(ParsedLink {
        identifier,
        security: SecurityInfo {
            security: lower(parts.param(&["security"])).or(Some("tls".into())),
            encryption: None,
            sni: lower(parts.param(&["sni", "peer", "servername"])),
            insecure: parts.flag(&["allowinsecure", "insecure"]),
        },
        network: lower(parts.param(&["type", "network"])).or(Some("tcp".into())),
        name: parts.fragment.clone(),
        host: parts.host,
        port: parts.port,
    })
}

// --- shadowsocks: SIP002 or legacy whole-base64 ---

fn parse_shadowsocks(rest: &str, screener: &Screener) -> Result<ParsedLink, ParseError> {
    const P: Protocol = Protocol::Shadowsocks;
    let (body, fragment) = match rest.split_once('#') {
        Some((b, f)) => (b, Some(percent_decode(f)).filter(|f| !f.trim().is_empty())),
        None => (rest, None),
    };
    let (body, query) = match body.split_once('?') {
        Some((b, q)) => (b, Some(q)),
        None => (body, None),
    };
    let body = body.trim_end_matches('/');

    let (method, password, host, port) = match body.rsplit_once('@') {
        Some((userinfo, hostport)) => {
            let userinfo = percent_decode(userinfo);
            let creds = if userinfo.contains(':') {
                userinfo
            } else {
                let raw = decode_base64_any(&userinfo)
                    .ok_or_else(|| ParseError::malformed(P, "userinfo is not base64"))?;
                String::from_utf8(raw).map_err(|_| ParseError::malformed(P, "userinfo is not utf-8"))?
            };
            screener.screen_text(&creds)?;
            let (m, pw) = creds
                .split_once(':')
                .ok_or_else(|| ParseError::malformed(P, "userinfo lacks method:password"))?;
            let (h, p) = split_host_port(P, hostport.split('/').next().unwrap_or_default())?;
            (m.to_string(), pw.to_string(), h, p)
        }
        None => {
            let raw = decode_base64_any(body).ok_or_else(|| ParseError::malformed(P, "body is not base64"))?;
            let decoded = String::from_utf8(raw).map_err(|_| ParseError::malformed(P, "body is not utf-8"))?;
            screener.screen_text(&decoded)?;
            let (creds, hostport) = decoded
                .rsplit_once('@')
                .ok_or_else(|| ParseError::malformed(P, "decoded body lacks host"))?;
            let (m, pw) = creds
                .split_once(':')
                .ok_or_else(|| ParseError::malformed(P, "decoded body lacks method:password"))?;
            let (h, p) = split_host_port(P, hostport)?;
            (m.to_string(), pw.to_string(), h, p)
        }
    };

    let method = method.trim().to_ascii_lowercase();
    if !SS_CIPHERS.contains(&method.as_str()) {
        return Err(ParseError::malformed(P, format!("unknown cipher {method:?}")));
    }
    let identifier = required_secret(P, Some(&password), "password")?;

    // `plugin=v2ray-plugin;mode=websocket` → transport hint "v2ray-plugin"
    let plugin = query
        .and_then(|q| q.split('&').find_map(|kv| kv.strip_prefix("plugin=")))
        .map(percent_decode)
        .and_then(|p| p.split(';').next().map(|s| s.trim().to_ascii_lowercase()))
        .filter(|p| !p.is_empty());

    Ok(ParsedLink {
        host,
        port,
        identifier,
        security: SecurityInfo {
            security: None,
            encryption: Some(method),
            sni: None,
            insecure: false,
        },
        network: plugin.or(Some("tcp".into())),
        name: fragment,
    })
}

// --- shadowsocksr: base64(host:port:protocol:method:obfs:base64pass/?params) ---

fn parse_shadowsocksr(rest: &str, screener: &Screener) -> Result<ParsedLink, ParseError> {
    const P: Protocol = Protocol::Shadowsocksr;
    let raw = decode_base64_any(rest.trim()).ok_or_else(|| ParseError::malformed(P, "payload is not base64"))?;
    let text = String::from_utf8(raw).map_err(|_| ParseError::malformed(P, "payload is not utf-8"))?;
    screener.screen_text(&text)?;

    let (main, params) = match text.split_once("/?") {
        Some((m, p)) => (m, Some(p)),
        None => (text.trim_end_matches('/'), None),
    };
    let mut fields = main.rsplitn(6, ':');
    let pass_b64 = fields.next().unwrap_or_default();
    let obfs = fields.next().unwrap_or_default();
    let method = fields.next().unwrap_or_default();
    let _proto = fields.next().unwrap_or_default();
    let port_str = fields.next().ok_or_else(|| ParseError::malformed(P, "too few fields"))?;
    let host = fields.next().ok_or_else(|| ParseError::malformed(P, "too few fields"))?;

    let host = host.trim().to_string();
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host
    };
    validate_host(P, &host)?;
    let port = super::link::parse_port(P, port_str)?;

    let password = decode_base64_any(pass_b64)
        .and_then(|b| String::from_utf8(b).ok())
        .ok_or_else(|| ParseError::malformed(P, "password is not base64"))?;
    let identifier = required_secret(P, Some(&password), "password")?;

    let name = params.and_then(|p| {
        p.split('&')
            .find_map(|kv| kv.strip_prefix("remarks="))
            .and_then(decode_base64_any)
            .and_then(|b| String::from_utf8(b).ok())
            .filter(|s| !s.trim().is_empty())
    });

    Ok(ParsedLink {
        host,
        port,
        identifier,
        security: SecurityInfo {
            security: lower(Some(obfs)).map(|o| format!("obfs:{o}")),
            encryption: lower(Some(method)),
            sni: None,
            insecure: false,
        },
        network: Some("tcp".into()),
        name,
    })
}

// --- QUIC family ---

fn quic_security(parts: &LinkParts) -> SecurityInfo {
    SecurityInfo {
        security: Some("tls".into()),
        encryption: lower(parts.param(&["obfs"])),
        sni: lower(parts.param(&["sni", "peer"])),
        insecure: parts.flag(&["insecure", "allowinsecure", "allow_insecure"]),
    }
}

fn parse_hysteria(rest: &str) -> Result<ParsedLink, ParseError> {
    const P: Protocol = Protocol::Hysteria;
    let parts = split_link(P, rest)?;
    let identifier = required_secret(P, parts.param(&["auth", "auth_str"]), "auth")?;
    Ok(ParsedLink {
        identifier,
        security: quic_security(&parts),
        network: lower(parts.param(&["protocol"])).or(Some("udp".into())),
        name: parts.fragment.clone(),
        host: parts.host,
        port: parts.port,
    })
}

fn parse_hysteria2(rest: &str) -> Result<ParsedLink, ParseError> {
    const P: Protocol = Protocol::Hysteria2;
    let parts = split_link(P, rest)?;
    let identifier = required_secret(P, parts.userinfo.as_deref(), "auth")?;
    Ok(ParsedLink {
        identifier,
        security: quic_security(&parts),
        network: Some("udp".into()),
        name: parts.fragment.clone(),
        host: parts.host,
        port: parts.port,
    })
}

fn parse_tuic(rest: &str) -> Result<ParsedLink, ParseError> {
    const P: Protocol = Protocol::Tuic;
    let parts = split_link(P, rest)?;
    let userinfo = parts.userinfo.as_deref().unwrap_or_default();
    let (uuid, password) = userinfo
        .split_once(':')
        .ok_or_else(|| ParseError::malformed(P, "userinfo lacks uuid:password"))?;
    let identifier = canonical_uuid(P, uuid)?;
    required_secret(P, Some(password), "password")?;
    let mut security = quic_security(&parts);
    security.encryption = lower(parts.param(&["congestion_control"]));
    Ok(ParsedLink {
        identifier,
        security,
        network: Some("udp".into()),
        name: parts.fragment.clone(),
        host: parts.host,
        port: parts.port,
    })
}

// --- wireguard ---

fn wireguard_key(s: &str) -> bool {
    decode_base64_any(s).is_some_and(|b| b.len() == 32)
}

fn parse_wireguard(rest: &str) -> Result<ParsedLink, ParseError> {
    const P: Protocol = Protocol::Wireguard;
    let parts = split_link(P, rest)?;
    let private_key = required_secret(P, parts.userinfo.as_deref(), "private key")?;
    if !wireguard_key(&private_key) {
        return Err(ParseError::malformed(P, "private key is not a 32-byte base64 key"));
    }
    let peer = parts
        .param(&["publickey", "public_key", "peer_public_key"])
        .ok_or_else(|| ParseError::malformed(P, "missing publickey"))?;
    if !wireguard_key(peer) {
        return Err(ParseError::malformed(P, "publickey is not a 32-byte base64 key"));
    }
    Ok(ParsedLink {
        identifier: private_key,
        security: SecurityInfo {
            security: Some("noise".into()),
            encryption: Some("chacha20-poly1305".into()),
            sni: None,
            insecure: false,
        },
        network: Some("udp".into()),
        name: parts.fragment.clone(),
        host: parts.host,
        port: parts.port,
    })
}
