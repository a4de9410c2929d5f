// src/parse/link.rs
//! Tolerant splitter for `scheme://[userinfo@]host:port[/path][?query][#fragment]`.
//!
//! Published links are not RFC 3986 clean (raw `/`, `+` and `=` in passwords,
//! unencoded spaces in labels), so this splits on the last `@` instead of
//! relying on a strict URL parser.

use std::collections::HashMap;
use std::net::Ipv6Addr;

use crate::error::ParseError;
use crate::types::Protocol;

#[derive(Debug, Clone, Default)]
pub(crate) struct LinkParts {
    /// Percent-decoded userinfo, if any.
    pub userinfo: Option<String>,
    pub host: String,
    pub port: u16,
    /// Lowercased keys, percent-decoded values. First occurrence wins.
    pub query: HashMap<String, String>,
    pub fragment: Option<String>,
}

impl LinkParts {
    pub fn param(&self, names: &[&str]) -> Option<&str> {
        names
            .iter()
            .find_map(|n| self.query.get(*n))
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn flag(&self, names: &[&str]) -> bool {
        matches!(
            self.param(names).map(|v| v.to_ascii_lowercase()).as_deref(),
            Some("1" | "true" | "yes")
        )
    }
}

/// Split everything after `scheme://`.
pub(crate) fn split_link(protocol: Protocol, rest: &str) -> Result<LinkParts, ParseError> {
    let (before_frag, fragment) = match rest.split_once('#') {
        Some((a, f)) => (a, Some(f)),
        None => (rest, None),
    };
    let (before_query, query) = match before_frag.split_once('?') {
        Some((a, q)) => (a, Some(q)),
        None => (before_frag, None),
    };
    let (userinfo, host_part) = match before_query.rsplit_once('@') {
        Some((u, h)) => (Some(u), h),
        None => (None, before_query),
    };
    // Drop any path after the authority.
    let authority = host_part.split('/').next().unwrap_or_default();
    let (host, port) = split_host_port(protocol, authority)?;

    Ok(LinkParts {
        userinfo: userinfo.map(percent_decode),
        host,
        port,
        query: query.map(parse_query).unwrap_or_default(),
        fragment: fragment.map(percent_decode).filter(|f| !f.trim().is_empty()),
    })
}

/// `host:port`, `[v6]:port`. Port is required and must be 1..=65535.
pub(crate) fn split_host_port(protocol: Protocol, s: &str) -> Result<(String, u16), ParseError> {
    let s = s.trim();
    let (host, port_str) = if let Some(rest) = s.strip_prefix('[') {
        let (h, tail) = rest
            .split_once(']')
            .ok_or_else(|| ParseError::malformed(protocol, "unterminated ipv6 literal"))?;
        h.parse::<Ipv6Addr>()
            .map_err(|_| ParseError::malformed(protocol, "invalid ipv6 literal"))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| ParseError::malformed(protocol, "missing port"))?;
        (format!("[{h}]"), port)
    } else {
        let (h, p) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseError::malformed(protocol, "missing port"))?;
        (h.to_string(), p)
    };

    validate_host(protocol, &host)?;
    let port = parse_port(protocol, port_str)?;
    Ok((host, port))
}

pub(crate) fn parse_port(protocol: Protocol, s: &str) -> Result<u16, ParseError> {
    let n: u32 = s
        .trim()
        .parse()
        .map_err(|_| ParseError::malformed(protocol, format!("invalid port {s:?}")))?;
    if n == 0 || n > u16::MAX as u32 {
        return Err(ParseError::malformed(protocol, format!("port {n} out of range")));
    }
    Ok(n as u16)
}

pub(crate) fn validate_host(protocol: Protocol, host: &str) -> Result<(), ParseError> {
    if host.is_empty() {
        return Err(ParseError::malformed(protocol, "empty host"));
    }
    if host.starts_with('[') {
        return Ok(());
    }
    if host.len() > 253 {
        return Err(ParseError::malformed(protocol, "host too long"));
    }
    let ok = host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if !ok || host.starts_with('.') || host.starts_with('-') || host.contains("..") {
        return Err(ParseError::malformed(protocol, "invalid host"));
    }
    Ok(())
}

fn parse_query(q: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for pair in q.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        out.entry(percent_decode(k).to_ascii_lowercase())
            .or_insert_with(|| percent_decode(v));
    }
    out
}

/// Decode `%XX` escapes. `+` is kept literally: keys and passwords use it.
/// Invalid escapes pass through unchanged and invalid UTF-8 is replaced.
pub(crate) fn percent_decode(s: &str) -> String {
    let bytes = urlencoding::decode_binary(s.as_bytes());
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_full_link() {
        let p = split_link(
            Protocol::Trojan,
            "pa%2Fss@Example.org:443/?security=tls&SNI=cdn.example#my%20node",
        )
        .unwrap();
        assert_eq!(p.userinfo.as_deref(), Some("pa/ss"));
        assert_eq!(p.host, "Example.org");
        assert_eq!(p.port, 443);
        assert_eq!(p.param(&["sni"]), Some("cdn.example"));
        assert_eq!(p.fragment.as_deref(), Some("my node"));
    }

    #[test]
    fn password_with_at_and_slash() {
        let p = split_link(Protocol::Trojan, "a@b/c@h.example:8443").unwrap();
        assert_eq!(p.userinfo.as_deref(), Some("a@b/c"));
        assert_eq!(p.host, "h.example");
    }

    #[test]
    fn ipv6_and_port_bounds() {
        let p = split_link(Protocol::Vless, "id@[2001:db8::1]:443").unwrap();
        assert_eq!(p.host, "[2001:db8::1]");
        assert!(split_link(Protocol::Vless, "id@h.example:0").is_err());
        assert!(split_link(Protocol::Vless, "id@h.example:65536").is_err());
        assert!(split_link(Protocol::Vless, "id@h.example").is_err());
        assert!(split_link(Protocol::Vless, "id@:443").is_err());
    }

    #[test]
    fn percent_decode_keeps_plus_and_bad_escapes() {
        assert_eq!(percent_decode("a+b%20c%zz%4"), "a+b c%zz%4");
        assert_eq!(percent_decode("%E2%9C%93%ff"), "\u{2713}\u{fffd}");
    }
}
