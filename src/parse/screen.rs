// src/parse/screen.rs
//! Content-safety screening applied before a line is accepted.
//!
//! Rejects script injection markers, SQL metacharacters combined with SQL
//! statements, path traversal, and hosts on the suspicious-TLD or block lists.
//! Every check runs on both the raw text and its percent-decoded form.

use once_cell::sync::OnceCell;
use regex::Regex;
use std::net::IpAddr;

use super::link::percent_decode;
use crate::config::ScreeningSettings;
use crate::error::ParseError;
use crate::types::normalize_host;

const SCRIPT_MARKERS: [&str; 5] = ["<script", "javascript:", "vbscript:", "onerror=", "onload="];
const TRAVERSAL_MARKERS: [&str; 5] = ["../", "..\\", "%2e%2e%2f", "%2e%2e/", "..%2f"];

fn sql_meta() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r#"('|"|;|--|/\*)"#).expect("sql meta regex"))
}

fn sql_statement() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(union\s+(all\s+)?select|select\s+\S+.*\s+from|insert\s+into|drop\s+(table|database)|delete\s+from|update\s+\w+\s+set|exec(ute)?\s*\(|(or|and)\s+\d+\s*=\s*\d+)",
        )
        .expect("sql statement regex")
    })
}

#[derive(Debug, Clone)]
pub struct Screener {
    suspicious_tlds: Vec<String>,
    blocked_hosts: Vec<String>,
    reject_local_hosts: bool,
    max_line_len: usize,
}

impl Default for Screener {
    fn default() -> Self {
        Self::from_settings(&ScreeningSettings::default())
    }
}

impl Screener {
    pub fn from_settings(s: &ScreeningSettings) -> Self {
        let suspicious_tlds = s
            .suspicious_tlds
            .iter()
            .map(|t| t.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .map(|t| format!(".{t}"))
            .collect();
        let blocked_hosts = s
            .blocked_hosts
            .iter()
            .map(|h| normalize_host(h))
            .filter(|h| !h.is_empty())
            .collect();
        Self {
            suspicious_tlds,
            blocked_hosts,
            reject_local_hosts: s.reject_local_hosts,
            max_line_len: s.max_line_len,
        }
    }

    pub fn max_line_len(&self) -> usize {
        self.max_line_len
    }

    /// Injection screening for a raw line or a decoded payload.
    pub fn screen_text(&self, text: &str) -> Result<(), ParseError> {
        check_markers(text)?;
        if text.contains('%') {
            check_markers(&percent_decode(text))?;
        }
        Ok(())
    }

    /// Host screening after the link has been parsed.
    pub fn screen_host(&self, host: &str) -> Result<(), ParseError> {
        let h = normalize_host(host);

        if let Some(tld) = self.suspicious_tlds.iter().find(|t| h.ends_with(t.as_str())) {
            return Err(ParseError::SecurityRejected(format!(
                "host has suspicious tld {tld}"
            )));
        }
        if self
            .blocked_hosts
            .iter()
            .any(|b| h == *b || h.ends_with(&format!(".{b}")))
        {
            return Err(ParseError::SecurityRejected("host is blocklisted".into()));
        }
        if self.reject_local_hosts && is_local_host(&h) {
            return Err(ParseError::SecurityRejected(
                "host points at a local address".into(),
            ));
        }
        Ok(())
    }
}

fn check_markers(text: &str) -> Result<(), ParseError> {
    let lower = text.to_ascii_lowercase();
    if let Some(m) = SCRIPT_MARKERS.iter().find(|m| lower.contains(*m)) {
        return Err(ParseError::SecurityRejected(format!("script marker {m:?}")));
    }
    if TRAVERSAL_MARKERS.iter().any(|m| lower.contains(m)) {
        return Err(ParseError::SecurityRejected("path traversal sequence".into()));
    }
    if sql_meta().is_match(text) && sql_statement().is_match(text) {
        return Err(ParseError::SecurityRejected("sql injection pattern".into()));
    }
    Ok(())
}

fn is_local_host(h: &str) -> bool {
    if h == "localhost" || h.ends_with(".localhost") {
        return true;
    }
    match h.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            ip.is_loopback() || ip.is_unspecified() || ip.is_link_local() || ip.is_broadcast()
        }
        Ok(IpAddr::V6(ip)) => ip.is_loopback() || ip.is_unspecified(),
        Err(_) => false,
    }
}
