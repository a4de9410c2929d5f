// src/parse/mod.rs
//! Protocol parser: one candidate line → `Configuration` or `ParseError`.

mod link;
mod protocols;
pub mod screen;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use crate::config::ScreeningSettings;
use crate::error::ParseError;
use crate::types::{Configuration, Protocol};

pub use screen::Screener;

/// Short, stable handle for a line so logs never carry the raw config.
pub fn line_fingerprint(line: &str) -> String {
    let digest = Sha256::digest(line.as_bytes());
    digest.iter().take(6).map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, Default)]
pub struct Parser {
    screener: Screener,
}

impl Parser {
    pub fn new(screener: Screener) -> Self {
        Self { screener }
    }

    pub fn from_settings(s: &ScreeningSettings) -> Self {
        Self::new(Screener::from_settings(s))
    }

    /// Parse one line. The first structurally valid interpretation wins; there
    /// is no fallback to another protocol.
    pub fn parse(
        &self,
        line: &str,
        source_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Configuration, ParseError> {
        let line = line.trim();
        // Screening runs first so hostile lines are classified as such even
        // when they are not links at all.
        self.screener.screen_text(line)?;

        let (scheme, rest) = line
            .split_once("://")
            .ok_or_else(|| ParseError::UnsupportedScheme(String::new()))?;
        let protocol = Protocol::from_scheme(scheme)
            .ok_or_else(|| ParseError::UnsupportedScheme(scheme.to_ascii_lowercase()))?;

        if line.len() > self.screener.max_line_len() {
            return Err(ParseError::malformed(
                protocol,
                format!("line exceeds {} bytes", self.screener.max_line_len()),
            ));
        }

        let parsed = protocols::parse_link(protocol, rest, &self.screener)?;
        self.screener.screen_host(&parsed.host)?;
        if let Some(name) = &parsed.name {
            self.screener.screen_text(name)?;
        }

        Ok(Configuration {
            protocol,
            host: parsed.host,
            port: parsed.port,
            identifier: parsed.identifier,
            security: parsed.security,
            network: parsed.network,
            name: parsed.name,
            raw_uri: line.to_string(),
            source_id: source_id.to_string(),
            first_seen_at: now,
            quality_score: None,
            canonical_key: None,
        })
    }

    /// Parse every line of one source body and tally the outcomes.
    pub fn parse_lines<'a>(
        &self,
        lines: impl IntoIterator<Item = &'a str>,
        source_id: &str,
        expected: &BTreeSet<Protocol>,
        now: DateTime<Utc>,
    ) -> (Vec<Configuration>, ParseReport) {
        let mut report = ParseReport::default();
        let mut out = Vec::new();
        for line in lines {
            report.total += 1;
            match self.parse(line, source_id, now) {
                Ok(cfg) => {
                    if !expected.is_empty() && !expected.contains(&cfg.protocol) {
                        report.unexpected_protocol += 1;
                    }
                    report.accepted += 1;
                    out.push(cfg);
                }
                Err(e) => {
                    match &e {
                        ParseError::SecurityRejected(_) => report.security_rejected += 1,
                        ParseError::UnsupportedScheme(_) => report.unsupported += 1,
                        ParseError::Malformed { .. } => report.malformed += 1,
                    }
                    tracing::debug!(
                        target: "parse",
                        source = %source_id,
                        line = %line_fingerprint(line),
                        error = %e,
                        "line rejected"
                    );
                }
            }
        }
        (out, report)
    }
}

/// Per-source tally of one parse pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseReport {
    pub total: usize,
    pub accepted: usize,
    pub malformed: usize,
    pub unsupported: usize,
    pub security_rejected: usize,
    /// Accepted, but not among the source's declared protocols.
    pub unexpected_protocol: usize,
}

impl ParseReport {
    /// Share of lines rejected by content screening.
    pub fn security_ratio(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            self.security_rejected as f32 / self.total as f32
        }
    }

    /// Malformed in the error taxonomy includes unsupported schemes.
    pub fn malformed_total(&self) -> usize {
        self.malformed + self.unsupported
    }
}
