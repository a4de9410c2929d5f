// src/config/sources.rs
//! Source set loading with field-level validation.
//!
//! TOML:
//! ```toml
//! [[sources]]
//! id = "mahdibland"
//! url = "https://raw.githubusercontent.com/.../sub_merge.txt"
//! tier = "premium"
//! weight = 1.0
//! expected_protocols = ["vmess", "vless"]
//! encoding = "base64"
//! ```
//! JSON: `{"sources": [ { ... } ]}` or a bare array of entries.

use anyhow::{anyhow, Context, Result};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::SourceSetError;
use crate::types::{ContentHint, Protocol, Source, SourceSet, SourceTier};

const ENV_PATH: &str = "AGGREGATOR_SOURCES_PATH";
const MAX_WEIGHT: f32 = 10.0;

/// Entry as written in the file. Everything optional so missing fields are
/// reported by name instead of as a generic serde error.
#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEntry {
    id: Option<String>,
    url: Option<String>,
    tier: Option<String>,
    weight: Option<f32>,
    #[serde(default)]
    expected_protocols: Vec<String>,
    encoding: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct RawFile {
    sources: Vec<RawEntry>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(untagged)]
enum RawJson {
    Wrapped(RawFile),
    Bare(Vec<RawEntry>),
}

/// Parse TOML text into a validated source set.
pub fn parse_sources_toml(s: &str) -> Result<SourceSet, SourceSetError> {
    let raw: RawFile = toml::from_str(s).map_err(|e| SourceSetError::Syntax(e.to_string()))?;
    validate_entries(raw.sources)
}

/// Parse JSON text into a validated source set.
pub fn parse_sources_json(s: &str) -> Result<SourceSet, SourceSetError> {
    let raw: RawJson =
        serde_json::from_str(s).map_err(|e| SourceSetError::Syntax(e.to_string()))?;
    let entries = match raw {
        RawJson::Wrapped(f) => f.sources,
        RawJson::Bare(v) => v,
    };
    validate_entries(entries)
}

/// Load a source set from an explicit path. Format chosen by extension.
pub fn load_sources_from(path: &Path) -> Result<SourceSet> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading sources from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let set = match ext.as_str() {
        "json" => parse_sources_json(&content),
        _ => parse_sources_toml(&content),
    }
    .with_context(|| format!("invalid source set in {}", path.display()))?;
    Ok(set)
}

/// Load the source set using env var + fallbacks:
/// 1) $AGGREGATOR_SOURCES_PATH
/// 2) config/sources.toml
/// 3) config/sources.json
pub fn load_sources_default() -> Result<SourceSet> {
    if let Ok(p) = std::env::var(ENV_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_sources_from(&pb);
        }
        return Err(anyhow!("{ENV_PATH} points to non-existent path"));
    }
    for candidate in ["config/sources.toml", "config/sources.json"] {
        let p = PathBuf::from(candidate);
        if p.exists() {
            return load_sources_from(&p);
        }
    }
    Err(anyhow!(
        "no source set found (set {ENV_PATH} or create config/sources.toml)"
    ))
}

fn validate_entries(entries: Vec<RawEntry>) -> Result<SourceSet, SourceSetError> {
    if entries.is_empty() {
        return Err(SourceSetError::Empty);
    }

    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut sources = Vec::with_capacity(entries.len());

    for (index, e) in entries.into_iter().enumerate() {
        let id = e
            .id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SourceSetError::field(index, "id", "missing or empty"))?;
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(SourceSetError::field(
                index,
                "id",
                format!("{id:?} may only contain [A-Za-z0-9._-]"),
            ));
        }
        if !seen_ids.insert(id.clone()) {
            return Err(SourceSetError::DuplicateId { index, id });
        }

        let url = e
            .url
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SourceSetError::field(index, "url", "missing or empty"))?;
        let parsed = reqwest::Url::parse(&url)
            .map_err(|err| SourceSetError::field(index, "url", format!("invalid url: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(SourceSetError::field(
                index,
                "url",
                format!("scheme {:?} is not http/https", parsed.scheme()),
            ));
        }
        if parsed.host_str().is_none() {
            return Err(SourceSetError::field(index, "url", "url has no host"));
        }

        let tier_raw = e
            .tier
            .ok_or_else(|| SourceSetError::field(index, "tier", "missing"))?;
        let tier = SourceTier::from_name(&tier_raw).ok_or_else(|| {
            SourceSetError::field(index, "tier", format!("unknown tier {tier_raw:?}"))
        })?;

        let weight = e.weight.unwrap_or(1.0);
        if !weight.is_finite() || !(0.0..=MAX_WEIGHT).contains(&weight) {
            return Err(SourceSetError::field(
                index,
                "weight",
                format!("{weight} is outside 0..={MAX_WEIGHT}"),
            ));
        }

        let mut expected_protocols = BTreeSet::new();
        for name in &e.expected_protocols {
            let p = Protocol::from_name(name).ok_or_else(|| {
                SourceSetError::field(
                    index,
                    "expected_protocols",
                    format!("unknown protocol {name:?}"),
                )
            })?;
            expected_protocols.insert(p);
        }

        let encoding = match e.encoding.as_deref() {
            None => ContentHint::Auto,
            Some(raw) => ContentHint::from_name(raw).ok_or_else(|| {
                SourceSetError::field(index, "encoding", format!("unknown encoding {raw:?}"))
            })?,
        };

        sources.push(Source {
            id,
            url,
            tier,
            weight,
            expected_protocols,
            encoding,
        });
    }

    Ok(SourceSet { sources })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_entries_are_validated() {
        let set = parse_sources_toml(
            r#"
[[sources]]
id = "alpha"
url = "https://example.org/sub.txt"
tier = "Premium"
weight = 1.5
expected_protocols = ["vless", "SS"]

[[sources]]
id = "beta"
url = "http://mirror.example.net/b64"
tier = "bulk"
encoding = "base64"
"#,
        )
        .unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.sources[0].tier, SourceTier::Premium);
        assert!(set.sources[0]
            .expected_protocols
            .contains(&Protocol::Shadowsocks));
        assert_eq!(set.sources[1].weight, 1.0);
        assert_eq!(set.sources[1].encoding, ContentHint::Base64);
    }

    #[test]
    fn unknown_tier_names_the_field() {
        let err = parse_sources_json(
            r#"[{"id":"a","url":"https://a.example/x","tier":"premium"},
                {"id":"b","url":"https://b.example/x","tier":"gold"}]"#,
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"sources[1].tier: unknown tier "gold""#
        );
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = parse_sources_json(
            r#"{"sources":[{"id":"a","url":"https://a.example/x","tier":"bulk"},
                           {"id":"a","url":"https://b.example/x","tier":"bulk"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, SourceSetError::DuplicateId { index: 1, .. }));
    }

    #[test]
    fn non_http_url_and_bad_weight_are_rejected() {
        let err = parse_sources_json(r#"[{"id":"a","url":"ftp://a.example/x","tier":"bulk"}]"#)
            .unwrap_err();
        assert!(matches!(err, SourceSetError::Field { field: "url", .. }));

        let err = parse_sources_json(
            r#"[{"id":"a","url":"https://a.example/x","tier":"bulk","weight":-1}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, SourceSetError::Field { field: "weight", .. }));
    }

    #[test]
    fn unknown_fields_are_syntax_errors() {
        let err = parse_sources_json(
            r#"[{"id":"a","url":"https://a.example/x","tier":"bulk","colour":"red"}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, SourceSetError::Syntax(_)));
    }

    #[test]
    fn empty_set_is_rejected() {
        assert_eq!(parse_sources_json("[]").unwrap_err(), SourceSetError::Empty);
    }
}
