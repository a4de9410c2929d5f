// src/decode.rs
//! Content decoder: fetched bytes → candidate link lines.
//!
//! Handles gzip bodies, a single Base64 blob of newline-separated links, and
//! plain text. The detection order is gzip magic, then "does it already look
//! like links", then Base64.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use flate2::read::GzDecoder;
use std::io::Read;

use crate::error::DecodeError;
use crate::types::ContentHint;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Decoded body. `lines()` can be called any number of times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBody {
    text: String,
}

impl DecodedBody {
    /// Trimmed, non-empty lines that are not `#` or `//` comments.
    pub fn lines(&self) -> impl Iterator<Item = &str> + '_ {
        self.text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with("//"))
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

/// Decode a fetched body. `max_bytes` bounds the inflated size of gzip bodies.
pub fn decode(bytes: &[u8], hint: ContentHint, max_bytes: usize) -> Result<DecodedBody, DecodeError> {
    match hint {
        ContentHint::Gzip => {
            let inflated = gunzip(bytes, max_bytes)?;
            decode(&inflated, ContentHint::Auto, max_bytes)
        }
        ContentHint::Plain => {
            let text = to_text(bytes)?;
            Ok(DecodedBody { text })
        }
        ContentHint::Base64 => {
            let text = to_text(bytes)?;
            let decoded = decode_base64_blob(&text).ok_or(DecodeError::Unrecognized)?;
            Ok(DecodedBody { text: decoded })
        }
        ContentHint::Auto => decode_auto(bytes, max_bytes),
    }
}

fn decode_auto(bytes: &[u8], max_bytes: usize) -> Result<DecodedBody, DecodeError> {
    if bytes.starts_with(&GZIP_MAGIC) {
        let inflated = gunzip(bytes, max_bytes)?;
        // A gzip inside a gzip is not something sources publish.
        if inflated.starts_with(&GZIP_MAGIC) {
            return Err(DecodeError::Unrecognized);
        }
        return decode_auto(&inflated, max_bytes);
    }

    let text = to_text(bytes)?;
    if text.trim().is_empty() {
        return Ok(DecodedBody {
            text: String::new(),
        });
    }
    if looks_like_links(&text) {
        return Ok(DecodedBody { text });
    }
    if let Some(decoded) = decode_base64_blob(&text) {
        return Ok(DecodedBody { text: decoded });
    }
    Err(DecodeError::Unrecognized)
}

fn gunzip(bytes: &[u8], max_bytes: usize) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    let limit = (max_bytes as u64).saturating_add(1);
    GzDecoder::new(bytes)
        .take(limit)
        .read_to_end(&mut out)
        .map_err(|e| DecodeError::Gzip(e.to_string()))?;
    if out.len() > max_bytes {
        return Err(DecodeError::TooLarge(max_bytes));
    }
    Ok(out)
}

fn to_text(bytes: &[u8]) -> Result<String, DecodeError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::NotText)
}

/// At least one line carries a `scheme://` prefix.
fn looks_like_links(text: &str) -> bool {
    text.lines().take(200).any(|l| {
        let l = l.trim();
        match l.find("://") {
            Some(i) if i > 0 => l[..i].chars().all(|c| c.is_ascii_alphanumeric()),
            _ => false,
        }
    })
}

/// Decode a whole-body Base64 blob. Whitespace is ignored; standard and
/// URL-safe alphabets are accepted with or without padding. The result must
/// be UTF-8 and contain at least one link.
fn decode_base64_blob(text: &str) -> Option<String> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return None;
    }
    let bytes = decode_base64_any(&compact)?;
    let decoded = String::from_utf8(bytes).ok()?;
    looks_like_links(&decoded).then_some(decoded)
}

/// Try every common Base64 flavour. Shared with the protocol parsers.
pub(crate) fn decode_base64_any(s: &str) -> Option<Vec<u8>> {
    let s = s.trim();
    STANDARD
        .decode(s)
        .or_else(|_| STANDARD_NO_PAD.decode(s.trim_end_matches('=')))
        .or_else(|_| URL_SAFE.decode(s))
        .or_else(|_| URL_SAFE_NO_PAD.decode(s.trim_end_matches('=')))
        .ok()
}
