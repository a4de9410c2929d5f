// src/publish.rs
//! Writes a cycle's ranked set in client-consumable formats:
//!
//! - `subscription.txt`: one link per line, rank order
//! - `subscription_base64.txt`: the same text, Base64 encoded
//! - `by_protocol/<protocol>.txt`: plain lists split by protocol
//! - `report.json`: the cycle's `CycleStats`

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::persist::write_json_atomic;
use crate::pipeline::AggregationResult;
use crate::types::Protocol;

#[derive(Debug, Clone, Default)]
pub struct PublishSummary {
    pub files: Vec<PathBuf>,
    pub configurations: usize,
}

fn write_text_atomic(path: &Path, text: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let tmp = path.with_extension("txt.tmp");
    let mut f = fs::File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
    f.write_all(text.as_bytes())?;
    fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

pub fn publish(result: &AggregationResult, out_dir: &Path) -> Result<PublishSummary> {
    let mut summary = PublishSummary {
        configurations: result.configurations.len(),
        ..Default::default()
    };

    let mut plain = String::new();
    let mut by_protocol: BTreeMap<Protocol, String> = BTreeMap::new();
    for c in &result.configurations {
        plain.push_str(&c.raw_uri);
        plain.push('\n');
        let bucket = by_protocol.entry(c.protocol).or_default();
        bucket.push_str(&c.raw_uri);
        bucket.push('\n');
    }

    let p = out_dir.join("subscription.txt");
    write_text_atomic(&p, &plain)?;
    summary.files.push(p);

    let p = out_dir.join("subscription_base64.txt");
    write_text_atomic(&p, &STANDARD.encode(plain.as_bytes()))?;
    summary.files.push(p);

    // Stale per-protocol files from earlier cycles would otherwise linger.
    let proto_dir = out_dir.join("by_protocol");
    for proto in Protocol::ALL {
        let p = proto_dir.join(format!("{}.txt", proto.as_str()));
        match by_protocol.get(&proto) {
            Some(text) => {
                write_text_atomic(&p, text)?;
                summary.files.push(p);
            }
            None if p.exists() => {
                fs::remove_file(&p).with_context(|| format!("removing {}", p.display()))?;
            }
            None => {}
        }
    }

    let p = out_dir.join("report.json");
    write_json_atomic(&p, &result.stats)?;
    summary.files.push(p);

    tracing::info!(
        target: "publish",
        dir = %out_dir.display(),
        configurations = summary.configurations,
        files = summary.files.len(),
        "published"
    );
    Ok(summary)
}
