//! Container inspection for downloaded artifacts.
//!
//! The walker sniffs the container format from magic bytes, descends into
//! zip/gzip/tar containers up to a fixed depth, and yields flat
//! `(name, bytes)` entries for the detector. Declared entry paths are
//! cleaned and unsafe ones never leave the walker.

use std::io::{Cursor, Read};

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;
use tracing::{debug, warn};

/// Maximum archive nesting the walker follows.
pub const MAX_DEPTH: usize = 10;

/// Directories that never contain interesting secrets but routinely blow up
/// scan time.
const BLOCKLIST: &[&str] = &["node_modules", "vendor", ".git"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    Zip,
    Gzip,
    Tar,
    Unknown,
}

/// Detect the container format from magic bytes.
pub fn sniff(bytes: &[u8]) -> ContainerFormat {
    if bytes.starts_with(b"PK\x03\x04") || bytes.starts_with(b"PK\x05\x06") {
        return ContainerFormat::Zip;
    }
    if bytes.starts_with(&[0x1f, 0x8b]) {
        return ContainerFormat::Gzip;
    }
    if bytes.len() > 262 && &bytes[257..262] == b"ustar" {
        return ContainerFormat::Tar;
    }
    ContainerFormat::Unknown
}

/// One scannable leaf produced by a walk. `chain` is outermost-first and
/// ends with the entry's own name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub chain: Vec<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum WalkError {
    #[error("corrupt zip container {name}: {source}")]
    Zip {
        name: String,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("corrupt {format} container {name}: {source}")]
    Io {
        name: String,
        format: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Walk one downloaded artifact. Unknown content falls through as a single
/// pseudo-entry. A corrupt outer container is an error (the artifact is
/// abandoned); corrupt inner entries are logged and skipped.
pub fn walk(name: &str, bytes: Vec<u8>, max_total: u64) -> Result<Vec<Entry>, WalkError> {
    let mut entries = Vec::new();
    let mut budget = max_total;
    walk_inner(name, bytes, 0, &[], &mut budget, &mut entries)?;
    Ok(entries)
}

fn walk_inner(
    name: &str,
    bytes: Vec<u8>,
    depth: usize,
    parent_chain: &[String],
    budget: &mut u64,
    out: &mut Vec<Entry>,
) -> Result<(), WalkError> {
    let mut chain = parent_chain.to_vec();
    chain.push(name.to_owned());

    match sniff(&bytes) {
        ContainerFormat::Zip => walk_zip(name, &bytes, depth, &chain, budget, out),
        ContainerFormat::Gzip => walk_gzip(name, &bytes, depth, &chain, budget, out),
        ContainerFormat::Tar => walk_tar(name, &bytes, depth, &chain, budget, out),
        ContainerFormat::Unknown => {
            out.push(Entry { name: name.to_owned(), chain, bytes });
            Ok(())
        }
    }
}

/// Recurse into an extracted child, charging the budget and enforcing the
/// depth cap. Inner corruption is contained here: the sibling loop goes on.
fn descend(
    child_name: &str,
    child_bytes: Vec<u8>,
    depth: usize,
    chain: &[String],
    budget: &mut u64,
    out: &mut Vec<Entry>,
) {
    if child_bytes.len() as u64 > *budget {
        warn!(entry = child_name, "entry exceeds the remaining size budget; skipping");
        return;
    }
    *budget -= child_bytes.len() as u64;

    let is_container = sniff(&child_bytes) != ContainerFormat::Unknown;
    if is_container && depth + 1 > MAX_DEPTH {
        warn!(entry = child_name, depth = depth + 1, "archive nesting exceeds depth cap; skipping");
        return;
    }
    if let Err(e) = walk_inner(child_name, child_bytes, depth + 1, chain, budget, out) {
        warn!(entry = child_name, error = %e, "corrupt nested container; skipping entry");
    }
}

fn walk_zip(
    name: &str,
    bytes: &[u8],
    depth: usize,
    chain: &[String],
    budget: &mut u64,
    out: &mut Vec<Entry>,
) -> Result<(), WalkError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|source| WalkError::Zip { name: name.to_owned(), source })?;

    // Declared uncompressed sum up front, before touching any entry data.
    let declared: u64 = (0..archive.len())
        .filter_map(|i| archive.by_index_raw(i).ok().map(|f| f.size()))
        .sum();
    if declared > *budget {
        warn!(container = name, declared, "declared uncompressed size exceeds the cap; skipping");
        return Ok(());
    }

    for index in 0..archive.len() {
        let mut file = match archive.by_index(index) {
            Ok(file) => file,
            Err(e) => {
                warn!(container = name, index, error = %e, "corrupt zip entry; skipping");
                continue;
            }
        };
        if file.is_dir() {
            continue;
        }
        let Some(entry_name) = safe_entry_path(file.name()) else {
            continue;
        };
        let mut child = Vec::with_capacity(file.size() as usize);
        if let Err(e) = file.read_to_end(&mut child) {
            warn!(container = name, entry = entry_name, error = %e, "failed to inflate zip entry; skipping");
            continue;
        }
        descend(&entry_name, child, depth, chain, budget, out);
    }
    Ok(())
}

fn walk_gzip(
    name: &str,
    bytes: &[u8],
    depth: usize,
    chain: &[String],
    budget: &mut u64,
    out: &mut Vec<Entry>,
) -> Result<(), WalkError> {
    // The gzip trailer declares the uncompressed length mod 2^32.
    if bytes.len() >= 4 {
        let declared = LittleEndian::read_u32(&bytes[bytes.len() - 4..]) as u64;
        if declared > *budget {
            warn!(container = name, declared, "declared uncompressed size exceeds the cap; skipping");
            return Ok(());
        }
    }

    let mut decoder = flate2::read::GzDecoder::new(bytes).take(*budget + 1);
    let mut child = Vec::new();
    decoder
        .read_to_end(&mut child)
        .map_err(|source| WalkError::Io { name: name.to_owned(), format: "gzip", source })?;
    if child.len() as u64 > *budget {
        warn!(container = name, "inflated stream exceeds the cap; skipping");
        return Ok(());
    }

    descend(&gzip_member_name(name), child, depth, chain, budget, out);
    Ok(())
}

fn walk_tar(
    name: &str,
    bytes: &[u8],
    depth: usize,
    chain: &[String],
    budget: &mut u64,
    out: &mut Vec<Entry>,
) -> Result<(), WalkError> {
    // First pass over the headers for the declared uncompressed sum.
    let mut sizing = tar::Archive::new(Cursor::new(bytes));
    let mut declared: u64 = 0;
    for entry in sizing
        .entries()
        .map_err(|source| WalkError::Io { name: name.to_owned(), format: "tar", source })?
    {
        if let Ok(entry) = entry {
            declared = declared.saturating_add(entry.size());
        }
    }
    if declared > *budget {
        warn!(container = name, declared, "declared uncompressed size exceeds the cap; skipping");
        return Ok(());
    }

    let mut archive = tar::Archive::new(Cursor::new(bytes));
    let entries = archive
        .entries()
        .map_err(|source| WalkError::Io { name: name.to_owned(), format: "tar", source })?;
    for entry in entries {
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(container = name, error = %e, "corrupt tar entry; skipping rest of container");
                break;
            }
        };
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let raw_path = match entry.path() {
            Ok(path) => path.to_string_lossy().into_owned(),
            Err(e) => {
                warn!(container = name, error = %e, "unreadable tar entry path; skipping");
                continue;
            }
        };
        let Some(entry_name) = safe_entry_path(&raw_path) else {
            continue;
        };
        let mut child = Vec::with_capacity(entry.size() as usize);
        if let Err(e) = entry.read_to_end(&mut child) {
            warn!(container = name, entry = entry_name, error = %e, "failed to read tar entry; skipping");
            continue;
        }
        descend(&entry_name, child, depth, chain, budget, out);
    }
    Ok(())
}

fn gzip_member_name(name: &str) -> String {
    if let Some(base) = name.strip_suffix(".tgz") {
        return format!("{base}.tar");
    }
    if let Some(base) = name.strip_suffix(".gz") {
        return base.to_owned();
    }
    name.to_owned()
}

/// Clean a declared entry path. Returns `None` (after a warn or a blocklist
/// debug line) when the entry must not be extracted: absolute paths, paths
/// escaping the extraction root via `..`, and blocklisted first segments.
fn safe_entry_path(raw: &str) -> Option<String> {
    let normalized = raw.replace('\\', "/");
    if normalized.starts_with('/') || has_windows_prefix(&normalized) {
        warn!(path = raw, "unsafe absolute entry path; skipping entry");
        return None;
    }
    let mut cleaned: Vec<&str> = Vec::new();
    for segment in normalized.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                if cleaned.pop().is_none() {
                    warn!(path = raw, "unsafe path escapes extraction root; skipping entry");
                    return None;
                }
            }
            other => cleaned.push(other),
        }
    }
    if cleaned.is_empty() {
        warn!(path = raw, "entry path cleans to nothing; skipping entry");
        return None;
    }
    if BLOCKLIST.contains(&cleaned[0]) {
        debug!(path = raw, "blocklisted path; skipping entry");
        return None;
    }
    Some(cleaned.join("/"))
}

fn has_windows_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic()
}
