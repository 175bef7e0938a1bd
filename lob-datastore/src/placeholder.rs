//! The placeholder codec: the two filter directions between real LOB
//! content and the 49 byte stand-in committed to the repository.

use std::io::{Read, Write};

use anyhow::{format_err, Error};
use lazy_static::lazy_static;
use regex::bytes::Regex;

use crate::error::StoreError;
use crate::lob_info::LobInfo;
use crate::store::ChunkStore;
use crate::SHA_HEX_LEN;

/// Leading marker of a placeholder line.
pub const PLACEHOLDER_PREFIX: &str = "git-lob: ";

/// Exact byte length of a placeholder: prefix plus 40 hex characters,
/// no trailing newline. Any file of a different size cannot be a
/// placeholder, which makes the length a cheap first test.
pub const PLACEHOLDER_LEN: usize = PLACEHOLDER_PREFIX.len() + SHA_HEX_LEN;

lazy_static! {
    static ref PLACEHOLDER_RE: Regex =
        Regex::new(r"^git-lob: ([0-9a-fA-F]{40})$").unwrap();
}

/// Render the placeholder for a content hash.
pub fn format_placeholder(sha: &str) -> String {
    format!("{}{}", PLACEHOLDER_PREFIX, sha)
}

/// Parse exactly [PLACEHOLDER_LEN] bytes into the embedded content
/// hash, lowercased. Anything else, including longer or shorter input,
/// is not a placeholder.
pub fn parse_placeholder(data: &[u8]) -> Option<String> {
    if data.len() != PLACEHOLDER_LEN {
        return None;
    }
    let caps = PLACEHOLDER_RE.captures(data)?;
    let sha = std::str::from_utf8(&caps[1]).ok()?;
    Some(sha.to_lowercase())
}

/// Outcome of a [clean] run.
pub enum CleanOutcome {
    /// The input already was a placeholder and passed through unchanged.
    Passthrough,
    /// Real content was ingested into the store.
    Stored(LobInfo),
}

/// Outcome of a [smudge] run.
pub enum SmudgeOutcome {
    /// The input was not a placeholder and passed through unchanged.
    Passthrough,
    /// A placeholder was replaced by the stored content.
    Expanded(LobInfo),
    /// A placeholder whose content is not in the store; the placeholder
    /// itself was emitted so checkout can fill it in later.
    Missing(String),
}

/// Fill `buf` from `input`, reading until the buffer is full or the
/// stream ends. Returns the number of bytes read.
///
/// This is a fixed-length read on purpose: binary content may contain
/// newlines (or none at all), so a delimiter-based peek would be wrong.
fn read_head(input: &mut dyn Read, buf: &mut [u8]) -> Result<usize, Error> {
    let mut total = 0;
    while total < buf.len() {
        match input.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(format_err!("reading filter input failed - {}", err)),
        }
    }
    Ok(total)
}

fn copy_stream(input: &mut dyn Read, output: &mut dyn Write) -> Result<u64, Error> {
    std::io::copy(input, output).map_err(|err| format_err!("filter copy failed - {}", err))
}

/// The commit-time direction: content in, placeholder out.
///
/// The first [PLACEHOLDER_LEN] bytes are peeked. If the whole input is
/// exactly a placeholder it passes through unchanged - the committer is
/// re-committing a placeholder whose content is not available locally.
/// Everything else is treated as real content, ingested into the store,
/// and replaced by the placeholder of its hash.
pub fn clean(
    store: &ChunkStore,
    input: &mut dyn Read,
    output: &mut dyn Write,
) -> Result<CleanOutcome, Error> {
    // one extra byte to distinguish "exactly a placeholder" from
    // content that merely starts like one
    let mut head = [0u8; PLACEHOLDER_LEN + 1];
    let len = read_head(input, &mut head)?;

    if len == PLACEHOLDER_LEN && parse_placeholder(&head[..len]).is_some() {
        output
            .write_all(&head[..len])
            .map_err(|err| format_err!("writing filter output failed - {}", err))?;
        return Ok(CleanOutcome::Passthrough);
    }

    let info = store.store(&head[..len], input)?;
    output
        .write_all(format_placeholder(&info.sha).as_bytes())
        .map_err(|err| format_err!("writing placeholder failed - {}", err))?;

    Ok(CleanOutcome::Stored(info))
}

/// The checkout-time direction: placeholder in, content out.
///
/// A placeholder whose content is locally present expands to the real
/// bytes. A placeholder whose content is missing passes through
/// unchanged so a later fetch plus checkout can complete it. Anything
/// that is not a placeholder passes through untouched.
pub fn smudge(
    store: &ChunkStore,
    input: &mut dyn Read,
    output: &mut dyn Write,
) -> Result<SmudgeOutcome, Error> {
    let mut head = [0u8; PLACEHOLDER_LEN + 1];
    let len = read_head(input, &mut head)?;

    if len == PLACEHOLDER_LEN {
        if let Some(sha) = parse_placeholder(&head[..len]) {
            match store.retrieve(&sha, output) {
                Ok(info) => return Ok(SmudgeOutcome::Expanded(info)),
                Err(StoreError::NotFound { .. }) => {
                    log::debug!("content for {} not available locally, keeping placeholder", sha);
                    output
                        .write_all(&head[..len])
                        .map_err(|err| format_err!("writing filter output failed - {}", err))?;
                    return Ok(SmudgeOutcome::Missing(sha));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    output
        .write_all(&head[..len])
        .map_err(|err| format_err!("writing filter output failed - {}", err))?;
    copy_stream(input, output)?;

    Ok(SmudgeOutcome::Passthrough)
}
