//! Reference-advertisement rewriting.
//!
//! Given the `info/refs?service=git-upload-pack` advertisement of a real
//! repository, produce one in which both `HEAD` and `refs/heads/master`
//! resolve to the requested branch or tag.  Every other line is copied
//! through untouched, so clients see the requested ref as the default
//! branch while the rest of the repository looks exactly like upstream.
//!
//! The advertisement looks like:
//!
//! ```text
//! PKT  "# service=git-upload-pack\n"
//! FLUSH
//! PKT  "<hash> HEAD\0<capabilities>\n"
//! PKT  "<hash> refs/heads/main\n"
//! PKT  "<hash> refs/tags/v1.0\n"
//! PKT  "<hash> refs/tags/v1.0^{}\n"
//! FLUSH
//! ```

use std::ops::Range;

use thiserror::Error;
use tracing::{debug, trace};

use crate::pktline::{self, PktLineError};

const HASH_LEN: usize = 40;
const HEAD: &[u8] = b"HEAD";
const MASTER: &[u8] = b"refs/heads/master";
const BRANCH_PREFIX: &[u8] = b"refs/heads/";
const TAG_PREFIX: &[u8] = b"refs/tags/";
const PEELED_SUFFIX: &[u8] = b"^{}";

#[derive(Debug, Error)]
pub enum RewriteError {
    /// The advertisement is not a well-formed packet-line stream.
    #[error(transparent)]
    Malformed(#[from] PktLineError),
    /// No `HEAD` line, or no line for the requested branch or tag.
    #[error("advertisement has no HEAD line or no matching branch or tag")]
    RefNotFound,
}

/// A `<hash> <name>[\0<capabilities>]\n` line.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RefLine<'a> {
    hash: &'a [u8],
    name: &'a [u8],
    capabilities: Option<&'a [u8]>,
}

impl<'a> RefLine<'a> {
    /// Parse a packet payload as a reference line.  Comment lines, lines whose
    /// hash is not exactly 40 hex digits and capability-only lines yield
    /// `None`.
    fn parse(payload: &'a [u8]) -> Option<Self> {
        if payload.first() == Some(&b'#') {
            return None;
        }
        let hash = payload.get(..HASH_LEN)?;
        if !hash.iter().all(u8::is_ascii_hexdigit) {
            return None;
        }
        let rest = payload.get(HASH_LEN..)?.strip_prefix(b" ")?;

        let name_end = rest
            .iter()
            .position(|&b| b == b'\n' || b == 0)
            .unwrap_or(rest.len());
        let capabilities = rest.iter().position(|&b| b == 0).map(|nul| {
            let caps = &rest[nul + 1..];
            caps.strip_suffix(b"\n").unwrap_or(caps)
        });

        Some(Self {
            hash,
            name: &rest[..name_end],
            capabilities,
        })
    }
}

/// The branch or tag the advertisement is remapped to.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target<'a> {
    hash: &'a [u8],
    /// Full ref name, peeled suffix removed.
    name: &'a [u8],
}

impl Target<'_> {
    fn is_branch(&self) -> bool {
        self.name.starts_with(BRANCH_PREFIX)
    }
}

/// Everything the rewrite needs from one pass over the advertisement.
#[derive(Debug, Default)]
struct Scan<'a> {
    head: Option<(Range<usize>, Option<&'a [u8]>)>,
    master: Option<Range<usize>>,
    target: Option<Target<'a>>,
}

fn scan<'a>(data: &'a [u8], git_ref: &str) -> Result<Scan<'a>, RewriteError> {
    let branch = [BRANCH_PREFIX, git_ref.as_bytes()].concat();
    let tag = [TAG_PREFIX, git_ref.as_bytes()].concat();

    let mut found = Scan::default();
    for record in pktline::records(data) {
        let record = record?;
        let Some(line) = RefLine::parse(record.payload(data)) else {
            continue;
        };
        trace!(name = %String::from_utf8_lossy(line.name), "ref line");

        if line.name == HEAD {
            found.head = Some((record.span.clone(), line.capabilities));
        }
        if line.name == MASTER {
            found.master = Some(record.span.clone());
        }

        // A peeled entry follows its tag object and overrides it.
        let name = line.name.strip_suffix(PEELED_SUFFIX).unwrap_or(line.name);
        if name == branch.as_slice() || name == tag.as_slice() {
            found.target = Some(Target {
                hash: line.hash,
                name,
            });
        }
    }
    Ok(found)
}

/// Rewrite `data` so that `HEAD` and `refs/heads/master` point at `git_ref`.
///
/// The original `HEAD` line is replaced in place, a fresh
/// `refs/heads/master` line follows it and the original master line, if
/// any, is dropped.  A `symref=` capability on the original `HEAD` line is
/// renamed to `oldref=` so clients do not follow the stale default branch.
pub fn rewrite_advertisement(data: &[u8], git_ref: &str) -> Result<Vec<u8>, RewriteError> {
    let scan = scan(data, git_ref)?;
    let (Some((head, head_caps)), Some(target)) = (scan.head, scan.target) else {
        return Err(RewriteError::RefNotFound);
    };

    debug!(
        resolved = %String::from_utf8_lossy(target.name),
        hash = %String::from_utf8_lossy(target.hash),
        replaces_master = scan.master.is_some(),
        "rewriting advertisement"
    );

    let caps = head_caps
        .map(|caps| neutralize_symref(caps, &target))
        .unwrap_or_default();

    let mut out = Vec::with_capacity(data.len() + 256);
    copy_without(&mut out, data, 0..head.start, scan.master.as_ref());

    let mut line = Vec::with_capacity(HASH_LEN + caps.len() + 64);
    line.extend_from_slice(target.hash);
    line.extend_from_slice(b" HEAD");
    if target.is_branch() {
        line.extend_from_slice(b"\0symref=HEAD:");
        line.extend_from_slice(target.name);
        if !caps.is_empty() {
            line.push(b' ');
            line.extend_from_slice(&caps);
        }
    } else if !caps.is_empty() {
        line.push(0);
        line.extend_from_slice(&caps);
    }
    line.push(b'\n');
    pktline::write_pkt_line(&mut out, &line)?;

    line.clear();
    line.extend_from_slice(target.hash);
    line.extend_from_slice(b" refs/heads/master\n");
    pktline::write_pkt_line(&mut out, &line)?;

    copy_without(&mut out, data, head.end..data.len(), scan.master.as_ref());
    Ok(out)
}

/// Copy `data[range]` into `out`, leaving out `skip` when it lies inside.
fn copy_without(out: &mut Vec<u8>, data: &[u8], range: Range<usize>, skip: Option<&Range<usize>>) {
    match skip {
        Some(skip) if range.start <= skip.start && skip.end <= range.end => {
            out.extend_from_slice(&data[range.start..skip.start]);
            out.extend_from_slice(&data[skip.end..range.end]);
        }
        _ => out.extend_from_slice(&data[range]),
    }
}

/// Rename every `symref=` capability to `oldref=`.
///
/// A leading `symref=HEAD:<target>` token is the one this module emits, so a
/// `HEAD` line that was already rewritten for the same branch drops it
/// instead of carrying it twice.  An upstream `HEAD` whose own leading symref
/// already names the requested branch loses it the same way, so no `oldref=`
/// appears; the re-emitted `symref=` names the same branch.
fn neutralize_symref(caps: &[u8], target: &Target<'_>) -> Vec<u8> {
    let mut caps = caps;
    if target.is_branch() {
        let own = [b"symref=HEAD:".as_slice(), target.name].concat();
        if let Some(rest) = caps.strip_prefix(own.as_slice()) {
            if rest.is_empty() {
                caps = rest;
            } else if let Some(rest) = rest.strip_prefix(b" ") {
                caps = rest;
            }
        }
    }
    replace_all(caps, b"symref=", b"oldref=")
}

fn replace_all(haystack: &[u8], from: &[u8], to: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut rest = haystack;
    while let Some(pos) = rest.windows(from.len()).position(|w| w == from) {
        out.extend_from_slice(&rest[..pos]);
        out.extend_from_slice(to);
        rest = &rest[pos + from.len()..];
    }
    out.extend_from_slice(rest);
    out
}
