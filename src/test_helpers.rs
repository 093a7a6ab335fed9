//! Advertisement fixtures shared by unit tests.

use crate::pktline::{self, RecordKind};

pub const SHA_MAIN: &str = "8f1a2b3c4d5e6f708192a3b4c5d6e7f801234567";
pub const SHA_FEATURE: &str = "1234567890abcdef1234567890abcdef12345678";
pub const SHA_TAG: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
pub const SHA_TAG_PEELED: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

/// Encode one packet line.
pub fn pkt(line: &str) -> Vec<u8> {
    let mut out = Vec::new();
    pktline::write_pkt_line(&mut out, line.as_bytes()).unwrap();
    out
}

/// A smart HTTP `info/refs` body: service announcement, flush, the given
/// reference lines, flush.
pub fn advertisement(lines: &[String]) -> Vec<u8> {
    let mut out = pkt("# service=git-upload-pack\n");
    out.extend_from_slice(b"0000");
    for line in lines {
        out.extend(pkt(line));
    }
    out.extend_from_slice(b"0000");
    out
}

/// Payloads of every data packet except the service announcement.
pub fn ref_lines(data: &[u8]) -> Vec<String> {
    pktline::records(data)
        .map(|r| r.unwrap())
        .filter(|r| r.kind == RecordKind::Data)
        .map(|r| String::from_utf8_lossy(r.payload(data)).into_owned())
        .filter(|line| !line.starts_with('#'))
        .collect()
}

/// The advertisement most tests start from: `HEAD` on `main`, a feature
/// branch, `master`, and an annotated tag.
pub fn github_advertisement() -> Vec<u8> {
    advertisement(&[
        format!("{SHA_MAIN} HEAD\0multi_ack thin-pack side-band ofs-delta symref=HEAD:refs/heads/main agent=git/github-g1\n"),
        format!("{SHA_FEATURE} refs/heads/feature\n"),
        format!("{SHA_MAIN} refs/heads/main\n"),
        format!("{SHA_MAIN} refs/heads/master\n"),
        format!("{SHA_TAG} refs/tags/v1.0\n"),
        format!("{SHA_TAG_PEELED} refs/tags/v1.0^{{}}\n"),
    ])
}
