//! The short line hash used for anchor verification.

use sha1::Digest;
use sha1::Sha1;

/// Hash of a line body at a 1-based line number.
///
/// The value is the big-endian integer formed by the first three bytes of
/// `SHA1(utf8(body) || u32_le(line_no))`, rendered as six lowercase hex
/// digits. The hash is a safety check against stale anchors, not
/// authentication.
pub fn line_hash(line_no: u32, body: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(body.as_bytes());
    hasher.update(line_no.to_le_bytes());
    let digest = hasher.finalize();
    let value = (u32::from(digest[0]) << 16) | (u32::from(digest[1]) << 8) | u32::from(digest[2]);
    format!("{value:06x}")
}

/// Render content as the numbered listing shown to the diff producer:
/// one `N:H|body` line per content line.
pub fn render_numbered(content: &str) -> String {
    content
        .lines()
        .enumerate()
        .map(|(i, body)| {
            let line_no = (i + 1) as u32;
            format!("{line_no}:{}|{body}", line_hash(line_no, body))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_position_dependent() {
        let a = line_hash(1, "hello");
        assert_eq!(a, line_hash(1, "hello"));
        assert_ne!(a, line_hash(2, "hello"));
        assert_ne!(a, line_hash(1, "hello "));
        assert_eq!(a.len(), 6);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn numbered_listing_lines_up() {
        let listing = render_numbered("alpha\nbeta");
        let lines: Vec<&str> = listing.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with(&format!("1:{}|alpha", line_hash(1, "alpha"))));
        assert!(lines[1].starts_with(&format!("2:{}|beta", line_hash(2, "beta"))));
    }
}
