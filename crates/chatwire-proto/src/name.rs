//! File-name sanitization.
//!
//! Client-supplied names never reach the filesystem as-is: only the final
//! path component survives, characters that are illegal in a file name on
//! any common platform become `_`, and an empty result is replaced by a
//! generated name.

use rand::Rng;

/// Characters rejected in file names on at least one supported platform
const ILLEGAL_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Reduce a client-supplied name to a safe file name
///
/// # Example
///
/// ```
/// use chatwire_proto::sanitize_file_name;
///
/// assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
/// assert_eq!(sanitize_file_name("C:\\Users\\bob\\report.pdf"), "report.pdf");
/// assert_eq!(sanitize_file_name("what?.txt"), "what_.txt");
/// ```
#[must_use]
pub fn sanitize_file_name(raw: &str) -> String {
    let last = raw.rsplit(['/', '\\']).next().unwrap_or_default();

    let replaced: String = last
        .chars()
        .map(|c| {
            if c.is_control() || ILLEGAL_CHARS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect();

    let trimmed = replaced
        .trim_start()
        .trim_end_matches(|c: char| c == '.' || c.is_whitespace());
    if trimmed.is_empty() {
        generated_file_name()
    } else {
        trimmed.to_string()
    }
}

/// Whether `name` is already in sanitized form
///
/// Used to refuse lookups that would resolve outside a storage directory.
#[must_use]
pub fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty() && sanitize_file_name(name) == name
}

/// Unique placeholder for names that sanitize to nothing
#[must_use]
pub fn generated_file_name() -> String {
    let mut id = [0u8; 16];
    rand::thread_rng().fill(&mut id[..]);
    format!("file_{}.bin", hex::encode(id))
}
