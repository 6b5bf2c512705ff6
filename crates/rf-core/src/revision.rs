// SPDX-License-Identifier: MIT OR Apache-2.0
//! Monotonic `rev-NNNN` revision labels.

/// Format a revision number as its zero-padded label.
///
/// ```
/// assert_eq!(rf_core::format_revision(3), "rev-0003");
/// ```
pub fn format_revision(n: u32) -> String {
    format!("rev-{n:04}")
}

/// Parse a `rev-NNNN` label back into its number.
pub fn revision_number(label: &str) -> Option<u32> {
    let digits = label.strip_prefix("rev-")?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// The label following the given current revision.
///
/// `None` (a fresh movie) advances to `rev-0001`.
pub fn next_revision(current: Option<&str>) -> String {
    let n = current.and_then(revision_number).unwrap_or(0);
    format_revision(n + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_zero_padded() {
        assert_eq!(format_revision(1), "rev-0001");
        assert_eq!(format_revision(42), "rev-0042");
        assert_eq!(format_revision(12345), "rev-12345");
    }

    #[test]
    fn parses_labels() {
        assert_eq!(revision_number("rev-0001"), Some(1));
        assert_eq!(revision_number("rev-0420"), Some(420));
        assert_eq!(revision_number("rev-"), None);
        assert_eq!(revision_number("rev-xyz"), None);
        assert_eq!(revision_number("manifest-0001"), None);
    }

    #[test]
    fn advances_from_none_and_from_labels() {
        assert_eq!(next_revision(None), "rev-0001");
        assert_eq!(next_revision(Some("rev-0001")), "rev-0002");
        assert_eq!(next_revision(Some("rev-0099")), "rev-0100");
    }
}
