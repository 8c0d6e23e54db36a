//! Capacity unit normalization.
//!
//! Raw capacities arrive from the control plane as kilobyte counts.
//! Every surface that displays a capacity goes through these helpers so
//! registry-derived and live-derived views agree on units.

/// Kilobytes per gigabyte (binary).
pub const KB_PER_GB: u64 = 1024 * 1024;

/// Convert a raw kilobyte count to whole gigabytes (truncating).
///
/// Pure and total: no failure mode, no hidden state.
pub fn kb_to_gb(kb: u64) -> u64 {
    kb / KB_PER_GB
}

/// Render a raw kilobyte count as a display string, e.g. `"16 GB"`.
pub fn format_gb(kb: u64) -> String {
    format!("{} GB", kb_to_gb(kb))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kb_to_gb_exact() {
        assert_eq!(kb_to_gb(16_777_216), 16);
        assert_eq!(kb_to_gb(1_048_576), 1);
    }

    #[test]
    fn test_kb_to_gb_truncates() {
        assert_eq!(kb_to_gb(1_048_575), 0);
        assert_eq!(kb_to_gb(1_572_864), 1);
    }

    #[test]
    fn test_format_gb() {
        assert_eq!(format_gb(16_777_216), "16 GB");
        assert_eq!(format_gb(0), "0 GB");
    }

    #[test]
    fn test_deterministic() {
        // Same input, same output, every time.
        let raw = 123_456_789;
        assert_eq!(kb_to_gb(raw), kb_to_gb(raw));
    }
}
