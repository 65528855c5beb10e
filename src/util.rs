use std::cmp::Ordering;

/// Try to enable ANSI escape sequence support on Windows consoles.
/// Returns true if enabling succeeded (or platform likely already supports ANSI), false otherwise.
#[cfg(windows)]
pub fn try_enable_ansi_on_windows() -> bool {
    enable_ansi_support::enable_ansi_support().is_ok()
}

// On non-Windows platforms the crate is not required and ANSI support is typically available
// by default in terminals; provide a no-op fallback to avoid referencing the optional crate.
#[cfg(not(windows))]
pub fn try_enable_ansi_on_windows() -> bool {
    false
}

/// Convert a byte count into a human readable string using IEC units (KiB/MiB/GiB).
pub fn human_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GiB", b / GB)
    } else if b >= MB {
        format!("{:.2} MiB", b / MB)
    } else if b >= KB {
        format!("{:.2} KiB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

/// Size in GiB rounded to two decimals, as recorded in large-file manifests.
pub fn round_gib(bytes: u64) -> f64 {
    let g = bytes as f64 / (1024.0 * 1024.0 * 1024.0);
    (g * 100.0).round() / 100.0
}

/// Normalize path separators to `/` so progress sets compare equal across
/// platforms. Listing paths from the transfer agent already use `/`; this
/// covers paths observed on local disk.
pub fn normalize_rel_path(p: &str) -> String {
    if p.contains('\\') { p.replace('\\', "/") } else { p.to_string() }
}

/// Natural order: runs of ASCII digits compare numerically, everything else
/// byte-wise. Guarantees `Part2 < Part10` and `Part1.zip < Part1_Split1.zip`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let (mut i, mut j) = (0usize, 0usize);
    while i < a.len() && j < b.len() {
        let (ca, cb) = (a[i], b[j]);
        if ca.is_ascii_digit() && cb.is_ascii_digit() {
            let si = i;
            while i < a.len() && a[i].is_ascii_digit() {
                i += 1;
            }
            let sj = j;
            while j < b.len() && b[j].is_ascii_digit() {
                j += 1;
            }
            // 去掉前导零再比较位数，位数相同比字典序 — strip leading zeros,
            // then compare by length, then lexicographically
            let da = trim_leading_zeros(&a[si..i]);
            let db = trim_leading_zeros(&b[sj..j]);
            let ord = da.len().cmp(&db.len()).then_with(|| da.cmp(db));
            if ord != Ordering::Equal {
                return ord;
            }
        } else {
            let ord = ca.cmp(&cb);
            if ord != Ordering::Equal {
                return ord;
            }
            i += 1;
            j += 1;
        }
    }
    (a.len() - i).cmp(&(b.len() - j)).then_with(|| a.len().cmp(&b.len()))
}

fn trim_leading_zeros(d: &[u8]) -> &[u8] {
    let mut k = 0;
    while k + 1 < d.len() && d[k] == b'0' {
        k += 1;
    }
    &d[k..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_bytes_units() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.00 KiB");
        assert_eq!(human_bytes(20 * 1024 * 1024 * 1024), "20.00 GiB");
    }

    #[test]
    fn round_gib_two_decimals() {
        assert_eq!(round_gib(32212254720), 30.0); // 30 GiB exactly
        assert_eq!(round_gib(1610612736), 1.5);
        assert_eq!(round_gib(0), 0.0);
    }

    #[test]
    fn natural_part_ordering() {
        let mut keys = vec![
            "pre/A_Part10.zip",
            "pre/A_Part2.zip",
            "pre/A_Part1_Split1.zip",
            "pre/A_Part1.zip",
            "pre/A_Part1_Split2.zip",
        ];
        keys.sort_by(|x, y| natural_cmp(x, y));
        assert_eq!(
            keys,
            vec![
                "pre/A_Part1.zip",
                "pre/A_Part1_Split1.zip",
                "pre/A_Part1_Split2.zip",
                "pre/A_Part2.zip",
                "pre/A_Part10.zip",
            ]
        );
    }

    #[test]
    fn natural_handles_leading_zeros_and_prefixes() {
        // 数值相等时较长的串排后 — numerically equal, longer string sorts later
        assert_eq!(natural_cmp("Part02", "Part2"), Ordering::Greater);
        assert_eq!(natural_cmp("Part2", "Part10"), Ordering::Less);
        assert_eq!(natural_cmp("Full.zip", "Full_Split1.zip"), Ordering::Less);
        assert_eq!(natural_cmp("abc", "abcd"), Ordering::Less);
    }

    #[test]
    fn normalize_backslashes() {
        assert_eq!(normalize_rel_path("a\\b\\c.txt"), "a/b/c.txt");
        assert_eq!(normalize_rel_path("a/b/c.txt"), "a/b/c.txt");
    }
}
