//! Reservation path patterns
//!
//! Rules:
//! - exact paths match themselves
//! - a trailing `/` (`src/`) matches everything below that directory
//! - `*` matches within one segment; several `*` in a segment match in order
//! - `**` matches zero or more whole segments
//! - combinations such as `src/**/test.go` or `internal/*/cmd_*.go`
//!
//! Matching and overlap share one segment walker: a concrete path is just a
//! pattern without wildcards.

fn normalize(p: &str) -> String {
    let p = p.trim();
    let p = p.strip_prefix("./").unwrap_or(p);
    let p = p.trim_start_matches('/');
    if p.ends_with('/') {
        format!("{p}**")
    } else {
        p.to_string()
    }
}

fn segments(p: &str) -> Vec<&str> {
    p.split('/').filter(|s| !s.is_empty()).collect()
}

/// Whether two wildcard sequences can match a common input
///
/// `reach[i][j]` holds whether `a[i..]` and `b[j..]` intersect, filled from
/// the tails backwards, so cost is `O(len(a) * len(b))` no matter how many
/// stars either side carries.
fn sequences_intersect<T>(
    a: &[T],
    b: &[T],
    is_star: impl Fn(&T) -> bool,
    compatible: impl Fn(&T, &T) -> bool,
) -> bool {
    let (n, m) = (a.len(), b.len());
    let mut reach = vec![vec![false; m + 1]; n + 1];
    reach[n][m] = true;
    for i in (0..=n).rev() {
        for j in (0..=m).rev() {
            if i == n && j == m {
                continue;
            }
            reach[i][j] = if i < n && is_star(&a[i]) {
                reach[i + 1][j] || (j < m && reach[i][j + 1])
            } else if j < m && is_star(&b[j]) {
                reach[i][j + 1] || (i < n && reach[i + 1][j])
            } else if i == n || j == m {
                false
            } else {
                compatible(&a[i], &b[j]) && reach[i + 1][j + 1]
            };
        }
    }
    reach[0][0]
}

fn segment_intersect(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    sequences_intersect(&a, &b, |c| *c == '*', |x, y| x == y || *x == '?' || *y == '?')
}

fn segments_intersect(a: &[&str], b: &[&str]) -> bool {
    sequences_intersect(a, b, |s| *s == "**", |x, y| segment_intersect(x, y))
}

/// Whether `path` is covered by `pattern`
pub fn matches(pattern: &str, path: &str) -> bool {
    let pattern = normalize(pattern);
    let path = normalize(path);
    if pattern == path {
        return true;
    }
    segments_intersect(&segments(&pattern), &segments(&path))
}

/// Whether some path could be covered by both patterns
pub fn patterns_overlap(a: &str, b: &str) -> bool {
    matches(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_table() {
        let cases = [
            ("src/main.rs", "src/main.rs", true),
            ("src/main.rs", "src/lib.rs", false),
            ("src/", "src/a/b/c.rs", true),
            ("src/", "srcx/a.rs", false),
            ("internal/cli/*.go", "internal/cli/root.go", true),
            ("internal/cli/*.go", "internal/cli/sub/root.go", false),
            ("internal/*/cmd_*.go", "internal/cli/cmd_run.go", true),
            ("internal/*/cmd_*.go", "internal/cli/run.go", false),
            ("src/**/test.go", "src/test.go", true),
            ("src/**/test.go", "src/a/b/test.go", true),
            ("src/**/test.go", "src/a/b/other.go", false),
            ("**", "anything/at/all.txt", true),
            ("*_test_*.go", "a_test_b.go", true),
            ("*_test_*.go", "a_b_test.go", false),
            ("./src/main.rs", "/src/main.rs", true),
        ];
        for (pattern, path, expected) in cases {
            assert_eq!(matches(pattern, path), expected, "{pattern} vs {path}");
        }
    }

    #[test]
    fn test_patterns_overlap() {
        assert!(patterns_overlap("internal/cli/*.go", "internal/cli/*.go"));
        assert!(patterns_overlap("src/", "src/**/*.rs"));
        assert!(patterns_overlap("src/*.go", "src/main.*"));
        assert!(patterns_overlap("src/**", "src/a/b.rs"));
        assert!(!patterns_overlap("src/*.go", "docs/*.md"));
        assert!(!patterns_overlap("src/*.go", "src/*.rs"));
    }

    #[test]
    fn test_many_stars_finish_quickly() {
        let a = format!("{}b", "*a".repeat(14));
        let b = format!("{}c", "*a".repeat(14));
        assert!(!patterns_overlap(&a, &b));
        assert!(patterns_overlap(&a, &format!("{}*", "*a".repeat(14))));

        let deep_a = format!("{}x.rs", "**/".repeat(40));
        let deep_b = format!("{}y.rs", "**/".repeat(40));
        assert!(!patterns_overlap(&deep_a, &deep_b));
    }
}
