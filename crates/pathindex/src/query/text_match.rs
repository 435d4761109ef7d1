//! Text and wildcard matching utilities.

use memchr::memmem;

const WILDCARD_CHARS: &[char] = &['*', '?'];

/// True if `text` contains a wildcard character.
pub fn has_wildcards(text: &str) -> bool {
    text.contains(WILDCARD_CHARS)
}

/// Substring test on bytes.
pub fn contains_literal(haystack: &str, needle: &str) -> bool {
    needle.is_empty() || memmem::find(haystack.as_bytes(), needle.as_bytes()).is_some()
}

/// Literal text before the first wildcard of `pattern`.
pub fn leading_literal(pattern: &str) -> &str {
    match pattern.find(WILDCARD_CHARS) {
        Some(split) => &pattern[..split],
        None => pattern,
    }
}

/// Non-empty literal runs between wildcards.
pub fn literal_chunks(pattern: &str) -> impl Iterator<Item = &str> {
    pattern.split(WILDCARD_CHARS).filter(|chunk| !chunk.is_empty())
}

/// Matches a `*`/`?` pattern against the whole candidate.
///
/// `*` matches zero or more characters, `?` exactly one. Single-star
/// backtracking keeps this linear in practice.
pub fn wildcard_matches(pattern: &str, candidate: &str) -> bool {
    let pattern = pattern.chars().collect::<Vec<_>>();
    let candidate = candidate.chars().collect::<Vec<_>>();

    let (mut p, mut c) = (0usize, 0usize);
    // Position after the last `*`, and the candidate index it resumes from.
    let mut resume: Option<(usize, usize)> = None;

    while c < candidate.len() {
        match pattern.get(p) {
            Some('*') => {
                p += 1;
                resume = Some((p, c));
            }
            Some(&wanted) if wanted == '?' || wanted == candidate[c] => {
                p += 1;
                c += 1;
            }
            _ => match resume.as_mut() {
                Some((after_star, from)) => {
                    *from += 1;
                    p = *after_star;
                    c = *from;
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|ch| *ch == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_suffix_and_prefix_patterns() {
        assert!(wildcard_matches("*.csv", "report.csv"));
        assert!(wildcard_matches("*.csv", "a.csv"));
        assert!(!wildcard_matches("*.csv", "report.csv.bak"));

        assert!(wildcard_matches("report*", "report.csv"));
        assert!(wildcard_matches("report*", "report_final.txt"));
        assert!(!wildcard_matches("report*", "myreport.txt"));

        assert!(wildcard_matches("report*.csv", "report_2024.csv"));
        assert!(!wildcard_matches("report*.csv", "report_2024.txt"));
    }

    #[test]
    fn question_mark_matches_one_char() {
        assert!(wildcard_matches("a?c", "abc"));
        assert!(!wildcard_matches("a?c", "ac"));
        assert!(!wildcard_matches("a?c", "abbc"));
        assert!(wildcard_matches("??", "éü"));
    }

    #[test]
    fn star_matches_empty_and_everything() {
        assert!(wildcard_matches("*", ""));
        assert!(wildcard_matches("*", "anything at all"));
        assert!(wildcard_matches("a*b*c", "abc"));
        assert!(wildcard_matches("a*b*c", "a--b--c"));
        assert!(!wildcard_matches("a*b*c", "a--c--b"));
    }

    #[test]
    fn literal_helpers() {
        assert_eq!(leading_literal("report*.csv"), "report");
        assert_eq!(leading_literal("*.csv"), "");
        assert_eq!(leading_literal("plain"), "plain");
        assert_eq!(literal_chunks("*test*.txt").collect::<Vec<_>>(), vec!["test", ".txt"]);
        assert!(contains_literal("my report", "y r"));
        assert!(contains_literal("abc", ""));
        assert!(!contains_literal("abc", "abcd"));
        assert!(has_wildcards("a?") && !has_wildcards("a-b"));
    }
}
