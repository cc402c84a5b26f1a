//! Host identity matching
//!
//! Decides whether a name held by a TLS identity (a subject alternative name,
//! possibly a wildcard) covers a target host.

/// Returns `true` when `candidate` is authoritative for `target_host`.
///
/// Both names are split on `.` and must have the same number of labels. Only
/// the first label of the candidate may carry a `*`; a bare `*` matches any
/// first label, while `pre*`, `*suf` and `pre*suf` require the target's first
/// label to start with `pre` and end with `suf`. Every other label must be
/// equal as received (no case folding).
///
/// ```rust
/// use slinger_recorder::is_authoritative;
/// assert!(is_authoritative("*.example.com", "foo.example.com"));
/// assert!(!is_authoritative("*.example.com", "example.com"));
/// ```
pub fn is_authoritative(candidate: &str, target_host: &str) -> bool {
  let candidate_labels: Vec<&str> = candidate.split('.').collect();
  let target_labels: Vec<&str> = target_host.split('.').collect();
  if candidate_labels.len() != target_labels.len() {
    return false;
  }
  first_label_matches(candidate_labels[0], target_labels[0])
    && candidate_labels[1..] == target_labels[1..]
}

fn first_label_matches(pattern: &str, label: &str) -> bool {
  match pattern.find('*') {
    None => pattern == label,
    Some(position) => {
      let before = &pattern[..position];
      let after = &pattern[position + 1..];
      label.starts_with(before) && label.ends_with(after)
    }
  }
}

/// Strips a single trailing `.` from a fully qualified hostname.
///
/// ```rust
/// use slinger_recorder::domain;
/// assert_eq!(domain("example.com."), "example.com");
/// assert_eq!(domain("example.com"), "example.com");
/// ```
pub fn domain(hostname: &str) -> &str {
  hostname.strip_suffix('.').unwrap_or(hostname)
}
