//! Certificate name matching for TLS server verification.
//!
//! When the engine reports a TLS identity mismatch, the configured host is
//! re-checked against the certificate's subject names with wildcard support:
//! a name matches if it has the same number of dot-separated labels as the
//! host and every label matches, where a label may contain a single `*`
//! standing for any (possibly empty) run of characters within that label.

/// Returns true if any of the certificate names matches the host.
pub fn is_wildcard_valid<S: AsRef<str>>(cert_names: &[S], host: &str) -> bool {
    cert_names.iter().any(|name| name_matches(name.as_ref(), host))
}

fn name_matches(name: &str, host: &str) -> bool {
    if name == host {
        return true;
    }

    let name_labels: Vec<&str> = name.split('.').collect();
    let host_labels: Vec<&str> = host.split('.').collect();

    // a wildcard never spans label boundaries
    if name_labels.len() != host_labels.len() {
        return false;
    }

    name_labels
        .iter()
        .zip(host_labels.iter())
        .all(|(pattern, label)| label_matches(pattern, label))
}

fn label_matches(pattern: &str, label: &str) -> bool {
    match pattern.find('*') {
        None => pattern == label,
        Some(pos) => {
            let prefix = &pattern[..pos];
            let suffix = &pattern[pos + 1..];
            label.len() >= prefix.len() + suffix.len()
                && label.starts_with(prefix)
                && label.ends_with(suffix)
        }
    }
}
