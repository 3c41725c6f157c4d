//! Log obfuscation for account identifiers and other sensitive strings.

/// Masks a string for logging, keeping only its tail visible.
///
/// Strings longer than five characters keep their last three characters,
/// shorter ones keep only the last character. The empty string stays empty.
///
/// ```rust
/// use voxline_client_core::obfuscate::obfuscate;
///
/// assert_eq!(obfuscate("sip:alice@example.com"), "******************com");
/// assert_eq!(obfuscate("bob"), "**b");
/// assert_eq!(obfuscate(""), "");
/// ```
pub fn obfuscate(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.is_empty() {
        return String::new();
    }

    let keep = if chars.len() > 5 { 3 } else { 1 };
    let masked = chars.len() - keep.min(chars.len());

    let mut out = "*".repeat(masked);
    out.extend(&chars[masked..]);
    out
}

/// Returns the value as-is, or obfuscated when the obfuscation flag is set.
pub fn log_value(obfuscation_enabled: bool, value: &str) -> String {
    if obfuscation_enabled {
        obfuscate(value)
    } else {
        value.to_string()
    }
}
