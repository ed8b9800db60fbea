//! String formatting utilities.
//!
//! Transaction hashes are 64 hex characters and account addresses around 34;
//! log lines only carry a short prefix of either.

/// Truncates an identifier for display purposes.
///
/// Shows only the first 8 characters followed by ".." for longer strings.
pub fn truncate_id(id: &str) -> String {
	match id.char_indices().nth(8) {
		Some((cut, _)) => format!("{}..", &id[..cut]),
		None => id.to_string(),
	}
}
