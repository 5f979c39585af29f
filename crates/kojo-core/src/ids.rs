//! Session identifiers and shell quoting.

use rand::Rng;

/// Generate a unique session ID: `s` followed by a random 64-bit value in hex.
pub fn generate_session_id() -> String {
    let n: u64 = rand::thread_rng().gen();
    format!("s{:016x}", n)
}

/// Single-quote a value for embedding in a shell command line.
///
/// Used for paths interpolated into mux shell strings (FIFO path, shell
/// path, tool path). Client-controlled values never go through a shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_prefixed_hex() {
        let id = generate_session_id();
        assert_eq!(id.len(), 17);
        assert!(id.starts_with('s'));
        assert!(id[1..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn session_ids_are_unique() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_ne!(a, b);
    }

    #[test]
    fn quote_plain_value() {
        assert_eq!(shell_quote("/tmp/kojo/x.pipe"), "'/tmp/kojo/x.pipe'");
    }

    #[test]
    fn quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
