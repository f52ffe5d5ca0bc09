use std::collections::HashMap;
use std::sync::OnceLock;

use crate::protocol::constants::{UTF8MB4_UNICODE_CI, UTF8_GENERAL_CI};

/// Collation ids the driver may negotiate as the exchange charset.
pub fn collation_ids() -> &'static HashMap<&'static str, u8> {
    static COLLATIONS: OnceLock<HashMap<&'static str, u8>> = OnceLock::new();
    COLLATIONS.get_or_init(|| {
        HashMap::from([
            ("latin1", 8_u8),
            ("ascii", 11_u8),
            ("utf8", 33_u8),
            ("utf8_general_ci", 33_u8),
            ("binary", 63_u8),
            ("utf8mb4", 45_u8),
            ("utf8mb4_general_ci", 45_u8),
            ("utf8mb4_unicode_ci", 224_u8),
        ])
    })
}

/// Charset id for a configured `useCharacterEncoding` value, if recognized.
pub fn collation_for_encoding(name: &str) -> Option<u8> {
    collation_ids().get(name.to_lowercase().as_str()).copied()
}

fn is_utf8_family(server_language: u8) -> bool {
    matches!(server_language, 33 | 45 | 46 | 83 | 192..=247)
}

/// Pick the exchange charset from the server greeting. Servers up to 5.1
/// only know 3-byte utf8 (33); later servers get utf8mb4 (224) unless they
/// already advertise a utf8 collation worth keeping.
pub fn decide_language(server_language: u8, major: u32, minor: u32) -> u8 {
    let utf8mb4_supported = major > 5 || (major == 5 && minor > 1);
    if !utf8mb4_supported {
        return UTF8_GENERAL_CI;
    }
    if is_utf8_family(server_language) {
        server_language
    } else {
        UTF8MB4_UNICODE_CI
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn test_old_server_falls_back_to_utf8() {
        assert_eq!(decide_language(8, 5, 1), UTF8_GENERAL_CI);
        assert_eq!(decide_language(224, 5, 0), UTF8_GENERAL_CI);
    }

    #[test]
    pub fn test_modern_server_keeps_utf8_family() {
        assert_eq!(decide_language(45, 10, 6), 45);
        assert_eq!(decide_language(224, 8, 0), 224);
        // non-utf8 greeting upgraded to utf8mb4
        assert_eq!(decide_language(8, 10, 6), UTF8MB4_UNICODE_CI);
    }

    #[test]
    pub fn test_encoding_lookup() {
        assert_eq!(collation_for_encoding("UTF8MB4"), Some(45));
        assert_eq!(collation_for_encoding("nope"), None);
    }
}
