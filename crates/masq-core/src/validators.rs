//! Input validators for profile fields

const PASSWORD_SPECIALS: &[char] = &['!', '?', '$', '#', '@', '(', ')', '-', '*'];

/// Letters, spaces, and hyphens only; must be non-empty.
pub fn is_name(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphabetic() || c == '-' || c == ' ')
}

/// Word characters plus `!?$#@()-*`; must be non-empty.
pub fn is_username(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || PASSWORD_SPECIALS.contains(&c))
}

/// At least 8 characters with one digit and one of `!?$#@()-*`.
pub fn is_password(s: &str) -> bool {
    s.chars().count() >= 8
        && s.chars().any(|c| c.is_ascii_digit())
        && s.chars().any(|c| PASSWORD_SPECIALS.contains(&c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_name() {
        assert!(is_name("John"));
        assert!(is_name("Jean-Pierre de la Tour"));
        assert!(!is_name(""));
        assert!(!is_name("J0hn"));
        assert!(!is_name("John!"));
    }

    #[test]
    fn test_is_username() {
        assert!(is_username("JDoe"));
        assert!(is_username("j_doe(42)*"));
        assert!(!is_username(""));
        assert!(!is_username("j doe"));
        assert!(!is_username("jdoe%"));
    }

    #[test]
    fn test_is_password() {
        assert!(is_password("s3cret-pass"));
        assert!(is_password("12345678!"));
        assert!(!is_password("short1!"));
        assert!(!is_password("nodigits!!"));
        assert!(!is_password("nospecial123"));
    }
}
