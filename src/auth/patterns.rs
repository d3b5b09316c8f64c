//! Translation between user-facing topic patterns and their stored form.
//!
//! Users write `*` for "zero or more characters". The store matches
//! patterns with SQL `LIKE`, so `*` becomes `%`, and literal underscores
//! are escaped as `\_` (with `\` declared as the escape character in every
//! LIKE clause). The rewrite is applied at every storage boundary; nothing
//! outside this module deals with `%`.

/// Convert a user-facing pattern to its SQL LIKE form
pub fn to_sql_wildcard(pattern: &str) -> String {
    escape_underscore(&pattern.replace('*', "%"))
}

/// Convert a stored SQL LIKE pattern back to its user-facing form
pub fn from_sql_wildcard(pattern: &str) -> String {
    unescape_underscore(pattern).replace('%', "*")
}

/// Escape literal underscores so LIKE does not treat them as wildcards
pub fn escape_underscore(s: &str) -> String {
    s.replace('_', "\\_")
}

/// Remove underscore escaping from a stored topic
pub fn unescape_underscore(s: &str) -> String {
    s.replace("\\_", "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_to_sql_wildcard() {
        assert_eq!(to_sql_wildcard("alerts"), "alerts");
        assert_eq!(to_sql_wildcard("alerts*"), "alerts%");
        assert_eq!(to_sql_wildcard("*"), "%");
        assert_eq!(to_sql_wildcard("up_down"), "up\\_down");
        assert_eq!(to_sql_wildcard("up_down*"), "up\\_down%");
    }

    #[test]
    fn test_from_sql_wildcard() {
        assert_eq!(from_sql_wildcard("alerts%"), "alerts*");
        assert_eq!(from_sql_wildcard("up\\_down%"), "up_down*");
        assert_eq!(from_sql_wildcard("%"), "*");
    }

    proptest! {
        // Encode-then-decode is the identity on any valid user-facing pattern.
        #[test]
        fn prop_round_trip(pattern in "[A-Za-z0-9_*-]{1,64}") {
            prop_assert_eq!(from_sql_wildcard(&to_sql_wildcard(&pattern)), pattern);
        }
    }
}
