/// Interpret a string value such as "1" or "no" as a boolean.
pub fn str_as_bool(s: &str) -> bool {
    match s {
        "1" | "true" | "t" | "yes" | "y" => true,
        "0" | "false" | "f" | "no" | "n" => false,
        _ => {
            eprintln!("Unrecognized boolean value \"{}\"", s);
            false
        }
    }
}

/// Return whether a feature flag controlled by an environment variable is
/// enabled.
pub fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .as_ref()
        .map(|s| str_as_bool(s))
        .unwrap_or(default)
}

/// Return the value of an integer-valued environment variable, or `default`
/// if the variable is unset or fails to parse.
pub fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::{env_usize, str_as_bool};

    #[test]
    fn test_str_as_bool() {
        assert!(str_as_bool("1"));
        assert!(str_as_bool("yes"));
        assert!(!str_as_bool("0"));
        assert!(!str_as_bool("unrecognized"));
    }

    #[test]
    fn test_env_usize_default() {
        assert_eq!(env_usize("GRADCACHE_TEST_UNSET_VAR", 15), 15);
    }
}
