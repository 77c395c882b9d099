//! Case-insensitive matching of column, index and schema names.
//!
//! Names are folded with Unicode lowercasing, so `Ärger` and `ärger` name the
//! same column.

/// Returns the lookup form of a name.
pub fn fold(name: &str) -> String {
    name.to_lowercase()
}

/// Checks whether two names are the same, ignoring case.
pub fn same(a: &str, b: &str) -> bool {
    a == b || a.chars().flat_map(char::to_lowercase).eq(b.chars().flat_map(char::to_lowercase))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same() {
        assert!(same("LastStoredAt", "laststoredat"));
        assert!(same("Ärger", "äRGER"));
        assert!(same("ΣΟΦΙΑ", "σοφια"));
        assert!(!same("Ärger", "arger"));
        assert!(!same("id", "ids"));
        assert_eq!(fold("ÄRGER"), fold("ärger"));
    }
}
