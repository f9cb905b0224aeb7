// Deterministic index and constraint names.

use sha2::{Digest, Sha256};

/// Hash `parts` joined by commas into a prefixed name no longer than
/// `max_len`.
pub fn hashed_name(prefix: &str, parts: &[&str], max_len: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parts.join(",").as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    let keep = max_len.saturating_sub(prefix.len()).min(digest.len());
    format!("{prefix}{}", &digest[..keep])
}

/// Name of an index on `table` over `columns`. Column order does not
/// matter.
pub fn build_index_name(table: &str, columns: &[&str], prefix: &str, max_len: usize) -> String {
    let mut sorted: Vec<&str> = columns.to_vec();
    sorted.sort_unstable();
    let mut parts = vec![table];
    parts.extend(sorted);
    hashed_name(prefix, &parts, max_len)
}

/// Name of the multi-column unique index of an entity type.
pub fn unique_index_name(etype: &str, attrs: &[String], max_len: usize) -> String {
    let columns: Vec<&str> = attrs.iter().map(String::as_str).collect();
    build_index_name(etype, &columns, "unique_", max_len)
}

/// Name of a CHECK constraint derived from a relation definition constraint.
pub fn check_constraint_name(
    subject: &str,
    rtype: &str,
    kind: &str,
    serialized: &str,
    max_len: usize,
) -> String {
    hashed_name("cstr", &[subject, rtype, kind, serialized], max_len)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn known_prefixes_and_lengths() {
        let name = build_index_name("cw_Person", &["cw_name"], "idx_", 63);
        assert!(name.starts_with("idx_"));
        assert_eq!(name.len(), 63);
        let full = build_index_name("cw_Person", &["cw_name"], "idx_", 128);
        assert_eq!(full.len(), 4 + 64);
        assert!(full.starts_with(&name));
    }

    #[test]
    fn different_tables_get_different_names() {
        assert_ne!(
            build_index_name("a", &["x"], "idx_", 63),
            build_index_name("b", &["x"], "idx_", 63)
        );
    }

    proptest! {
        #[test]
        fn column_order_is_irrelevant(mut cols in proptest::collection::vec("[a-z_]{1,12}", 1..6)) {
            let refs: Vec<&str> = cols.iter().map(String::as_str).collect();
            let forward = build_index_name("cw_T", &refs, "unique_", 63);
            cols.reverse();
            let refs: Vec<&str> = cols.iter().map(String::as_str).collect();
            prop_assert_eq!(forward, build_index_name("cw_T", &refs, "unique_", 63));
        }

        #[test]
        fn names_never_exceed_the_limit(table in "[A-Za-z]{1,40}", limit in 8usize..200) {
            prop_assert!(build_index_name(&table, &["c"], "idx_", limit).len() <= limit.max(4));
        }
    }
}
