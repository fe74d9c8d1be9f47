//! Table-set diffing
//!
//! Decides whether a changefeed's table list needs to change and, if so,
//! which tables to add and which to drop.

use std::collections::HashSet;

/// Minimal add/remove sets between two table lists
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableDiff {
    /// Tables in `desired` but not in `current`, in `desired` order
    pub to_add: Vec<String>,
    /// Tables in `current` but not in `desired`, in `current` order
    pub to_remove: Vec<String>,
}

impl TableDiff {
    /// Compute the diff between the current and the desired table list
    ///
    /// Order and duplicates in the inputs do not matter: the diff is empty
    /// exactly when both lists name the same set of tables.
    pub fn compute<C, D>(current: &[C], desired: &[D]) -> Self
    where
        C: AsRef<str>,
        D: AsRef<str>,
    {
        let current_set: HashSet<&str> = current.iter().map(AsRef::as_ref).collect();
        let desired_set: HashSet<&str> = desired.iter().map(AsRef::as_ref).collect();

        Self {
            to_add: missing_from(desired, &current_set),
            to_remove: missing_from(current, &desired_set),
        }
    }

    /// True when no table needs to be added or removed
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    /// Number of alter statements this diff turns into
    #[inline]
    pub fn len(&self) -> usize {
        self.to_add.len() + self.to_remove.len()
    }
}

/// Entries of `items` absent from `other`, first occurrence only
fn missing_from<T: AsRef<str>>(items: &[T], other: &HashSet<&str>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .iter()
        .map(AsRef::as_ref)
        .filter(|item| !other.contains(item) && seen.insert(*item))
        .map(str::to_string)
        .collect()
}

/// Split the comma-joined `topics` column into table names
pub fn parse_table_list(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diff(current: &[&str], desired: &[&str]) -> (Vec<String>, Vec<String>) {
        let d = TableDiff::compute(current, desired);
        (d.to_add, d.to_remove)
    }

    #[test]
    fn test_no_changes() {
        assert_eq!(
            diff(&["table1", "table2"], &["table1", "table2"]),
            (vec![], vec![])
        );
    }

    #[test]
    fn test_add_one_table() {
        let (add, remove) = diff(&["table1"], &["table1", "table2"]);
        assert_eq!(add, vec!["table2"]);
        assert!(remove.is_empty());
    }

    #[test]
    fn test_remove_one_table() {
        let (add, remove) = diff(&["table1", "table2"], &["table1"]);
        assert!(add.is_empty());
        assert_eq!(remove, vec!["table2"]);
    }

    #[test]
    fn test_add_and_remove() {
        let (add, remove) = diff(&["table1", "table2"], &["table1", "table3"]);
        assert_eq!(add, vec!["table3"]);
        assert_eq!(remove, vec!["table2"]);
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(diff(&[], &["table1"]), (vec!["table1".to_string()], vec![]));
        assert_eq!(diff(&["table1"], &[]), (vec![], vec!["table1".to_string()]));
        assert!(TableDiff::compute::<&str, &str>(&[], &[]).is_empty());
    }

    #[test]
    fn test_order_insensitive() {
        let d = TableDiff::compute(&["b", "a", "c"], &["c", "a", "b"]);
        assert!(d.is_empty());
        assert_eq!(d.len(), 0);
    }

    #[test]
    fn test_duplicates_are_collapsed() {
        let d = TableDiff::compute(&["a", "x", "x"], &["a", "b", "b", "c"]);
        assert_eq!(d.to_add, vec!["b", "c"]);
        assert_eq!(d.to_remove, vec!["x"]);
        assert_eq!(d.len(), 3);
    }

    #[test]
    fn test_parse_table_list() {
        assert_eq!(parse_table_list("table1,table2"), vec!["table1", "table2"]);
        assert_eq!(parse_table_list(" a , b ,"), vec!["a", "b"]);
        assert!(parse_table_list("").is_empty());
    }
}
