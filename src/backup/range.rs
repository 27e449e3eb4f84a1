//! Restore range resolution

use tracing::debug;

use crate::error::{BackupError, BackupResult};

/// Resolve `start..=end` against a repository's instance names
///
/// Empty or missing bounds are open: the range then starts at the oldest
/// or ends at the newest instance.
///
/// # Errors
///
/// - `EmptyRange` when the repository has no instances (checked first) or
///   `start` is after `end`
/// - `RangePoint` when a named bound is not an instance of the repository
pub fn resolve_range(
    repository: &str,
    instances: &[String],
    start: Option<&str>,
    end: Option<&str>,
) -> BackupResult<Vec<String>> {
    if instances.is_empty() {
        return Err(BackupError::EmptyRange(repository.to_string()));
    }

    let locate = |bound: Option<&str>, open: usize| -> BackupResult<usize> {
        match bound.filter(|b| !b.is_empty()) {
            None => Ok(open),
            Some(name) => instances
                .iter()
                .position(|i| i == name)
                .ok_or_else(|| BackupError::RangePoint(name.to_string())),
        }
    };

    let first = locate(start, 0)?;
    let last = locate(end, instances.len() - 1)?;

    if first > last {
        return Err(BackupError::EmptyRange(repository.to_string()));
    }

    debug!(
        repository,
        first = %instances[first],
        last = %instances[last],
        "resolved restore range"
    );
    Ok(instances[first..=last].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        vec!["a".into(), "b".into(), "c".into(), "d".into()]
    }

    #[test]
    fn test_open_bounds() {
        assert_eq!(resolve_range("r", &names(), None, None).unwrap(), names());
        assert_eq!(
            resolve_range("r", &names(), Some(""), Some("b")).unwrap(),
            vec!["a", "b"]
        );
        assert_eq!(
            resolve_range("r", &names(), Some("c"), None).unwrap(),
            vec!["c", "d"]
        );
        assert_eq!(
            resolve_range("r", &names(), Some("b"), Some("c")).unwrap(),
            vec!["b", "c"]
        );
    }

    #[test]
    fn test_empty_history_checked_first() {
        let err = resolve_range("r", &[], Some("name"), Some("name")).unwrap_err();
        assert!(matches!(err, BackupError::EmptyRange(_)));
    }

    #[test]
    fn test_unknown_point() {
        let err = resolve_range("r", &names(), Some("zzz"), None).unwrap_err();
        assert!(matches!(err, BackupError::RangePoint(_)));
        let err = resolve_range("r", &names(), None, Some("zzz")).unwrap_err();
        assert!(matches!(err, BackupError::RangePoint(_)));
    }

    #[test]
    fn test_reversed_range() {
        let err = resolve_range("r", &names(), Some("c"), Some("a")).unwrap_err();
        assert!(matches!(err, BackupError::EmptyRange(_)));
    }
}
