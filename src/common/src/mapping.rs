//! Dataset mappings and filters.
//!
//! A [`DatasetMapFilter`] is a table of `(pattern, target)` rules over
//! dataset paths. Patterns are either exact (`pool/data`) or subtree
//! patterns (`pool/data<`, and `<` for the whole namespace). In mapping
//! mode a target is a dataset path, `<` (the matched path maps to itself)
//! or `!` (the path is excluded). In filter mode a target is `ok` or `!`.
//!
//! The most specific rule wins: the longest pattern, and at equal length an
//! exact pattern before a subtree pattern.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::dataset::DatasetPath;

const SUBTREE_SUFFIX: char = '<';
const TARGET_IDENTITY: &str = "<";
const TARGET_REJECT: &str = "!";
const TARGET_ACCEPT: &str = "ok";

/// Membership test over dataset paths.
pub trait DatasetFilter: Send + Sync + fmt::Debug {
    fn filter(&self, path: &DatasetPath) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Path(DatasetPath),
    Identity,
    Reject,
    Accept,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Path(path) => write!(f, "{path}"),
            Target::Identity => f.write_str(TARGET_IDENTITY),
            Target::Reject => f.write_str(TARGET_REJECT),
            Target::Accept => f.write_str(TARGET_ACCEPT),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    pattern: DatasetPath,
    subtree: bool,
    target: Target,
}

impl Rule {
    fn matches(&self, path: &DatasetPath) -> bool {
        if self.subtree {
            path.has_prefix(&self.pattern)
        } else {
            *path == self.pattern
        }
    }

    /// Where this rule sends the paths it matches, `None` for exclusions.
    fn image(&self) -> Option<DatasetPath> {
        match &self.target {
            Target::Path(target) => Some(target.clone()),
            Target::Identity => Some(self.pattern.clone()),
            Target::Reject | Target::Accept => None,
        }
    }

    fn apply(&self, path: &DatasetPath) -> Option<DatasetPath> {
        match &self.target {
            Target::Reject => None,
            Target::Accept | Target::Identity => Some(path.clone()),
            Target::Path(target) if self.subtree => path
                .trim_prefix(&self.pattern)
                .map(|rest| target.extend(&rest)),
            Target::Path(target) => Some(target.clone()),
        }
    }

    fn pattern_string(&self) -> String {
        if self.subtree {
            format!("{}{SUBTREE_SUFFIX}", self.pattern)
        } else {
            self.pattern.to_string()
        }
    }
}

/// Rule table mapping dataset paths between two namespaces.
///
/// Read-only once built; share it through an [`Arc`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatasetMapFilter {
    rules: Vec<Rule>,
    filter_mode: bool,
}

impl DatasetMapFilter {
    pub fn new(filter_mode: bool) -> Self {
        Self {
            rules: Vec::new(),
            filter_mode,
        }
    }

    /// Mapping that accepts every path and maps it to itself (`< -> <`).
    pub fn wildcard() -> Self {
        Self {
            rules: vec![Rule {
                pattern: DatasetPath::root(),
                subtree: true,
                target: Target::Identity,
            }],
            filter_mode: false,
        }
    }

    /// Build a table from `(pattern, target)` pairs.
    pub fn from_rules<'a, I>(rules: I, filter_mode: bool) -> Result<Self, MappingError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut table = Self::new(filter_mode);
        for (pattern, target) in rules {
            table.add(pattern, target)?;
        }
        Ok(table)
    }

    /// Add one rule, validating pattern and target syntax.
    pub fn add(&mut self, pattern: &str, target: &str) -> Result<(), MappingError> {
        let (path_part, subtree) = match pattern.strip_suffix(SUBTREE_SUFFIX) {
            Some(rest) => (rest, true),
            None => (pattern, false),
        };

        let path = DatasetPath::parse(path_part).map_err(|e| MappingError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        if path.is_root() && !subtree {
            return Err(MappingError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "empty pattern, use '<' to match every dataset".to_string(),
            });
        }

        let target = self.parse_target(pattern, target)?;
        self.push(Rule {
            pattern: path,
            subtree,
            target,
        })
    }

    fn parse_target(&self, pattern: &str, target: &str) -> Result<Target, MappingError> {
        let invalid = |reason: String| MappingError::InvalidTarget {
            pattern: pattern.to_string(),
            target: target.to_string(),
            reason,
        };

        if target == TARGET_REJECT {
            return Ok(Target::Reject);
        }
        if self.filter_mode {
            return if target == TARGET_ACCEPT {
                Ok(Target::Accept)
            } else {
                Err(invalid(format!(
                    "filter targets must be '{TARGET_ACCEPT}' or '{TARGET_REJECT}'"
                )))
            };
        }
        if target == TARGET_IDENTITY {
            return Ok(Target::Identity);
        }

        let path = DatasetPath::parse(target).map_err(|e| invalid(e.to_string()))?;
        if path.is_root() {
            return Err(invalid("target must not be empty".to_string()));
        }
        Ok(Target::Path(path))
    }

    fn push(&mut self, rule: Rule) -> Result<(), MappingError> {
        if self
            .rules
            .iter()
            .any(|r| r.pattern == rule.pattern && r.subtree == rule.subtree)
        {
            return Err(MappingError::DuplicateEntry(rule.pattern_string()));
        }
        self.rules.push(rule);
        Ok(())
    }

    fn most_specific(&self, path: &DatasetPath) -> Option<&Rule> {
        self.rules
            .iter()
            .filter(|r| r.matches(path))
            .max_by_key(|r| (r.pattern.len(), !r.subtree))
    }

    /// Counterpart of `path`, or `None` if the path is not in scope.
    pub fn map(&self, path: &DatasetPath) -> Option<DatasetPath> {
        self.most_specific(path)?.apply(path)
    }

    /// Filter view sharing this table.
    pub fn as_filter(self: &Arc<Self>) -> Arc<dyn DatasetFilter> {
        Arc::clone(self) as Arc<dyn DatasetFilter>
    }

    /// The reverse mapping, from targets back to sources.
    ///
    /// Fails if two source paths could reach the same target path or if this
    /// is a filter-mode table.
    pub fn invert(&self) -> Result<DatasetMapFilter, MappingError> {
        if self.filter_mode {
            return Err(MappingError::NotInvertible(
                "filter tables have no targets to invert".to_string(),
            ));
        }

        let images: Vec<(&Rule, DatasetPath)> = self
            .rules
            .iter()
            .filter_map(|rule| rule.image().map(|image| (rule, image)))
            .collect();
        self.check_collisions(&images)?;

        let mut inverse = DatasetMapFilter::new(false);
        for (rule, image) in &images {
            let target = match rule.target {
                Target::Identity => Target::Identity,
                _ => Target::Path(rule.pattern.clone()),
            };
            inverse
                .push(Rule {
                    pattern: image.clone(),
                    subtree: rule.subtree,
                    target,
                })
                .map_err(|e| MappingError::NotInvertible(e.to_string()))?;
        }

        // A rule nested inside a broader one takes its paths away from the
        // broader rule. Where the broader rule would have sent them, the
        // inverse must exclude, unless another rule maps there explicitly.
        for rule in &self.rules {
            let Some(covering) = self.covering_rule(rule) else {
                continue;
            };
            let Some(shadowed) = covering.apply(&rule.pattern) else {
                continue;
            };
            if rule.apply(&rule.pattern).as_ref() == Some(&shadowed) {
                continue;
            }
            if inverse
                .rules
                .iter()
                .any(|r| r.pattern == shadowed && r.subtree == rule.subtree)
            {
                continue;
            }
            inverse.rules.push(Rule {
                pattern: shadowed,
                subtree: rule.subtree,
                target: Target::Reject,
            });
        }

        Ok(inverse)
    }

    /// Filter accepting exactly the target paths of this mapping.
    pub fn inverted_filter(&self) -> Result<Arc<dyn DatasetFilter>, MappingError> {
        Ok(Arc::new(self.invert()?))
    }

    /// The most specific rule that matches `rule`'s pattern but is less
    /// specific than `rule` itself.
    fn covering_rule(&self, rule: &Rule) -> Option<&Rule> {
        let key = (rule.pattern.len(), !rule.subtree);
        self.rules
            .iter()
            .filter(|r| (r.pattern.len(), !r.subtree) < key && r.matches(&rule.pattern))
            .max_by_key(|r| (r.pattern.len(), !r.subtree))
    }

    fn check_collisions(&self, images: &[(&Rule, DatasetPath)]) -> Result<(), MappingError> {
        for (i, (a, a_image)) in images.iter().enumerate() {
            for (j, (b, b_image)) in images.iter().enumerate() {
                if i == j {
                    continue;
                }

                if !a.subtree && !b.subtree && a_image == b_image {
                    return Err(collision(a, b, b_image));
                }

                if !a.subtree {
                    continue;
                }
                let Some(rest) = b_image.trim_prefix(a_image) else {
                    continue;
                };

                // `source` is the path that `a` would send onto `b`'s image.
                let source = a.pattern.extend(&rest);
                if source == b.pattern {
                    continue;
                }
                let a_reaches = if b.subtree {
                    !self.rules.iter().any(|r| {
                        r.subtree
                            && r.pattern.len() > a.pattern.len()
                            && source.has_prefix(&r.pattern)
                    })
                } else {
                    self.most_specific(&source)
                        .is_some_and(|governing| std::ptr::eq(governing, *a))
                };
                if a_reaches {
                    return Err(collision(a, b, b_image));
                }
            }
        }
        Ok(())
    }
}

fn collision(a: &Rule, b: &Rule, target: &DatasetPath) -> MappingError {
    MappingError::NotInvertible(format!(
        "'{}' and '{}' both map to '{}'",
        a.pattern_string(),
        b.pattern_string(),
        target
    ))
}

impl DatasetFilter for DatasetMapFilter {
    fn filter(&self, path: &DatasetPath) -> bool {
        match self.most_specific(path) {
            Some(rule) => rule.target != Target::Reject,
            None => false,
        }
    }
}

impl fmt::Display for DatasetMapFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rules: Vec<String> = self
            .rules
            .iter()
            .map(|r| format!("{} => {}", r.pattern_string(), r.target))
            .collect();
        write!(f, "{{{}}}", rules.join(", "))
    }
}

/// Accepts snapshot names that start with the job's prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixFilter {
    prefix: String,
}

impl PrefixFilter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn matches(&self, snapshot_name: &str) -> bool {
        snapshot_name.starts_with(&self.prefix)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid target '{target}' for pattern '{pattern}': {reason}")]
    InvalidTarget {
        pattern: String,
        target: String,
        reason: String,
    },

    #[error("duplicate entry for pattern '{0}'")]
    DuplicateEntry(String),

    #[error("uninvertible mapping: {0}")]
    NotInvertible(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> DatasetPath {
        DatasetPath::parse(s).unwrap()
    }

    fn mapping(rules: &[(&str, &str)]) -> DatasetMapFilter {
        DatasetMapFilter::from_rules(rules.iter().copied(), false).unwrap()
    }

    #[test]
    fn test_subtree_mapping() {
        let m = mapping(&[("pool/data<", "backup/data")]);

        assert_eq!(m.map(&p("pool/data")), Some(p("backup/data")));
        assert_eq!(m.map(&p("pool/data/home/a")), Some(p("backup/data/home/a")));
        assert_eq!(m.map(&p("pool/other")), None);
        assert_eq!(m.map(&p("pool")), None);
    }

    #[test]
    fn test_specific_rule_beats_wildcard() {
        let m = mapping(&[("<", "<"), ("pool/vm", "backup/vm")]);

        assert_eq!(m.map(&p("pool/vm")), Some(p("backup/vm")));
        assert_eq!(m.map(&p("pool/home")), Some(p("pool/home")));
        // Children of the exact rule fall back to the wildcard.
        assert_eq!(m.map(&p("pool/vm/disk0")), Some(p("pool/vm/disk0")));
    }

    #[test]
    fn test_exact_beats_subtree_at_same_length() {
        let m = mapping(&[("pool/data<", "backup/data"), ("pool/data", "!")]);

        assert_eq!(m.map(&p("pool/data")), None);
        assert_eq!(m.map(&p("pool/data/a")), Some(p("backup/data/a")));
        assert!(!m.filter(&p("pool/data")));
        assert!(m.filter(&p("pool/data/a")));
    }

    #[test]
    fn test_longest_pattern_wins_regardless_of_order() {
        let forward = mapping(&[("pool<", "a"), ("pool/x/y<", "b")]);
        let reversed = mapping(&[("pool/x/y<", "b"), ("pool<", "a")]);

        for m in [forward, reversed] {
            assert_eq!(m.map(&p("pool/x/y/z")), Some(p("b/z")));
            assert_eq!(m.map(&p("pool/x/z")), Some(p("a/x/z")));
        }
    }

    #[test]
    fn test_exclusion_inside_subtree() {
        let m = mapping(&[("pool<", "backup"), ("pool/tmp<", "!")]);

        assert_eq!(m.map(&p("pool/tmp")), None);
        assert_eq!(m.map(&p("pool/tmp/cache")), None);
        assert_eq!(m.map(&p("pool/home")), Some(p("backup/home")));
    }

    #[test]
    fn test_add_rejects_malformed_rules() {
        let mut m = DatasetMapFilter::new(false);
        assert!(matches!(
            m.add("pool//x", "backup"),
            Err(MappingError::InvalidPattern { .. })
        ));
        assert!(matches!(
            m.add("", "backup"),
            Err(MappingError::InvalidPattern { .. })
        ));
        assert!(matches!(
            m.add("pool", "backup/<"),
            Err(MappingError::InvalidTarget { .. })
        ));
        m.add("pool", "backup").unwrap();
        assert!(matches!(
            m.add("pool", "other"),
            Err(MappingError::DuplicateEntry(_))
        ));
        // Same path as a subtree pattern is a distinct rule.
        m.add("pool<", "backup").unwrap();
    }

    #[test]
    fn test_filter_mode_targets() {
        let mut f = DatasetMapFilter::new(true);
        f.add("pool<", "ok").unwrap();
        f.add("pool/tmp", "!").unwrap();
        assert!(matches!(
            f.add("pool/x", "backup"),
            Err(MappingError::InvalidTarget { .. })
        ));

        assert!(f.filter(&p("pool/home")));
        assert!(!f.filter(&p("pool/tmp")));
        assert!(!f.filter(&p("other")));
    }

    #[test]
    fn test_as_filter_shares_mapping() {
        let m = Arc::new(mapping(&[("pool<", "backup")]));
        let filter = m.as_filter();

        assert!(filter.filter(&p("pool/a")));
        assert!(!filter.filter(&p("backup/a")));
        assert_eq!(Arc::strong_count(&m), 2);
    }

    #[test]
    fn test_inverted_filter_accepts_targets() {
        let m = mapping(&[("pool/data<", "backup/data"), ("pool/vm", "backup/vm0")]);
        let inv = m.inverted_filter().unwrap();

        assert!(inv.filter(&p("backup/data")));
        assert!(inv.filter(&p("backup/data/home")));
        assert!(inv.filter(&p("backup/vm0")));
        assert!(!inv.filter(&p("backup/vm0/child")));
        assert!(!inv.filter(&p("pool/data")));
    }

    #[test]
    fn test_invert_maps_back() {
        let m = mapping(&[("pool<", "backup"), ("pool/tmp<", "!"), ("pool/vm", "vms/a")]);
        let inv = m.invert().unwrap();

        assert_eq!(inv.map(&p("backup/home")), Some(p("pool/home")));
        assert_eq!(inv.map(&p("vms/a")), Some(p("pool/vm")));
        assert_eq!(inv.map(&p("backup/tmp/x")), None);
        assert!(!inv.filter(&p("backup/tmp")));
    }

    #[test]
    fn test_invert_round_trip() {
        let m = mapping(&[
            ("pool<", "backup"),
            ("pool/tmp<", "!"),
            ("pool/vm", "vms/a"),
            ("zroot/home<", "<"),
        ]);
        let twice = m.invert().unwrap().invert().unwrap();

        for path in [
            "pool",
            "pool/home",
            "pool/home/x",
            "pool/tmp",
            "pool/tmp/y",
            "pool/vm",
            "zroot/home",
            "zroot/home/u",
            "zroot",
            "other",
        ] {
            let path = p(path);
            assert_eq!(twice.map(&path), m.map(&path), "path {path}");
        }
    }

    #[test]
    fn test_identity_wildcard_inverts_to_itself() {
        let m = DatasetMapFilter::wildcard();
        let inv = m.invert().unwrap();

        assert_eq!(inv.map(&p("pool/a")), Some(p("pool/a")));
        assert!(inv.filter(&p("anything/at/all")));
    }

    #[test]
    fn test_invert_fails_on_shared_literal_target() {
        let m = mapping(&[("pool/a", "backup/x"), ("pool/b", "backup/x")]);
        let err = m.invert().unwrap_err();

        assert!(matches!(err, MappingError::NotInvertible(_)));
        assert!(err.to_string().contains("uninvertible mapping"));
        assert!(m.inverted_filter().is_err());
    }

    #[test]
    fn test_invert_fails_on_overlapping_subtree_image() {
        // pool/a/y and pool/b would both land on backup/y.
        let m = mapping(&[("pool/a<", "backup"), ("pool/b", "backup/y")]);
        assert!(matches!(m.invert(), Err(MappingError::NotInvertible(_))));

        // Identity wildcard plus a renaming rule: pool/b and pool/a both reach pool/b.
        let m = mapping(&[("<", "<"), ("pool/a", "pool/b")]);
        assert!(matches!(m.invert(), Err(MappingError::NotInvertible(_))));
    }

    #[test]
    fn test_invert_accepts_consistent_nested_subtrees() {
        let m = mapping(&[("pool<", "backup"), ("pool/x<", "backup/x"), ("pool/y", "backup/y")]);
        let inv = m.invert().unwrap();

        assert_eq!(inv.map(&p("backup/x/1")), Some(p("pool/x/1")));
        assert_eq!(inv.map(&p("backup/y")), Some(p("pool/y")));
    }

    #[test]
    fn test_invert_filter_table_fails() {
        let f = DatasetMapFilter::from_rules([("pool<", "ok")], true).unwrap();
        assert!(matches!(f.invert(), Err(MappingError::NotInvertible(_))));
    }

    #[test]
    fn test_prefix_filter() {
        let f = PrefixFilter::new("zrepl_");
        assert!(f.matches("zrepl_20240101_000000_000"));
        assert!(!f.matches("manual_backup"));
        assert_eq!(f.prefix(), "zrepl_");
    }
}
