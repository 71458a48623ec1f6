//! Ordering of image version strings.
//!
//! Registries hand us tags like `1.9`, `1.10`, `2.0_rc` or `latest` and we
//! must decide which is newest. Plain lexicographic order gets `1.10 < 1.9`
//! wrong, so tags are split into dot-separated tokens which compare
//! numerically when both sides are numbers. The comparator is configured
//! with a table of "latest" aliases (greater than any ordinary version) and
//! a table of release suffixes (`rc` before `GA` and so on).

use std::cmp::Ordering;
use std::collections::HashMap;

const NO_SUFFIX: &str = "";

/// Total order on version strings.
///
/// Build one with [`VersionComparator::builder`]; the default instance has
/// no aliases and no suffix table.
#[derive(Debug, Clone)]
pub struct VersionComparator {
    suffix_delimiter: char,
    latest: HashMap<String, i64>,
    suffix: HashMap<String, i64>,
}

/// Builder for [`VersionComparator`].
#[derive(Debug, Clone)]
pub struct Builder {
    latest: Vec<String>,
    suffix_delimiter: char,
    empty_suffix_last: bool,
    suffix: Vec<String>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            latest: Vec::new(),
            suffix_delimiter: '_',
            empty_suffix_last: true,
            suffix: Vec::new(),
        }
    }
}

impl Builder {
    /// Char which separates the version body from its suffix. Default `_`.
    pub fn suffix_delimiter(mut self, delimiter: char) -> Self {
        self.suffix_delimiter = delimiter;
        self
    }

    /// Whether an empty or absent suffix sorts after all known suffixes
    /// (`1.0` newer than `1.0_rc`). Default true.
    pub fn empty_suffix_last(mut self, last: bool) -> Self {
        self.empty_suffix_last = last;
        self
    }

    /// Add a string treated as the most recent version, like "latest" or
    /// "nightly". Later additions are greater.
    pub fn add_latest(mut self, item: impl Into<String>) -> Self {
        self.latest.push(item.into());
        self
    }

    /// Add a version suffix compared in adding order, like "rc" or "GA".
    pub fn add_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix.push(suffix.into());
        self
    }

    pub fn build(self) -> VersionComparator {
        let mut latest = HashMap::new();
        for (i, item) in self.latest.into_iter().enumerate() {
            latest.insert(item, i as i64);
        }
        let mut suffix = HashMap::new();
        for (i, item) in self.suffix.into_iter().enumerate() {
            suffix.insert(item, i as i64);
        }
        suffix.insert(
            NO_SUFFIX.to_string(),
            if self.empty_suffix_last {
                i64::MAX
            } else {
                i64::MIN
            },
        );
        VersionComparator {
            suffix_delimiter: self.suffix_delimiter,
            latest,
            suffix,
        }
    }
}

impl Default for VersionComparator {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl VersionComparator {
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Compare two optional versions. None is less than any version.
    pub fn compare_opt(&self, left: Option<&str>, right: Option<&str>) -> Ordering {
        match (left, right) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(l), Some(r)) => self.compare(l, r),
        }
    }

    pub fn compare(&self, left: &str, right: &str) -> Ordering {
        if left == right {
            return Ordering::Equal;
        }
        let lo = self.latest.get(left);
        let ro = self.latest.get(right);
        if lo.is_some() || ro.is_some() {
            return compare_orders(lo, ro);
        }
        let mut lparts = left.split('.');
        let mut rparts = right.split('.');
        loop {
            // Peek whether either side ran out of '.'-separated tokens; the
            // remaining tails then compare as end-tokens with suffix rules.
            let ltoken = lparts.next();
            let rtoken = rparts.next();
            let (ltoken, rtoken) = match (ltoken, rtoken) {
                (Some(l), Some(r)) => (l, r),
                (None, None) => return Ordering::Equal,
                (Some(_), None) => return Ordering::Greater,
                (None, Some(_)) => return Ordering::Less,
            };
            let lrest = lparts.clone().next().is_none();
            let rrest = rparts.clone().next().is_none();
            if lrest || rrest {
                let ltail = join_tail(ltoken, lparts);
                let rtail = join_tail(rtoken, rparts);
                return self.compare_ends(&ltail, &rtail);
            }
            let res = compare_tokens(ltoken, rtoken);
            if res != Ordering::Equal {
                return res;
            }
        }
    }

    /// Find the maximum of a tag list, if any.
    pub fn max<'a, I>(&self, tags: I) -> Option<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        tags.into_iter().max_by(|a, b| self.compare(a, b))
    }

    fn compare_ends(&self, ltoken: &str, rtoken: &str) -> Ordering {
        let (lp, ls) = split_suffix(ltoken, self.suffix_delimiter);
        let (rp, rs) = split_suffix(rtoken, self.suffix_delimiter);
        let res = compare_tokens(lp, rp);
        if res == Ordering::Equal && (ls.is_some() || rs.is_some()) {
            let ls = ls.unwrap_or(NO_SUFFIX);
            let rs = rs.unwrap_or(NO_SUFFIX);
            let lo = self.suffix.get(ls);
            let ro = self.suffix.get(rs);
            if lo.is_none() && ro.is_none() {
                return compare_strings(ls, rs);
            }
            return compare_orders(lo, ro);
        }
        res
    }
}

fn join_tail<'a>(first: &'a str, rest: std::str::Split<'a, char>) -> String {
    let mut tail = first.to_string();
    for part in rest {
        tail.push('.');
        tail.push_str(part);
    }
    tail
}

fn split_suffix(token: &str, delimiter: char) -> (&str, Option<&str>) {
    match token.find(delimiter) {
        Some(pos) => (&token[..pos], Some(&token[pos + delimiter.len_utf8()..])),
        None => (token, None),
    }
}

fn compare_orders(lo: Option<&i64>, ro: Option<&i64>) -> Ordering {
    match (lo, ro) {
        (None, _) => Ordering::Less,
        (_, None) => Ordering::Greater,
        (Some(l), Some(r)) => l.cmp(r),
    }
}

fn compare_tokens(ltoken: &str, rtoken: &str) -> Ordering {
    match (ltoken.parse::<i64>(), rtoken.parse::<i64>()) {
        (Ok(l), Ok(r)) => l.cmp(&r),
        _ => compare_strings(ltoken, rtoken),
    }
}

/// Lexicographic comparison truncated to its sign.
fn compare_strings(left: &str, right: &str) -> Ordering {
    left.cmp(right)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted<'a>(cmp: &VersionComparator, mut tags: Vec<&'a str>) -> Vec<&'a str> {
        tags.sort_by(|a, b| cmp.compare(a, b));
        tags
    }

    #[test]
    fn test_numeric_tokens() {
        let cmp = VersionComparator::default();
        assert_eq!(cmp.compare("1.10", "1.9"), Ordering::Greater);
        assert_eq!(cmp.compare("1.9", "1.10"), Ordering::Less);
        assert_eq!(cmp.compare("2.0", "2.0"), Ordering::Equal);
        assert_eq!(cmp.compare("10", "9"), Ordering::Greater);
    }

    #[test]
    fn test_token_count_divergence() {
        let cmp = VersionComparator::default();
        assert_eq!(cmp.compare("1.2.3", "1.2"), Ordering::Greater);
        assert_eq!(cmp.compare("1.2", "1.2.3"), Ordering::Less);
    }

    #[test]
    fn test_latest_alias() {
        let cmp = VersionComparator::builder().add_latest("latest").build();
        assert_eq!(cmp.compare("latest", "9.9.9"), Ordering::Greater);
        assert_eq!(cmp.compare("9.9.9", "latest"), Ordering::Less);
        assert_eq!(cmp.compare("latest", "latest"), Ordering::Equal);
    }

    #[test]
    fn test_latest_alias_order() {
        let cmp = VersionComparator::builder()
            .add_latest("latest")
            .add_latest("nightly")
            .build();
        // Later-added aliases are greater.
        assert_eq!(cmp.compare("nightly", "latest"), Ordering::Greater);
    }

    #[test]
    fn test_suffix_table() {
        let cmp = VersionComparator::builder()
            .add_suffix("rc")
            .add_suffix("GA")
            .build();
        assert_eq!(cmp.compare("1.0_rc", "1.0_GA"), Ordering::Less);
        assert_eq!(cmp.compare("1.0_GA", "1.0_rc"), Ordering::Greater);
    }

    #[test]
    fn test_empty_suffix_last() {
        let cmp = VersionComparator::builder().add_suffix("rc").build();
        assert_eq!(cmp.compare("1.0", "1.0_rc"), Ordering::Greater);

        let cmp = VersionComparator::builder()
            .add_suffix("rc")
            .empty_suffix_last(false)
            .build();
        assert_eq!(cmp.compare("1.0", "1.0_rc"), Ordering::Less);
    }

    #[test]
    fn test_unknown_suffixes_lexicographic() {
        let cmp = VersionComparator::default();
        assert_eq!(cmp.compare("1.0_aaa", "1.0_bbb"), Ordering::Less);
    }

    #[test]
    fn test_none_ordering() {
        let cmp = VersionComparator::default();
        assert_eq!(cmp.compare_opt(None, None), Ordering::Equal);
        assert_eq!(cmp.compare_opt(None, Some("1.0")), Ordering::Less);
        assert_eq!(cmp.compare_opt(Some("1.0"), None), Ordering::Greater);
    }

    #[test]
    fn test_sort_idempotent() {
        let cmp = VersionComparator::builder().add_latest("latest").build();
        let tags = vec!["1.10", "latest", "1.2", "0.9", "1.9"];
        let once = sorted(&cmp, tags.clone());
        let twice = sorted(&cmp, once.clone());
        assert_eq!(once, twice);
        assert_eq!(once, vec!["0.9", "1.2", "1.9", "1.10", "latest"]);
    }

    #[test]
    fn test_reconciler_tag_selection() {
        let tags = ["1.0", "1.1", "2.0_rc", "latest"];
        let with_alias = VersionComparator::builder()
            .add_latest("latest")
            .add_suffix("rc")
            .build();
        assert_eq!(with_alias.max(tags.iter().copied()), Some("latest"));

        let without_alias = VersionComparator::builder().add_suffix("rc").build();
        // "latest" is now an ordinary non-numeric token, smaller than the
        // numeric 2.0 family; 2.0 (no suffix) beats 2.0_rc.
        assert_eq!(
            without_alias.max(["1.0", "1.1", "2.0_rc", "2.0"].iter().copied()),
            Some("2.0")
        );
    }
}
