use chrono::NaiveDate;
use serde::Serialize;

/// Which command variant a version-gated feature resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateBranch {
    /// Image released before the cutoff.
    Legacy,
    /// Image released on or after the cutoff, or of unknown release.
    Current,
}

/// Parse a `YYYY-MM-DD` image version tag.
pub fn parse_version_tag(tag: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(tag.trim(), "%Y-%m-%d").ok()
}

/// Date comparison that picks between two command generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionGate {
    cutoff: NaiveDate,
}

impl VersionGate {
    pub fn new(cutoff: NaiveDate) -> Self {
        Self { cutoff }
    }

    pub fn cutoff(&self) -> NaiveDate {
        self.cutoff
    }

    /// Legacy only for a tag that parses and is strictly before the cutoff.
    pub fn select(&self, tag: Option<&str>) -> GateBranch {
        let Some(raw) = tag else {
            return GateBranch::Current;
        };
        match parse_version_tag(raw) {
            Some(date) if date < self.cutoff => GateBranch::Legacy,
            Some(_) => GateBranch::Current,
            None => {
                tracing::warn!(tag = raw, "Unparseable image version tag, assuming a current release");
                GateBranch::Current
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> VersionGate {
        VersionGate::new(NaiveDate::from_ymd_opt(2022, 4, 4).unwrap())
    }

    #[test]
    fn before_cutoff_is_legacy() {
        assert_eq!(gate().select(Some("2021-01-01")), GateBranch::Legacy);
        assert_eq!(gate().select(Some("2022-04-03")), GateBranch::Legacy);
    }

    #[test]
    fn cutoff_day_is_current() {
        assert_eq!(gate().select(Some("2022-04-04")), GateBranch::Current);
    }

    #[test]
    fn after_cutoff_is_current() {
        assert_eq!(gate().select(Some("2023-01-01")), GateBranch::Current);
    }

    #[test]
    fn absent_tag_is_current() {
        assert_eq!(gate().select(None), GateBranch::Current);
    }

    #[test]
    fn malformed_tags_are_current() {
        for tag in ["", "buster", "2021-13-01", "01-01-2021", "2021/01/01"] {
            assert_eq!(gate().select(Some(tag)), GateBranch::Current, "tag {:?}", tag);
        }
    }

    #[test]
    fn surrounding_whitespace_is_ignored() {
        assert_eq!(parse_version_tag(" 2021-03-04\n"), NaiveDate::from_ymd_opt(2021, 3, 4));
    }
}
