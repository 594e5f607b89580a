use serde::{Deserialize, Serialize};

/// Check whether a peer or conversation ID appears on an allowlist.
///
/// Unlike an open policy, an empty list matches nobody: callers only consult
/// this once the policy says "allowlist".
/// Entries are matched case-insensitively and support `*` wildcards.
pub fn matches_allowlist(id: &str, allowlist: &[String]) -> bool {
    let id_lower = id.to_lowercase();
    allowlist.iter().any(|pattern| {
        let pat = pattern.trim().to_lowercase();
        if pat.contains('*') {
            glob_match(&pat, &id_lower)
        } else {
            pat == id_lower
        }
    })
}

/// Glob matching where `*` stands for any run of characters.
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    let (Some(first), Some(last)) = (parts.first(), parts.last()) else {
        return pattern == text;
    };
    if parts.len() == 1 {
        return pattern == text;
    }
    if !text.starts_with(first) {
        return false;
    }

    let mut pos = first.len();
    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match text[pos..].find(part) {
            Some(idx) => pos += idx + part.len(),
            None => return false,
        }
    }
    text.len() >= pos + last.len() && text[pos..].ends_with(last)
}

/// Direct-message access policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DmPolicy {
    /// Anyone can DM the bot.
    Open,
    /// Unknown senders go through the host's pairing flow.
    #[default]
    Pairing,
    /// Only senders on the allowlist.
    Allowlist,
}

/// Group access policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    /// Bot responds in all groups.
    #[default]
    Open,
    /// Only in groups on the allowlist.
    Allowlist,
    /// Groups disabled.
    Disabled,
}

impl DmPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Pairing => "pairing",
            Self::Allowlist => "allowlist",
        }
    }
}

impl GroupPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Allowlist => "allowlist",
            Self::Disabled => "disabled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allowlist_matches_nobody() {
        assert!(!matches_allowlist("anyone", &[]));
    }

    #[test]
    fn exact_match_ignores_case() {
        let list = vec!["manager4220".into(), "Ops01".into()];
        assert!(matches_allowlist("Manager4220", &list));
        assert!(matches_allowlist("ops01", &list));
        assert!(!matches_allowlist("manager9999", &list));
    }

    #[test]
    fn glob_prefix_and_suffix() {
        let list = vec!["cid*".into()];
        assert!(matches_allowlist("cidXYZ", &list));
        assert!(!matches_allowlist("user1", &list));

        let list = vec!["*==".into()];
        assert!(matches_allowlist("cidXYZ==", &list));
        assert!(!matches_allowlist("cidXYZ", &list));
    }

    #[test]
    fn glob_middle() {
        let list = vec!["dept_*_ops".into()];
        assert!(matches_allowlist("dept_42_ops", &list));
        assert!(!matches_allowlist("dept_42_dev", &list));
    }

    #[test]
    fn lone_star_matches_everything() {
        let list = vec!["*".into()];
        assert!(matches_allowlist("whoever", &list));
    }

    #[test]
    fn policies_use_lowercase_names() {
        let dm: DmPolicy = serde_json::from_str("\"pairing\"").unwrap();
        assert_eq!(dm, DmPolicy::Pairing);
        let group: GroupPolicy = serde_json::from_str("\"disabled\"").unwrap();
        assert_eq!(group, GroupPolicy::Disabled);
        assert_eq!(DmPolicy::default(), DmPolicy::Pairing);
        assert_eq!(GroupPolicy::default(), GroupPolicy::Open);
    }
}
