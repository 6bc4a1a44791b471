use regex::bytes::Regex;

/// Decides whether a carbon line belongs on a route.
///
/// A line matches if it satisfies every configured condition. A matcher without conditions
/// matches all lines.
#[derive(Clone, Debug, Default)]
pub struct Matcher {
    prefix: Option<String>,
    sub: Option<String>,
    regex: Option<Regex>,
}

impl Matcher {
    /// Creates a matcher. Empty arguments are ignored.
    pub fn new(prefix: &str, sub: &str, regex: &str) -> Result<Self, regex::Error> {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_owned());

        let regex = match regex {
            "" => None,
            pattern => Some(Regex::new(pattern)?),
        };

        Ok(Self {
            prefix: non_empty(prefix),
            sub: non_empty(sub),
            regex,
        })
    }

    /// Returns `true` if the line matches all conditions.
    pub fn matches(&self, line: &[u8]) -> bool {
        let prefix_matches = self
            .prefix
            .as_ref()
            .is_none_or(|prefix| line.starts_with(prefix.as_bytes()));

        let sub_matches = self.sub.as_ref().is_none_or(|sub| {
            let sub = sub.as_bytes();
            line.windows(sub.len()).any(|window| window == sub)
        });

        prefix_matches
            && sub_matches
            && self.regex.as_ref().is_none_or(|regex| regex.is_match(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_matches_everything() {
        let matcher = Matcher::new("", "", "").unwrap();
        assert!(matcher.matches(b"servers.cpu 1 2"));
        assert!(matcher.matches(b""));
    }

    #[test]
    fn test_all_conditions_must_match() {
        let matcher = Matcher::new("servers.", "cpu", r"web-\d+").unwrap();

        assert!(matcher.matches(b"servers.web-1.cpu 1 2"));
        assert!(!matcher.matches(b"hosts.web-1.cpu 1 2"));
        assert!(!matcher.matches(b"servers.web-1.mem 1 2"));
        assert!(!matcher.matches(b"servers.db-1.cpu 1 2"));
    }

    #[test]
    fn test_invalid_regex() {
        assert!(Matcher::new("", "", "web-(").is_err());
    }
}
