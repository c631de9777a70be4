//! Declarative specification of an analysis module.

use serde::{Deserialize, Serialize};

use super::Observable;

const fn default_timeout() -> u64 {
    600
}

/// Declarative description of an analysis module: what it accepts, how its
/// results are cached, and what it depends on. The core never executes
/// module code; it only routes work described by these records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisModuleType {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Observable types this module accepts. Empty accepts every type.
    #[serde(default)]
    pub observable_types: Vec<String>,
    /// Directives that must all be present on the observable.
    #[serde(default)]
    pub required_directives: Vec<String>,
    /// Tags that must all be present on the observable.
    #[serde(default)]
    pub required_tags: Vec<String>,
    /// Result cache TTL in seconds. `None` disables caching entirely.
    #[serde(default)]
    pub cache_ttl: Option<u64>,
    /// Ordered extra cache key components supplied at registration time.
    #[serde(default)]
    pub extended_cache_keys: Vec<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Manual module types are never auto-dispatched.
    #[serde(default)]
    pub manual: bool,
    /// Names of module types this one depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl AnalysisModuleType {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            observable_types: Vec::new(),
            required_directives: Vec::new(),
            required_tags: Vec::new(),
            cache_ttl: None,
            extended_cache_keys: Vec::new(),
            timeout_secs: default_timeout(),
            manual: false,
            dependencies: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_observable_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.observable_types = types.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_cache_ttl(mut self, ttl_secs: u64) -> Self {
        self.cache_ttl = Some(ttl_secs);
        self
    }

    #[must_use]
    pub fn with_required_directives<I, S>(mut self, directives: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_directives = directives.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_required_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn manual(mut self) -> Self {
        self.manual = true;
        self
    }

    /// Same registration: name and version both match.
    #[must_use]
    pub fn version_matches(&self, other: &Self) -> bool {
        self.name == other.name && self.version == other.version
    }

    /// Whether this module applies to the given observable: the observable
    /// type is accepted and every required directive and tag is present.
    /// Manual suppression and per-observable exclusions are checked by the
    /// dispatch loop, not here.
    #[must_use]
    pub fn accepts(&self, observable: &Observable) -> bool {
        if !self.observable_types.is_empty()
            && !self
                .observable_types
                .iter()
                .any(|t| t == &observable.observable_type)
        {
            return false;
        }

        self.required_directives
            .iter()
            .all(|d| observable.directives.contains(d))
            && self
                .required_tags
                .iter()
                .all(|t| observable.tags.contains(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_filters_on_type_directives_and_tags() {
        let amt = AnalysisModuleType::new("amt_whois", "1.0.0")
            .with_observable_types(["ipv4"])
            .with_required_directives(["crawl"]);

        let mut observable = Observable::new("ipv4", "8.8.8.8");
        assert!(!amt.accepts(&observable), "missing directive");

        observable.add_directive("crawl");
        assert!(amt.accepts(&observable));

        let url = Observable::new("url", "http://localhost/");
        assert!(!amt.accepts(&url), "wrong observable type");
    }

    #[test]
    fn empty_type_list_accepts_everything() {
        let amt = AnalysisModuleType::new("amt_any", "1.0.0");
        assert!(amt.accepts(&Observable::new("ipv4", "1.2.3.4")));
        assert!(amt.accepts(&Observable::new("user", "jdoe")));
    }

    #[test]
    fn version_matching() {
        let v1 = AnalysisModuleType::new("amt_x", "1.0.0");
        let v2 = AnalysisModuleType::new("amt_x", "2.0.0");
        assert!(v1.version_matches(&v1.clone()));
        assert!(!v1.version_matches(&v2));
    }
}
