use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::cache::CacheKey;
use crate::check::Check;
use crate::environment::Environment;
use crate::types::CheckId;

/// Namespace for check results in the cache.
pub const CHECK_NAMESPACE: &str = "check";

/// Identity of one cacheable unit of work.
///
/// Rendered as `check@environment`, followed by `?name=value&...` when the
/// check declares arguments. Only declared arguments take part and they are
/// ordered by name, so the key is deterministic for a given call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ExecutionKey {
    pub check: CheckId,
    pub environment: String,
    pub arguments: BTreeMap<String, String>,
}

impl ExecutionKey {
    pub fn new(check: &Check, target: &Environment, supplied: &BTreeMap<String, String>) -> Self {
        Self {
            check: check.id().clone(),
            environment: target.name().to_string(),
            arguments: check.effective_arguments(supplied),
        }
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(CHECK_NAMESPACE, self.to_string())
    }
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '&' => escaped.push_str("%26"),
            '=' => escaped.push_str("%3D"),
            '?' => escaped.push_str("%3F"),
            '@' => escaped.push_str("%40"),
            _ => escaped.push(c),
        }
    }
    escaped
}

impl fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", escape(self.check.as_str()), escape(&self.environment))?;
        for (position, (name, value)) in self.arguments.iter().enumerate() {
            let separator = if position == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", separator, escape(name), escape(value))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::EnvironmentRegistry;
    use crate::result::CheckResult;

    #[test]
    fn key_includes_declared_arguments_in_order() {
        let mut environments = EnvironmentRegistry::empty();
        let prod = environments.new_environment("prod").unwrap();
        let check = Check::builder("disk")
            .namespace("infra")
            .target(&prod)
            .argument("mount", "/")
            .argument("fs", "ext4")
            .run_blocking(|_| Ok(CheckResult::ok("fine")))
            .build()
            .unwrap();

        let defaults = ExecutionKey::new(&check, &prod, &BTreeMap::new());
        assert_eq!(defaults.to_string(), "infra::disk@prod?fs=ext4&mount=/");

        let supplied = BTreeMap::from([
            ("mount".to_string(), "/var&x".to_string()),
            ("ignored".to_string(), "1".to_string()),
        ]);
        let custom = ExecutionKey::new(&check, &prod, &supplied);
        assert_eq!(custom.to_string(), "infra::disk@prod?fs=ext4&mount=/var%26x");
        assert_ne!(defaults.cache_key(), custom.cache_key());
        assert_eq!(custom.cache_key().namespace, CHECK_NAMESPACE);
    }

    #[test]
    fn key_without_arguments_is_check_at_environment() {
        let mut environments = EnvironmentRegistry::empty();
        let prod = environments.new_environment("prod").unwrap();
        let check = Check::builder("ping")
            .target(&prod)
            .run(|_| async { Ok(CheckResult::ok("up")) })
            .build()
            .unwrap();

        assert_eq!(ExecutionKey::new(&check, &prod, &BTreeMap::new()).to_string(), "ping@prod");
    }
}
