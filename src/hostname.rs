//! Piggyback hostname resolution.
//!
//! Every reported result is attached to a Checkmk host. The host is picked by
//! precedence: the result's own override, then the check, then the target
//! environment, then the application. If none of them decides, the default
//! `{service_name}-{environment}` is used. The outcome is always coerced into
//! an RFC1123 hostname.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::types::Hostname;

const LABEL_MAX: usize = 63;
const HOSTNAME_MAX: usize = 253;

/// Used when nothing else yields a valid hostname.
pub const LAST_RESORT_HOSTNAME: &str = "watchpost";

/// Values available to hostname templates and functions.
#[derive(Debug, Clone, Copy)]
pub struct HostnameContext<'a> {
    pub service_name: &'a str,
    pub environment: &'a str,
    pub labels: &'a BTreeMap<String, String>,
}

type HostnameFn = dyn Fn(&HostnameContext<'_>) -> Option<String> + Send + Sync;

/// How a hostname is computed at one level of the precedence chain.
#[derive(Clone)]
pub enum HostnameSpec {
    /// Always this literal.
    Static(String),
    /// A template with `{service_name}`, `{environment}` and `{label:<key>}`
    /// placeholders.
    Template(String),
    /// A function that may decline by returning `None`.
    Function(Arc<HostnameFn>),
}

impl HostnameSpec {
    pub fn function(
        f: impl Fn(&HostnameContext<'_>) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self::Function(Arc::new(f))
    }

    /// Compute a candidate hostname. Empty output counts as no decision.
    pub fn resolve(&self, ctx: &HostnameContext<'_>) -> Option<String> {
        let value = match self {
            Self::Static(value) => Some(value.clone()),
            Self::Template(template) => Some(render_template(template, ctx)),
            Self::Function(f) => f(ctx),
        };
        value.filter(|v| !v.is_empty())
    }
}

impl fmt::Debug for HostnameSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(value) => f.debug_tuple("Static").field(value).finish(),
            Self::Template(template) => f.debug_tuple("Template").field(template).finish(),
            Self::Function(_) => f.write_str("Function(..)"),
        }
    }
}

impl From<&str> for HostnameSpec {
    /// Strings are templates; a literal without placeholders renders as itself.
    fn from(value: &str) -> Self {
        Self::Template(value.to_string())
    }
}

impl From<String> for HostnameSpec {
    fn from(value: String) -> Self {
        Self::Template(value)
    }
}

fn render_template(template: &str, ctx: &HostnameContext<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };

        let placeholder = &after[..end];
        match placeholder {
            "service_name" => out.push_str(ctx.service_name),
            "environment" => out.push_str(ctx.environment),
            other => match other.strip_prefix("label:") {
                Some(key) => {
                    if let Some(value) = ctx.labels.get(key) {
                        out.push_str(value);
                    }
                }
                None => {
                    out.push('{');
                    out.push_str(other);
                    out.push('}');
                }
            },
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

/// Whether `value` already is a valid RFC1123 hostname.
pub fn is_rfc1123_hostname(value: &str) -> bool {
    if value.is_empty() || value.len() > HOSTNAME_MAX {
        return false;
    }
    value.split('.').all(|label| {
        let bytes = label.as_bytes();
        !bytes.is_empty()
            && bytes.len() <= LABEL_MAX
            && bytes[0].is_ascii_alphanumeric()
            && bytes[bytes.len() - 1].is_ascii_alphanumeric()
            && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
    })
}

/// Coerce an arbitrary string into an RFC1123 hostname.
///
/// Lowercases, drops non-ASCII characters, replaces runs of other invalid
/// characters with `-`, collapses repeated separators, trims hyphens from
/// label edges and truncates to the RFC limits. Returns `None` if nothing
/// usable is left.
pub fn coerce_to_rfc1123(value: &str) -> Option<String> {
    let mut cleaned = String::with_capacity(value.len());
    let mut in_invalid_run = false;

    for ch in value.chars().filter(char::is_ascii) {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_alphanumeric() || ch == '.' || ch == '-' {
            cleaned.push(ch);
            in_invalid_run = false;
        } else if !in_invalid_run {
            cleaned.push('-');
            in_invalid_run = true;
        }
    }

    let mut out = String::new();
    for raw in cleaned.split('.') {
        let mut label = String::with_capacity(raw.len());
        for ch in raw.chars() {
            if ch == '-' && label.ends_with('-') {
                continue;
            }
            label.push(ch);
        }
        let label = label.trim_matches('-');
        if label.is_empty() {
            continue;
        }
        let label = &label[..label.len().min(LABEL_MAX)];
        let label = label.trim_end_matches('-');

        let extra = label.len() + usize::from(!out.is_empty());
        if out.len() + extra > HOSTNAME_MAX {
            break;
        }
        if !out.is_empty() {
            out.push('.');
        }
        out.push_str(label);
    }

    (!out.is_empty()).then_some(out)
}

/// The hostname specs that apply to one result, highest precedence first.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostnameChain<'a> {
    pub result: Option<&'a HostnameSpec>,
    pub check: Option<&'a HostnameSpec>,
    pub environment: Option<&'a HostnameSpec>,
    pub application: Option<&'a HostnameSpec>,
}

/// Resolve the piggyback hostname for a result.
///
/// A result-level override replaces the whole chain. Candidates that cannot
/// be coerced fall back to the default, and finally to
/// [`LAST_RESORT_HOSTNAME`].
pub fn resolve_hostname(chain: HostnameChain<'_>, ctx: &HostnameContext<'_>) -> Hostname {
    let candidate = match chain.result {
        Some(spec) => spec.resolve(ctx),
        None => [chain.check, chain.environment, chain.application]
            .into_iter()
            .flatten()
            .find_map(|spec| spec.resolve(ctx)),
    };

    let default = format!("{}-{}", ctx.service_name, ctx.environment);
    let candidate = candidate.unwrap_or_else(|| default.clone());

    if is_rfc1123_hostname(&candidate) {
        return Hostname::new(candidate);
    }

    match coerce_to_rfc1123(&candidate).or_else(|| coerce_to_rfc1123(&default)) {
        Some(coerced) => Hostname::new(coerced),
        None => {
            tracing::warn!(
                candidate = %candidate,
                "Could not derive an RFC1123 hostname, using `{}`",
                LAST_RESORT_HOSTNAME
            );
            Hostname::new(LAST_RESORT_HOSTNAME)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(labels: &'a BTreeMap<String, String>) -> HostnameContext<'a> {
        HostnameContext {
            service_name: "HTTP api",
            environment: "prod",
            labels,
        }
    }

    #[test]
    fn validates_rfc1123() {
        assert!(is_rfc1123_hostname("api-prod.example.com"));
        assert!(!is_rfc1123_hostname("-api"));
        assert!(!is_rfc1123_hostname("api..prod"));
        assert!(!is_rfc1123_hostname("api_prod"));
        assert!(!is_rfc1123_hostname(&"a".repeat(64)));
    }

    #[test]
    fn coerces_arbitrary_text() {
        assert_eq!(coerce_to_rfc1123("HTTP api-prod").unwrap(), "http-api-prod");
        assert_eq!(coerce_to_rfc1123("--a__b..c--").unwrap(), "a-b.c");
        assert_eq!(coerce_to_rfc1123("Grüße").unwrap(), "gre");
        assert_eq!(coerce_to_rfc1123(&"x".repeat(70)).unwrap().len(), 63);
        assert!(coerce_to_rfc1123("...").is_none());
        assert!(coerce_to_rfc1123("").is_none());
    }

    #[test]
    fn default_is_service_and_environment() {
        let labels = BTreeMap::new();
        let host = resolve_hostname(HostnameChain::default(), &ctx(&labels));
        assert_eq!(host.as_str(), "http-api-prod");
    }

    #[test]
    fn precedence_is_result_check_environment_application() {
        let labels = BTreeMap::new();
        let result = HostnameSpec::Static("from-result".into());
        let check = HostnameSpec::Static("from-check".into());
        let env = HostnameSpec::from("{environment}-host");
        let app = HostnameSpec::Static("from-app".into());

        let mut chain = HostnameChain {
            result: Some(&result),
            check: Some(&check),
            environment: Some(&env),
            application: Some(&app),
        };
        assert_eq!(resolve_hostname(chain, &ctx(&labels)).as_str(), "from-result");

        chain.result = None;
        assert_eq!(resolve_hostname(chain, &ctx(&labels)).as_str(), "from-check");

        chain.check = None;
        assert_eq!(resolve_hostname(chain, &ctx(&labels)).as_str(), "prod-host");

        chain.environment = None;
        assert_eq!(resolve_hostname(chain, &ctx(&labels)).as_str(), "from-app");
    }

    #[test]
    fn declining_functions_fall_through() {
        let labels = BTreeMap::from([("team".to_string(), "Payments Team".to_string())]);
        let check = HostnameSpec::function(|_| None);
        let env = HostnameSpec::from("{label:team}.{environment}");
        let chain = HostnameChain {
            check: Some(&check),
            environment: Some(&env),
            ..Default::default()
        };
        assert_eq!(resolve_hostname(chain, &ctx(&labels)).as_str(), "payments-team.prod");
    }

    #[test]
    fn valid_hostnames_keep_their_case() {
        let labels = BTreeMap::from([("team".to_string(), "Payments".to_string())]);
        let env = HostnameSpec::from("{label:team}.{environment}");
        let chain = HostnameChain {
            environment: Some(&env),
            ..Default::default()
        };
        assert!(is_rfc1123_hostname("Payments.prod"));
        assert_eq!(resolve_hostname(chain, &ctx(&labels)).as_str(), "Payments.prod");
    }

    #[test]
    fn unknown_placeholders_are_kept_then_coerced() {
        let labels = BTreeMap::new();
        let app = HostnameSpec::from("{nope}-x");
        let chain = HostnameChain {
            application: Some(&app),
            ..Default::default()
        };
        assert_eq!(resolve_hostname(chain, &ctx(&labels)).as_str(), "nope-x");
    }
}
