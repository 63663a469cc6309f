//! Checkmk agent output.
//!
//! Two formats are supported. `Local` emits classic local-check lines inside
//! piggyback blocks; service labels travel in a separate JSON section since
//! the local-check line has no place for them. `Section` emits one base64 JSON
//! document per result in a `<<<watchpost>>>` section for a dedicated plugin.
//!
//! Free text is sanitized, never rejected: the backend cannot tolerate a
//! malformed line and one bad summary must not break the whole output.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use super::{CheckState, ExecutionResult, Metric, Thresholds};

/// Output format of the agent endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Local,
    Section,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "section" => Ok(Self::Section),
            other => Err(format!("unknown output format `{}`", other)),
        }
    }
}

/// Agent header announcing the producer.
pub fn encode_header() -> String {
    format!(
        "<<<check_mk>>>\nVersion: watchpost-{}\nAgentOS: watchpost\n",
        env!("CARGO_PKG_VERSION")
    )
}

/// Render a complete agent response.
pub fn render(results: &[ExecutionResult], format: OutputFormat) -> String {
    let mut out = encode_header();
    for result in results {
        match format {
            OutputFormat::Local => encode_local(&mut out, result),
            OutputFormat::Section => encode_section(&mut out, result),
        }
    }
    out
}

/// Collapse a summary onto one line.
pub fn sanitize_summary(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\0' => {}
            '\r' | '\n' | '\t' => out.push(' '),
            '\\' | '|' => out.push('/'),
            c => out.push(c),
        }
    }
    out.trim().to_string()
}

/// Service names are quoted on the wire and may not contain quotes or line breaks.
pub fn sanitize_service_name(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '"' | '\0'))
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

fn sanitize_details(details: &str) -> String {
    details
        .lines()
        .map(sanitize_summary)
        .collect::<Vec<_>>()
        .join("\\n")
}

fn format_number(value: f64) -> String {
    if value.is_finite() {
        format!("{}", value)
    } else {
        String::new()
    }
}

fn format_pair(thresholds: Option<&Thresholds>) -> [String; 2] {
    match thresholds {
        Some(t) => [format_number(t.warning), format_number(t.critical)],
        None => [String::new(), String::new()],
    }
}

/// `name=value;warn;crit;min;max`, trailing empty fields omitted.
///
/// `None` when the value is NaN or infinite; non-finite thresholds are left
/// empty.
pub fn encode_metric(metric: &Metric) -> Option<String> {
    if !metric.value.is_finite() {
        return None;
    }
    let [warn, crit] = format_pair(metric.levels.as_ref());
    let [min, max] = format_pair(metric.boundaries.as_ref());

    let mut fields = vec![format_number(metric.value), warn, crit, min, max];
    while fields.len() > 1 && fields.last().is_some_and(String::is_empty) {
        fields.pop();
    }
    Some(format!("{}={}", metric.sanitized_name(), fields.join(";")))
}

/// Metrics the backend can parse. Non-finite values are dropped with a warning.
fn reportable_metrics<'a>(result: &'a ExecutionResult) -> impl Iterator<Item = &'a Metric> {
    result.metrics.iter().filter(|metric| {
        let finite = metric.value.is_finite();
        if !finite {
            tracing::warn!(
                service = %result.service_name,
                metric = %metric.name,
                "Dropping metric with non-finite value {}",
                metric.value
            );
        }
        finite
    })
}

fn finite_thresholds(thresholds: Option<Thresholds>) -> Option<Thresholds> {
    thresholds.filter(|t| t.warning.is_finite() && t.critical.is_finite())
}

fn encode_local(out: &mut String, result: &ExecutionResult) {
    let _ = writeln!(out, "<<<<{}>>>>", result.piggyback_host);

    if !result.service_labels.is_empty() {
        #[derive(Serialize)]
        struct Labels<'a> {
            service_name: &'a str,
            labels: &'a BTreeMap<String, String>,
        }
        let service_name = sanitize_service_name(&result.service_name);
        if let Ok(json) = serde_json::to_string(&Labels {
            service_name: &service_name,
            labels: &result.service_labels,
        }) {
            let _ = writeln!(out, "<<<watchpost_labels:sep(0)>>>\n{}", json);
        }
    }

    let metrics: Vec<String> = reportable_metrics(result).filter_map(encode_metric).collect();
    let metrics = if metrics.is_empty() {
        "-".to_string()
    } else {
        metrics.join("|")
    };

    let mut text = sanitize_summary(&result.summary);
    if let Some(details) = result.details.as_deref() {
        let details = sanitize_details(details);
        if !details.is_empty() {
            text.push_str("\\n");
            text.push_str(&details);
        }
    }

    let _ = writeln!(
        out,
        "<<<local:sep(0)>>>\n{} \"{}\" {} {}",
        result.state.code(),
        sanitize_service_name(&result.service_name),
        metrics,
        text
    );
    out.push_str("<<<<>>>>\n");
}

/// JSON document carried in the `<<<watchpost>>>` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionDocument {
    pub service_name: String,
    pub service_labels: BTreeMap<String, String>,
    pub environment: String,
    pub check_state: String,
    pub summary: String,
    pub details: Option<String>,
    pub metrics: Vec<SectionMetric>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionMetric {
    pub name: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub levels: Option<Thresholds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boundaries: Option<Thresholds>,
}

fn encode_section(out: &mut String, result: &ExecutionResult) {
    let document = SectionDocument {
        service_name: result.service_name.clone(),
        service_labels: result.service_labels.clone(),
        environment: result.environment.clone(),
        check_state: result.state.name().to_string(),
        summary: result.summary.clone(),
        details: result.details.clone(),
        metrics: reportable_metrics(result)
            .map(|m| SectionMetric {
                name: m.sanitized_name(),
                value: m.value,
                levels: finite_thresholds(m.levels),
                boundaries: finite_thresholds(m.boundaries),
            })
            .collect(),
    };

    let json = match serde_json::to_vec(&document) {
        Ok(json) => json,
        Err(err) => {
            tracing::error!(service = %result.service_name, "Failed to encode result: {}", err);
            return;
        }
    };

    let _ = writeln!(out, "<<<<{}>>>>", result.piggyback_host);
    out.push_str("<<<watchpost>>>\n");
    out.push_str(&BASE64.encode(json));
    out.push_str("\n<<<<>>>>\n");
}

/// Local-check line for the agent's own service, outside any piggyback block.
pub fn encode_own_service(state: CheckState, service_name: &str, summary: &str) -> String {
    format!(
        "<<<local:sep(0)>>>\n{} \"{}\" - {}\n",
        state.code(),
        sanitize_service_name(service_name),
        sanitize_summary(summary)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::parser::parse_agent_output;
    use crate::result::Metric;
    use crate::types::Hostname;

    fn result(state: CheckState, summary: &str) -> ExecutionResult {
        ExecutionResult {
            piggyback_host: Hostname::new("api-prod"),
            service_name: "HTTP api".into(),
            service_labels: BTreeMap::new(),
            environment: "prod".into(),
            state,
            summary: summary.into(),
            details: None,
            metrics: Vec::new(),
        }
    }

    #[test]
    fn local_line_layout() {
        let mut r = result(CheckState::Warn, "slow");
        r.metrics.push(Metric::new("latency", 0.5).with_levels(0.3, 1.0));
        let out = render(&[r], OutputFormat::Local);

        assert!(out.starts_with("<<<check_mk>>>\nVersion: watchpost-"));
        assert!(out.contains(
            "<<<<api-prod>>>>\n<<<local:sep(0)>>>\n1 \"HTTP api\" latency=0.5;0.3;1 slow\n<<<<>>>>\n"
        ));
    }

    #[test]
    fn own_service_has_no_piggyback_block() {
        let line = encode_own_service(CheckState::Warn, "Watchpost", "2 errors\nsee log");
        assert_eq!(line, "<<<local:sep(0)>>>\n1 \"Watchpost\" - 2 errors see log\n");
    }

    #[test]
    fn missing_metrics_are_a_dash() {
        let out = render(&[result(CheckState::Ok, "fine")], OutputFormat::Local);
        assert!(out.contains("0 \"HTTP api\" - fine\n"));
    }

    #[test]
    fn metric_fields_keep_positions() {
        let only_bounds = Metric::new("m", 3.0).with_boundaries(0.0, 10.0);
        assert_eq!(encode_metric(&only_bounds).as_deref(), Some("m=3;;;0;10"));
        assert_eq!(encode_metric(&Metric::new("m", 3.25)).as_deref(), Some("m=3.25"));
    }

    #[test]
    fn non_finite_metrics_are_dropped() {
        assert_eq!(encode_metric(&Metric::new("m", f64::NAN)), None);
        assert_eq!(
            encode_metric(&Metric::new("m", 1.0).with_levels(f64::INFINITY, 5.0)).as_deref(),
            Some("m=1;;5")
        );

        let mut r = result(CheckState::Ok, "fine");
        r.metrics = vec![Metric::new("nan", f64::NAN), Metric::new("load", 0.5)];
        let out = render(std::slice::from_ref(&r), OutputFormat::Local);
        assert!(out.contains("0 \"HTTP api\" load=0.5 fine\n"));
        let parsed = parse_agent_output(&out);
        assert_eq!(parsed[0].metrics, vec![Metric::new("load", 0.5)]);

        r.metrics = vec![Metric::new("nan", f64::NAN)];
        let out = render(&[r], OutputFormat::Local);
        assert!(out.contains("0 \"HTTP api\" - fine\n"));
    }

    #[test]
    fn free_text_is_sanitized() {
        let mut r = result(CheckState::Crit, "line one\nline | two \\ three");
        r.service_name = "say \"hi\"".into();
        r.details = Some("first\nsecond|x".into());
        let out = render(&[r], OutputFormat::Local);

        assert!(out.contains(
            "2 \"say hi\" - line one line / two / three\\nfirst\\nsecond/x\n"
        ));
    }

    #[test]
    fn labels_travel_out_of_band() {
        let mut r = result(CheckState::Ok, "fine");
        r.service_labels.insert("team".into(), "payments".into());
        let out = render(&[r], OutputFormat::Local);

        assert!(out.contains(
            "<<<watchpost_labels:sep(0)>>>\n{\"service_name\":\"HTTP api\",\"labels\":{\"team\":\"payments\"}}\n"
        ));
        assert!(out.contains("0 \"HTTP api\" - fine\n"));
    }

    #[test]
    fn parse_recovers_state_summary_and_metrics() {
        let mut a = result(CheckState::Warn, "slow responses");
        a.metrics = vec![
            Metric::new("latency", 0.123).with_levels(0.1, 0.5),
            Metric::new("requests", 42.0).with_boundaries(0.0, 100.0),
        ];
        a.details = Some("p99 is high\nsee dashboard".into());
        let mut b = result(CheckState::Unknown, "no data");
        b.piggyback_host = Hostname::new("api-staging");

        let parsed = parse_agent_output(&render(&[a.clone(), b.clone()], OutputFormat::Local));
        assert_eq!(parsed.len(), 2);

        assert_eq!(parsed[0].host, "api-prod");
        assert_eq!(parsed[0].state, CheckState::Warn);
        assert_eq!(parsed[0].service_name, "HTTP api");
        assert_eq!(parsed[0].summary, "slow responses");
        assert_eq!(parsed[0].details.as_deref(), Some("p99 is high\nsee dashboard"));
        assert_eq!(parsed[0].metrics, a.metrics);

        assert_eq!(parsed[1].host, "api-staging");
        assert_eq!(parsed[1].state, CheckState::Unknown);
        assert_eq!(parsed[1].summary, "no data");
        assert!(parsed[1].metrics.is_empty());
    }

    #[test]
    fn section_format_is_base64_json() {
        let mut r = result(CheckState::Crit, "down");
        r.metrics.push(Metric::new("up time", 1.0));
        let out = render(&[r], OutputFormat::Section);

        let mut lines = out.lines().skip_while(|l| *l != "<<<watchpost>>>");
        lines.next();
        let payload = BASE64.decode(lines.next().unwrap()).unwrap();
        let doc: SectionDocument = serde_json::from_slice(&payload).unwrap();

        assert_eq!(doc.check_state, "CRIT");
        assert_eq!(doc.environment, "prod");
        assert_eq!(doc.metrics[0].name, "up_time");
        assert!(out.contains("<<<<api-prod>>>>\n<<<watchpost>>>\n"));
    }
}
