//! Reverse parser for the local-check encoding, used to verify the encoder.

use super::{CheckState, Metric, Thresholds};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ParsedService {
    pub host: String,
    pub state: CheckState,
    pub service_name: String,
    pub metrics: Vec<Metric>,
    pub summary: String,
    pub details: Option<String>,
}

fn parse_number(field: Option<&str>) -> Option<f64> {
    field.filter(|f| !f.is_empty()).and_then(|f| f.parse().ok())
}

fn parse_pair(a: Option<&str>, b: Option<&str>) -> Option<Thresholds> {
    Some(Thresholds::new(parse_number(a)?, parse_number(b)?))
}

fn parse_metric(raw: &str) -> Option<Metric> {
    let (name, values) = raw.split_once('=')?;
    let mut fields = values.split(';');
    let value = parse_number(fields.next())?;
    let (warn, crit, min, max) = (fields.next(), fields.next(), fields.next(), fields.next());
    Some(Metric {
        name: name.to_string(),
        value,
        levels: parse_pair(warn, crit),
        boundaries: parse_pair(min, max),
    })
}

fn parse_line(host: &str, line: &str) -> Option<ParsedService> {
    let (code, rest) = line.split_once(' ')?;
    let state = CheckState::from_code(code.parse().ok()?)?;

    let rest = rest.strip_prefix('"')?;
    let (service_name, rest) = rest.split_once('"')?;
    let rest = rest.strip_prefix(' ')?;
    let (metrics, text) = rest.split_once(' ').unwrap_or((rest, ""));

    let metrics = if metrics == "-" {
        Vec::new()
    } else {
        metrics.split('|').filter_map(parse_metric).collect()
    };

    let mut parts = text.split("\\n");
    let summary = parts.next().unwrap_or_default().to_string();
    let details: Vec<&str> = parts.collect();

    Some(ParsedService {
        host: host.to_string(),
        state,
        service_name: service_name.to_string(),
        metrics,
        summary,
        details: (!details.is_empty()).then(|| details.join("\n")),
    })
}

/// Parse every local-check line in an agent response.
pub(crate) fn parse_agent_output(output: &str) -> Vec<ParsedService> {
    let mut services = Vec::new();
    let mut host = String::new();
    let mut in_local = false;

    for line in output.lines() {
        if line == "<<<<>>>>" {
            host.clear();
            in_local = false;
        } else if let Some(name) = line.strip_prefix("<<<<").and_then(|l| l.strip_suffix(">>>>")) {
            host = name.to_string();
            in_local = false;
        } else if line.starts_with("<<<") && line.ends_with(">>>") {
            in_local = line == "<<<local:sep(0)>>>";
        } else if in_local {
            if let Some(service) = parse_line(&host, line) {
                services.push(service);
            }
        }
    }

    services
}
