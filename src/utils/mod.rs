// Utility functions and helpers

use std::time::Duration;

/// Parse a humane duration such as `"90s"`, `"5m"`, `"2h30m"` or `"1d"`.
///
/// A bare integer is read as seconds. Units: `ms`, `s`, `m`, `h`, `d`.
pub fn parse_duration(input: &str) -> anyhow::Result<Duration> {
    let input = input.trim();
    if input.is_empty() {
        anyhow::bail!("empty duration");
    }

    if let Ok(seconds) = input.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if ch.is_whitespace() {
            continue;
        }

        let mut unit = String::from(ch);
        while let Some(next) = chars.peek() {
            if next.is_ascii_alphabetic() {
                unit.push(*next);
                chars.next();
            } else {
                break;
            }
        }

        if digits.is_empty() {
            anyhow::bail!("missing number before unit `{}` in `{}`", unit, input);
        }
        let value: u64 = digits.parse()?;
        digits.clear();

        let part = match unit.as_str() {
            "ms" => Some(Duration::from_millis(value)),
            "s" | "sec" | "secs" => Some(Duration::from_secs(value)),
            "m" | "min" | "mins" => value.checked_mul(60).map(Duration::from_secs),
            "h" | "hr" | "hrs" => value.checked_mul(3600).map(Duration::from_secs),
            "d" | "day" | "days" => value.checked_mul(86_400).map(Duration::from_secs),
            other => anyhow::bail!("unknown duration unit `{}` in `{}`", other, input),
        };
        total = match part.and_then(|part| total.checked_add(part)) {
            Some(total) => total,
            None => anyhow::bail!("duration `{}` is too large", input),
        };
    }

    if !digits.is_empty() {
        anyhow::bail!("trailing number without unit in `{}`", input);
    }

    Ok(total)
}

/// Serde helpers for durations written either as seconds or humane strings.
pub mod serde_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(seconds) => Ok(Duration::from_secs(seconds)),
            Raw::Text(text) => super::parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }

    pub mod option {
        use super::Raw;
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(duration) => serializer.serialize_some(&duration.as_secs()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            match Option::<Raw>::deserialize(deserializer)? {
                None => Ok(None),
                Some(Raw::Seconds(seconds)) => Ok(Some(Duration::from_secs(seconds))),
                Some(Raw::Text(text)) => super::super::parse_duration(&text)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
            }
        }
    }
}

/// Truncate `text` to at most `max` characters, appending an ellipsis when cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compound_durations() {
        assert_eq!(parse_duration("2h30m").unwrap(), Duration::from_secs(9000));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("300").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5 parsecs").is_err());
        assert!(parse_duration("m5").is_err());
        assert!(parse_duration("5m3").is_err());
    }

    #[test]
    fn rejects_overflowing_durations() {
        let err = parse_duration("999999999999999999d").unwrap_err();
        assert!(err.to_string().contains("too large"));
        assert!(parse_duration("18446744073709551615s1s").is_err());
    }

    #[test]
    fn truncates_on_char_boundaries() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("abcdef", 4), "abc…");
    }
}
