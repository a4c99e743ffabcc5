//! Parser for `func([arg,] metric{label="value",...}[window])`

use crate::schema::LabelSet;
use crate::sketch::AggregateFunction;
use crate::{Error, Result};

use regex::Regex;
use std::sync::OnceLock;

/// A parsed range-function expression
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub function: AggregateFunction,
    pub arg: Option<f64>,
    pub metric: String,
    pub labels: LabelSet,
    pub window_ms: i64,
}

const EXPRESSION: &str = r#"^\s*([a-zA-Z_][a-zA-Z0-9_]*)\s*\(\s*(?:([-+]?(?:[0-9]+\.?[0-9]*|\.[0-9]+)(?:[eE][-+]?[0-9]+)?)\s*,\s*)?([a-zA-Z_:][a-zA-Z0-9_:]*)\s*(?:\{([^}]*)\})?\s*\[\s*([0-9]+)\s*(ms|s|m|h|d|w)\s*\]\s*\)\s*$"#;
const MATCHER: &str = r#"\s*([a-zA-Z_][a-zA-Z0-9_]*)\s*(=~|!=|!~|=)\s*"((?:[^"\\]|\\.)*)"\s*(,|$)"#;

struct Patterns {
    expression: Regex,
    matcher: Regex,
}

fn patterns() -> Result<&'static Patterns> {
    static PATTERNS: OnceLock<std::result::Result<Patterns, String>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            Ok(Patterns {
                expression: Regex::new(EXPRESSION).map_err(|e| e.to_string())?,
                matcher: Regex::new(MATCHER).map_err(|e| e.to_string())?,
            })
        })
        .as_ref()
        .map_err(|e| Error::Internal(format!("query grammar: {}", e)))
}

fn unit_millis(unit: &str) -> i64 {
    match unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => 604_800_000, // w
    }
}

fn parse_matchers(body: &str) -> Result<LabelSet> {
    let p = patterns()?;
    let mut labels = LabelSet::new();
    let mut consumed = 0;
    let trimmed = body.trim_end();

    for caps in p.matcher.captures_iter(trimmed) {
        let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
        if whole.start != consumed {
            break;
        }
        consumed = whole.end;

        let name = &caps[1];
        let op = &caps[2];
        if op != "=" {
            return Err(Error::Validation(format!(
                "unsupported matcher {}{}: only equality matchers are supported",
                name, op
            )));
        }
        let value = caps[3].replace("\\\"", "\"").replace("\\\\", "\\");
        labels.set(name, value);
    }

    if consumed != trimmed.len() && !trimmed[consumed..].trim().is_empty() {
        return Err(Error::Validation(format!(
            "malformed label matchers near '{}'",
            &trimmed[consumed..]
        )));
    }
    Ok(labels)
}

/// Parse an expression and validate its function and argument.
pub fn parse(input: &str) -> Result<Expression> {
    let p = patterns()?;
    let caps = p.expression.captures(input).ok_or_else(|| {
        Error::Validation(format!(
            "malformed expression '{}': expected func([arg,] metric{{label=\"value\"}}[window])",
            input
        ))
    })?;

    let function: AggregateFunction = caps[1].parse()?;
    let arg = match caps.get(2) {
        Some(raw) => Some(raw.as_str().parse::<f64>().map_err(|e| {
            Error::Validation(format!("invalid numeric argument '{}': {}", raw.as_str(), e))
        })?),
        None => None,
    };
    let arg = function.validate_argument(arg)?;

    let labels = match caps.get(4) {
        Some(body) => parse_matchers(body.as_str())?,
        None => LabelSet::new(),
    };

    let amount: i64 = caps[5]
        .parse()
        .map_err(|_| Error::Validation(format!("window '{}' is too large", &caps[5])))?;
    let window_ms = amount
        .checked_mul(unit_millis(&caps[6]))
        .ok_or_else(|| Error::Validation(format!("window '{}{}' is too large", &caps[5], &caps[6])))?;
    if window_ms == 0 {
        return Err(Error::Validation("window must be non-zero".to_string()));
    }

    Ok(Expression {
        function,
        arg,
        metric: caps[3].to_string(),
        labels,
        window_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain() {
        let expr = parse(r#"avg_over_time(cpu_usage{machineid="machine_3"}[5m])"#).unwrap();
        assert_eq!(expr.function, AggregateFunction::AvgOverTime);
        assert_eq!(expr.metric, "cpu_usage");
        assert_eq!(expr.labels.get("machineid"), Some("machine_3"));
        assert_eq!(expr.window_ms, 300_000);
        assert_eq!(expr.arg, None);
    }

    #[test]
    fn test_parse_quantile_argument() {
        let expr =
            parse(r#"quantile_over_time(0.9, m{machineid="machine_0", core="1"}[10s])"#).unwrap();
        assert_eq!(expr.arg, Some(0.9));
        assert_eq!(expr.labels.len(), 2);
        assert_eq!(expr.window_ms, 10_000);
    }

    #[test]
    fn test_quantile_rank_out_of_range() {
        let err = parse(r#"quantile_over_time(1.5, m{machineid="machine_0"}[10s])"#).unwrap_err();
        assert!(matches!(err, Error::ArgumentOutOfRange { .. }));
    }

    #[test]
    fn test_missing_and_extra_arguments() {
        assert!(parse(r#"quantile_over_time(m[10s])"#).is_err());
        assert!(parse(r#"avg_over_time(0.5, m[10s])"#).is_err());
    }

    #[test]
    fn test_unknown_function() {
        let err = parse(r#"rate(m[1m])"#).unwrap_err();
        assert!(matches!(err, Error::UnknownFunction(_)));
    }

    #[test]
    fn test_units_and_no_labels() {
        assert_eq!(parse("sum_over_time(m[250ms])").unwrap().window_ms, 250);
        assert_eq!(parse("sum_over_time(m[2h])").unwrap().window_ms, 7_200_000);
        assert_eq!(parse("sum_over_time(m{}[1d])").unwrap().window_ms, 86_400_000);
        assert_eq!(parse("sum_over_time(m[1w])").unwrap().window_ms, 604_800_000);
    }

    #[test]
    fn test_malformed() {
        for input in [
            "",
            "avg_over_time",
            "avg_over_time(m)",
            "avg_over_time(m[5])",
            "avg_over_time(m[0s])",
            r#"avg_over_time(m{a="1" b="2"}[5m])"#,
            r#"avg_over_time(m{a=1}[5m])"#,
        ] {
            let err = parse(input).unwrap_err();
            assert!(err.is_client_error(), "{} -> {:?}", input, err);
        }
    }

    #[test]
    fn test_only_equality_matchers() {
        let err = parse(r#"avg_over_time(m{a=~"x.*"}[5m])"#).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_escaped_quote_in_value() {
        let expr = parse(r#"avg_over_time(m{path="a\"b"}[1m])"#).unwrap();
        assert_eq!(expr.labels.get("path"), Some("a\"b"));
    }

    #[test]
    fn test_trailing_comma_allowed() {
        let expr = parse(r#"avg_over_time(m{a="1",}[1m])"#).unwrap();
        assert_eq!(expr.labels.get("a"), Some("1"));
    }
}
