// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Parsing of the unit-bearing strings Kubernetes objects carry: resource
//! quantities (`10Gi`, `500M`) and Go-style durations (`1h30m`).

use std::cmp::Ordering;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnitError {
    #[error("invalid quantity {0:?}")]
    Quantity(String),

    #[error("invalid duration {0:?}")]
    Duration(String),
}

/// Returns the numeric value of a resource quantity, in base units.
pub fn quantity_value(q: &Quantity) -> Result<f64, UnitError> {
    let s = q.0.trim();
    let err = || UnitError::Quantity(q.0.clone());

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    let number: f64 = number.parse().map_err(|_| err())?;

    let multiplier = match suffix {
        "" => 1.0,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        exp if exp.starts_with(['e', 'E']) => {
            let exp: i32 = exp[1..].parse().map_err(|_| err())?;
            10f64.powi(exp)
        }
        _ => return Err(err()),
    };

    Ok(number * multiplier)
}

/// Compares two quantities by value.
pub fn compare_quantities(
    a: &Quantity,
    b: &Quantity,
) -> Result<Ordering, UnitError> {
    let (a, b) = (quantity_value(a)?, quantity_value(b)?);
    Ok(a.partial_cmp(&b).unwrap_or(Ordering::Equal))
}

/// Parses a duration in the syntax of Go's `time.ParseDuration`: a sequence
/// of decimal numbers each followed by a unit (`ns`, `us`, `ms`, `s`, `m`,
/// `h`), such as `300ms` or `1h15m`. Negative durations are rejected.
pub fn parse_go_duration(s: &str) -> Result<Duration, UnitError> {
    let err = || UnitError::Duration(s.to_string());

    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(err());
    }

    let mut rest = s.strip_prefix('+').unwrap_or(s);
    let mut total = 0f64;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(err)?;
        if num_len == 0 {
            return Err(err());
        }
        let value: f64 = rest[..num_len].parse().map_err(|_| err())?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" | "μs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(err()),
        };
        rest = &rest[unit_len..];
        total += value * seconds;
    }

    Ok(Duration::from_secs_f64(total))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        Quantity(s.to_string())
    }

    #[test]
    fn quantities_parse_binary_and_decimal_suffixes() {
        assert_eq!(quantity_value(&q("1Gi")).unwrap(), 1073741824.0);
        assert_eq!(quantity_value(&q("1G")).unwrap(), 1e9);
        assert_eq!(quantity_value(&q("1536Mi")).unwrap(), 1536.0 * 1048576.0);
        assert_eq!(quantity_value(&q("100m")).unwrap(), 0.1);
        assert_eq!(quantity_value(&q("12e3")).unwrap(), 12000.0);
        assert!(quantity_value(&q("ten")).is_err());
        assert!(quantity_value(&q("1Zi")).is_err());
    }

    #[test]
    fn quantities_compare_across_units() {
        assert_eq!(
            compare_quantities(&q("1Gi"), &q("1G")).unwrap(),
            Ordering::Greater
        );
        assert_eq!(
            compare_quantities(&q("1024Mi"), &q("1Gi")).unwrap(),
            Ordering::Equal
        );
    }

    #[test]
    fn go_durations() {
        assert_eq!(parse_go_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(
            parse_go_duration("1h30m10s").unwrap(),
            Duration::from_secs(5410)
        );
        assert_eq!(
            parse_go_duration("1.5s").unwrap(),
            Duration::from_millis(1500)
        );
        assert_eq!(parse_go_duration("0").unwrap(), Duration::ZERO);
        assert!(parse_go_duration("").is_err());
        assert!(parse_go_duration("10").is_err());
        assert!(parse_go_duration("-5m").is_err());
        assert!(parse_go_duration("5d").is_err());
    }
}
