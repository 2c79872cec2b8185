//! Kubernetes resource-quantity parsing and byte-size formatting.
//!
//! Quantities arrive as the opaque strings the API server stores
//! (`2Gi`, `1500M`, `0.5Gi`, `1048576`). Comparisons across the engine must
//! be semantic, never textual: `1Gi` and `1024Mi` are the same amount.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::{Error, Result};

const BINARY_SUFFIXES: &[(&str, f64)] = &[
    ("Ki", 1024.0),
    ("Mi", 1024.0 * 1024.0),
    ("Gi", 1024.0 * 1024.0 * 1024.0),
    ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("Ei", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
];

const DECIMAL_SUFFIXES: &[(&str, f64)] = &[
    ("k", 1e3),
    ("K", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
    ("m", 1e-3),
];

/// Parse a quantity string into bytes.
pub fn parse_bytes(s: &str) -> Result<i64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::parse("empty quantity"));
    }

    for (suffix, factor) in BINARY_SUFFIXES {
        if let Some(number) = s.strip_suffix(suffix) {
            return scale(number, *factor, s);
        }
    }
    for (suffix, factor) in DECIMAL_SUFFIXES {
        if let Some(number) = s.strip_suffix(suffix) {
            return scale(number, *factor, s);
        }
    }
    scale(s, 1.0, s)
}

/// Parse a [`Quantity`] into bytes.
pub fn quantity_bytes(q: &Quantity) -> Result<i64> {
    parse_bytes(&q.0)
}

fn scale(number: &str, factor: f64, original: &str) -> Result<i64> {
    let value: f64 = number
        .parse()
        .map_err(|_| Error::parse(format!("invalid quantity: {original}")))?;
    if value < 0.0 {
        return Err(Error::parse(format!("negative quantity: {original}")));
    }
    Ok((value * factor) as i64)
}

/// Semantic quantity equality: `1Gi == 1024Mi`.
///
/// Unparseable operands fall back to string comparison so that exotic values
/// still diff deterministically instead of erroring the sync pass.
pub fn quantities_equal(a: &Quantity, b: &Quantity) -> bool {
    match (parse_bytes(&a.0), parse_bytes(&b.0)) {
        (Ok(x), Ok(y)) => x == y,
        _ => a.0 == b.0,
    }
}

/// Format bytes in the human-readable form used on status sub-resources
/// (`396.46KiB`, `2.00GiB`).
pub fn format_bytes(bytes: f64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2}{}", value, UNITS[unit])
}

/// Parse the human-readable form back into bytes (`387.17KiB` → 396462.0).
/// The inverse of [`format_bytes`] up to rounding.
pub fn parse_human_bytes(s: &str) -> Option<f64> {
    const UNITS: &[(&str, f64)] = &[
        ("EiB", 1024f64 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("PiB", 1024f64 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("TiB", 1024f64 * 1024.0 * 1024.0 * 1024.0),
        ("GiB", 1024f64 * 1024.0 * 1024.0),
        ("MiB", 1024f64 * 1024.0),
        ("KiB", 1024f64),
        ("B", 1.0),
    ];
    let s = s.trim();
    for (suffix, factor) in UNITS {
        if let Some(number) = s.strip_suffix(suffix) {
            return number.trim().parse::<f64>().ok().map(|v| v * factor);
        }
    }
    s.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_binary_suffixes() {
        assert_eq!(parse_bytes("2Gi").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_bytes("100Mi").unwrap(), 100 * 1024 * 1024);
        assert_eq!(parse_bytes("1Ki").unwrap(), 1024);
        assert_eq!(parse_bytes("0.5Gi").unwrap(), 512 * 1024 * 1024);
    }

    #[test]
    fn parses_decimal_suffixes_and_plain_numbers() {
        assert_eq!(parse_bytes("1G").unwrap(), 1_000_000_000);
        assert_eq!(parse_bytes("1500k").unwrap(), 1_500_000);
        assert_eq!(parse_bytes("1048576").unwrap(), 1_048_576);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_bytes("").is_err());
        assert!(parse_bytes("abc").is_err());
        assert!(parse_bytes("-1Gi").is_err());
    }

    #[test]
    fn semantic_equality_crosses_suffixes() {
        assert!(quantities_equal(
            &Quantity("1Gi".to_string()),
            &Quantity("1024Mi".to_string())
        ));
        assert!(!quantities_equal(
            &Quantity("1Gi".to_string()),
            &Quantity("1G".to_string())
        ));
    }

    #[test]
    fn formats_bytes_with_binary_units() {
        assert_eq!(format_bytes(396462.0), "387.17KiB");
        assert_eq!(format_bytes(2.0 * 1024.0 * 1024.0 * 1024.0), "2.00GiB");
        assert_eq!(format_bytes(0.0), "0.00B");
    }

    #[test]
    fn human_bytes_round_trip() {
        assert_eq!(parse_human_bytes("2.00GiB").unwrap(), 2.0 * 1024.0 * 1024.0 * 1024.0);
        assert_eq!(parse_human_bytes("512B").unwrap(), 512.0);
        assert_eq!(parse_human_bytes("1234").unwrap(), 1234.0);
        assert!(parse_human_bytes("[Calculating]").is_none());
    }
}
