use jiff::SignedDuration;

/// Parse a Go-style duration string (e.g. "1h", "-1m", "1h30m", "100ms")
/// into a signed duration. Returns `None` on anything malformed.
pub fn parse_duration(input: &str) -> Option<SignedDuration> {
    let s = input.trim();
    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    if s.is_empty() {
        return None;
    }
    if s == "0" {
        return Some(SignedDuration::ZERO);
    }

    let mut millis = 0f64;
    let mut chars = s.chars().peekable();
    while chars.peek().is_some() {
        let mut number = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_digit() || *c == '.' {
                number.push(*c);
                chars.next();
            } else {
                break;
            }
        }
        let value: f64 = number.parse().ok()?;

        let mut unit = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_alphabetic() {
                unit.push(*c);
                chars.next();
            } else {
                break;
            }
        }
        let scale = match unit.as_str() {
            "h" => 3_600_000f64,
            "m" => 60_000f64,
            "s" => 1_000f64,
            "ms" => 1f64,
            _ => return None,
        };
        millis += value * scale;
    }

    if !millis.is_finite() || millis > i64::MAX as f64 {
        return None;
    }
    let millis = millis.round() as i64;
    Some(SignedDuration::from_millis(if negative {
        -millis
    } else {
        millis
    }))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_duration_simple_units() {
        assert_eq!(parse_duration("1h"), Some(SignedDuration::from_secs(3600)));
        assert_eq!(parse_duration("2m"), Some(SignedDuration::from_secs(120)));
        assert_eq!(parse_duration("90s"), Some(SignedDuration::from_secs(90)));
        assert_eq!(
            parse_duration("100ms"),
            Some(SignedDuration::from_millis(100))
        );
    }

    #[test]
    fn test_parse_duration_compound() {
        assert_eq!(
            parse_duration("1h30m"),
            Some(SignedDuration::from_secs(5400))
        );
        assert_eq!(
            parse_duration("1m30s"),
            Some(SignedDuration::from_secs(90))
        );
    }

    #[test]
    fn test_parse_duration_signed() {
        assert_eq!(parse_duration("-1m"), Some(SignedDuration::from_secs(-60)));
        assert_eq!(parse_duration("+1m"), Some(SignedDuration::from_secs(60)));
    }

    #[test]
    fn test_parse_duration_fractional() {
        assert_eq!(
            parse_duration("1.5h"),
            Some(SignedDuration::from_secs(5400))
        );
        assert_eq!(
            parse_duration("0.5s"),
            Some(SignedDuration::from_millis(500))
        );
    }

    #[test]
    fn test_parse_duration_zero() {
        assert_eq!(parse_duration("0"), Some(SignedDuration::ZERO));
    }

    #[test]
    fn test_parse_duration_rejects_malformed() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("h"), None);
        assert_eq!(parse_duration("5"), None);
        assert_eq!(parse_duration("1x"), None);
        assert_eq!(parse_duration("1h-30m"), None);
        assert_eq!(parse_duration("one minute"), None);
    }
}
