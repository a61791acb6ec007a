use bigdecimal::{BigDecimal, Zero};
use std::str::FromStr;

/// Parses a retailer price string such as `"12,50 ₾"`, `"₾1.299,00"` or `"5.99"`.
///
/// The last separator is the decimal point when one or two digits follow it;
/// a separator followed by exactly three digits groups thousands. Anything
/// else is rejected rather than guessed, so callers see `None` and never zero.
pub fn parse_price(raw: &str) -> Option<BigDecimal> {
    let token = numeric_token(raw)?;
    let groups: Vec<&str> = token.split([',', '.']).collect();
    if groups.iter().any(|g| g.is_empty()) {
        return None;
    }

    let digits = match groups.as_slice() {
        [whole] => whole.to_string(),
        [head @ .., last] => {
            let (grouped, fraction) = match last.len() {
                1 | 2 => (&head[1..], Some(*last)),
                3 => (&groups[1..], None),
                _ => return None,
            };
            if grouped.iter().any(|g| g.len() != 3) {
                return None;
            }
            let mut whole: String = head[0].to_string();
            for g in grouped {
                whole.push_str(g);
            }
            match fraction {
                Some(f) => format!("{whole}.{f}"),
                None => whole,
            }
        }
        [] => return None,
    };
    BigDecimal::from_str(&digits).ok()
}

/// Numeric scalars are taken as-is; negatives are never a shelf price.
pub fn price_from_number(n: &serde_json::Number) -> Option<BigDecimal> {
    let value = BigDecimal::from_str(&n.to_string()).ok()?;
    if value < BigDecimal::zero() {
        return None;
    }
    Some(value)
}

// First run of digits and separators; spaces between digits count as grouping.
fn numeric_token(raw: &str) -> Option<String> {
    let chars: Vec<char> = raw.chars().collect();
    let start = chars.iter().position(|c| c.is_ascii_digit())?;
    let mut out = String::new();
    let mut i = start;
    while i < chars.len() {
        let c = chars[i];
        if c.is_ascii_digit() || c == ',' || c == '.' {
            out.push(c);
        } else if is_group_space(c)
            && i + 1 < chars.len()
            && chars[i + 1].is_ascii_digit()
            && out.ends_with(|p: char| p.is_ascii_digit())
        {
            out.push('.');
            // a space-separated group is always thousands, never a fraction
            let run = chars[i + 1..].iter().take_while(|d| d.is_ascii_digit()).count();
            if run != 3 {
                out.pop();
                break;
            }
        } else {
            break;
        }
        i += 1;
    }
    let trimmed = out.trim_end_matches([',', '.']);
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn is_group_space(c: char) -> bool {
    c == ' ' || c == '\u{a0}' || c == '\u{202f}'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).expect("decimal literal")
    }

    #[test]
    fn comma_and_dot_are_both_decimal_points() {
        assert_eq!(parse_price("12,50 ₾"), Some(dec("12.50")));
        assert_eq!(parse_price("5.99"), Some(dec("5.99")));
        assert_eq!(parse_price("₾ 3,5"), Some(dec("3.5")));
        assert_eq!(parse_price("7"), Some(dec("7")));
    }

    #[test]
    fn three_digit_groups_are_thousands() {
        assert_eq!(parse_price("1.299,00 ₾"), Some(dec("1299.00")));
        assert_eq!(parse_price("1,299.00"), Some(dec("1299.00")));
        assert_eq!(parse_price("1,299"), Some(dec("1299")));
        assert_eq!(parse_price("1 299,90"), Some(dec("1299.90")));
        assert_eq!(parse_price("1\u{a0}299"), Some(dec("1299")));
    }

    #[test]
    fn garbage_is_absent_not_zero() {
        assert_eq!(parse_price(""), None);
        assert_eq!(parse_price("ფასი შეთანხმებით"), None);
        assert_eq!(parse_price("1.2.3"), None);
        assert_eq!(parse_price("5.9999"), None);
    }

    #[test]
    fn trailing_separator_and_prose_are_ignored() {
        assert_eq!(parse_price("4.49₾."), Some(dec("4.49")));
        assert_eq!(parse_price("from 2,30 ₾ / kg"), Some(dec("2.30")));
        assert_eq!(parse_price("2 items"), Some(dec("2")));
    }

    #[test]
    fn numbers_pass_through() {
        let n: serde_json::Number = serde_json::from_str("5.99").expect("number");
        assert_eq!(price_from_number(&n), Some(dec("5.99")));
        let neg: serde_json::Number = serde_json::from_str("-1").expect("number");
        assert_eq!(price_from_number(&neg), None);
    }
}
