use trawl_core::SalaryRange;

const CURRENCY_SYMBOLS: &[(char, &str)] = &[
    ('$', "USD"),
    ('€', "EUR"),
    ('£', "GBP"),
    ('¥', "JPY"),
    ('₹', "INR"),
];

const CURRENCY_CODES: &[&str] = &[
    "USD", "EUR", "GBP", "CAD", "AUD", "NZD", "CHF", "SEK", "NOK", "DKK", "PLN", "INR", "JPY",
];

const PERIODS: &[(&[&str], &str)] = &[
    (&["hour", "hourly", "/hr", " hr"], "hour"),
    (&["day", "daily"], "day"),
    (&["week", "weekly"], "week"),
    (&["month", "monthly"], "month"),
    (&["year", "annum", "annual", "yearly", "/yr", " yr", " pa", "p.a."], "year"),
];

/// Parse free-form salary text ("$120,000 - $150,000 a year", "45k to 60k
/// EUR", "Up to £70,000") into a [`SalaryRange`].
///
/// Returns `None` when the text carries no amount at all.
pub fn parse_salary(text: &str) -> Option<SalaryRange> {
    let amounts = extract_amounts(text);
    let lower = text.to_lowercase();

    let (min, max) = match amounts.as_slice() {
        [] => return None,
        [only] if lower.contains("up to") || lower.contains("max") => (None, Some(*only)),
        [only] if lower.contains("from") || lower.contains("starting") || lower.contains('+') => {
            (Some(*only), None)
        }
        [only] => (Some(*only), Some(*only)),
        [a, b, ..] => (Some(a.min(*b)), Some(a.max(*b))),
    };

    Some(SalaryRange {
        min,
        max,
        currency: detect_currency(text),
        period: detect_period(&lower),
    })
}

fn detect_currency(text: &str) -> Option<String> {
    if let Some((_, code)) = CURRENCY_SYMBOLS.iter().find(|(sym, _)| text.contains(*sym)) {
        return Some((*code).to_string());
    }
    text.split(|c: char| !c.is_ascii_alphabetic())
        .find(|word| CURRENCY_CODES.contains(word))
        .map(str::to_string)
}

fn detect_period(lower: &str) -> Option<String> {
    // Pad so suffix markers like " pa" match at the end of the text.
    let padded = format!("{lower} ");
    PERIODS
        .iter()
        .find(|(markers, _)| markers.iter().any(|m| padded.contains(m)))
        .map(|(_, period)| (*period).to_string())
}

/// Pull numeric amounts out of the text, honouring thousands separators
/// and a `k` suffix.
fn extract_amounts(text: &str) -> Vec<f64> {
    let mut amounts = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if !c.is_ascii_digit() {
            continue;
        }
        let mut raw = String::from(c);
        while let Some(&next) = chars.peek() {
            if next.is_ascii_digit() || next == '.' || next == ',' {
                raw.push(next);
                chars.next();
            } else {
                break;
            }
        }
        let raw = raw.trim_end_matches(['.', ',']);
        let Ok(mut value) = raw.replace(',', "").parse::<f64>() else {
            continue;
        };
        if chars.peek().is_some_and(|c| c.eq_ignore_ascii_case(&'k')) {
            chars.next();
            value *= 1000.0;
        }
        amounts.push(value);
    }

    amounts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dollar_range_per_year() {
        let salary = parse_salary("$120,000 - $150,000 a year").unwrap();
        assert_eq!(salary.min, Some(120_000.0));
        assert_eq!(salary.max, Some(150_000.0));
        assert_eq!(salary.currency.as_deref(), Some("USD"));
        assert_eq!(salary.period.as_deref(), Some("year"));
    }

    #[test]
    fn k_suffix_and_code() {
        let salary = parse_salary("45k to 60K EUR per annum").unwrap();
        assert_eq!(salary.min, Some(45_000.0));
        assert_eq!(salary.max, Some(60_000.0));
        assert_eq!(salary.currency.as_deref(), Some("EUR"));
        assert_eq!(salary.period.as_deref(), Some("year"));
    }

    #[test]
    fn hourly_with_decimals() {
        let salary = parse_salary("£18.50 - £22.75 per hour").unwrap();
        assert_eq!(salary.min, Some(18.5));
        assert_eq!(salary.max, Some(22.75));
        assert_eq!(salary.currency.as_deref(), Some("GBP"));
        assert_eq!(salary.period.as_deref(), Some("hour"));
    }

    #[test]
    fn single_bounds() {
        let capped = parse_salary("Up to $90,000").unwrap();
        assert_eq!((capped.min, capped.max), (None, Some(90_000.0)));

        let floor = parse_salary("From 3000 CHF a month").unwrap();
        assert_eq!((floor.min, floor.max), (Some(3000.0), None));
        assert_eq!(floor.period.as_deref(), Some("month"));

        let exact = parse_salary("70000").unwrap();
        assert_eq!((exact.min, exact.max), (Some(70_000.0), Some(70_000.0)));
        assert!(exact.currency.is_none());
        assert!(exact.period.is_none());
    }

    #[test]
    fn reversed_range_is_ordered() {
        let salary = parse_salary("90000 - 80000").unwrap();
        assert_eq!((salary.min, salary.max), (Some(80_000.0), Some(90_000.0)));
    }

    #[test]
    fn text_without_amount() {
        assert!(parse_salary("Competitive").is_none());
        assert!(parse_salary("").is_none());
    }
}
