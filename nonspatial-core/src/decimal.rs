//! Exact decimal literals.
//!
//! `number` columns are NUMERIC with unbounded precision, so their values
//! travel as decimal text instead of `f64`. Integer cells written as
//! `1.0` or `1e3` go through the same parser and are accepted when their
//! value is integral.

/// A decimal literal: `[+-]digits[.digits][(e|E)[+-]digits]`.
///
/// At least one mantissa digit is required; `.5` and `5.` are accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecimalLiteral {
    negative: bool,
    int_digits: String,
    frac_digits: String,
    exponent: i64,
}

impl DecimalLiteral {
    pub fn parse(raw: &str) -> Option<Self> {
        let (negative, rest) = match raw.as_bytes().first()? {
            b'-' => (true, &raw[1..]),
            b'+' => (false, &raw[1..]),
            _ => (false, raw),
        };
        let (mantissa, exponent) = match rest.find(['e', 'E']) {
            Some(at) => (&rest[..at], parse_exponent(&rest[at + 1..])?),
            None => (rest, 0),
        };
        let (int_digits, frac_digits) = mantissa.split_once('.').unwrap_or((mantissa, ""));
        let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
        if int_digits.len() + frac_digits.len() == 0
            || !all_digits(int_digits)
            || !all_digits(frac_digits)
        {
            return None;
        }
        Some(Self {
            negative,
            int_digits: int_digits.to_string(),
            frac_digits: frac_digits.to_string(),
            exponent,
        })
    }

    fn is_zero(&self) -> bool {
        self.int_digits
            .bytes()
            .chain(self.frac_digits.bytes())
            .all(|b| b == b'0')
    }

    /// The value as an `i64`, if it is integral and in range.
    pub fn to_i64(&self) -> Option<i64> {
        let digits = format!("{}{}", self.int_digits, self.frac_digits);
        let digits = digits.trim_start_matches('0');
        if digits.is_empty() {
            return Some(0);
        }
        // value = digits * 10^-scale
        let scale = (self.frac_digits.len() as i64).checked_sub(self.exponent)?;
        let (significant, shift) = if scale > 0 {
            let scale = usize::try_from(scale).ok()?;
            if scale >= digits.len() {
                return None;
            }
            let (head, tail) = digits.split_at(digits.len() - scale);
            if tail.bytes().any(|b| b != b'0') {
                return None;
            }
            (head, 0u32)
        } else {
            (digits, u32::try_from(-scale).ok()?)
        };

        let magnitude = significant
            .parse::<i128>()
            .ok()?
            .checked_mul(10i128.checked_pow(shift)?)?;
        let value = if self.negative { -magnitude } else { magnitude };
        i64::try_from(value).ok()
    }

    /// Nearest `f64`, for engines that store NUMERIC as REAL.
    pub fn to_f64(&self) -> f64 {
        self.canonical().parse().unwrap_or(f64::NAN)
    }

    /// Canonical text, valid both as a JSON number and as a NUMERIC literal.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        if self.negative && !self.is_zero() {
            out.push('-');
        }
        match self.int_digits.trim_start_matches('0') {
            "" => out.push('0'),
            digits => out.push_str(digits),
        }
        if !self.frac_digits.is_empty() {
            out.push('.');
            out.push_str(&self.frac_digits);
        }
        if self.exponent != 0 {
            out.push_str(&format!("e{}", self.exponent));
        }
        out
    }
}

fn parse_exponent(raw: &str) -> Option<i64> {
    let digits = raw.strip_prefix(['+', '-']).unwrap_or(raw);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}
