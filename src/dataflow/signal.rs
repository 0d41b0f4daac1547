//! Signal values and the Int/Float promotion rules.

use core::fmt;

use serde::Serialize;

/// Dense signal identifier (index into the graph's signal arena).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SignalId(pub(crate) u32);

impl SignalId {
    pub const fn get(self) -> u32 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Int,
    Float,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int => f.write_str("int"),
            Self::Float => f.write_str("float"),
        }
    }
}

/// Current value of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SignalValue {
    Int(i64),
    Float(f64),
}

impl SignalValue {
    pub fn kind(self) -> SignalKind {
        match self {
            Self::Int(_) => SignalKind::Int,
            Self::Float(_) => SignalKind::Float,
        }
    }

    /// Promote to floating point.
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
        }
    }

    pub fn as_int(self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(i),
            Self::Float(_) => None,
        }
    }

    /// Convert into `kind`. Float to Int truncates toward zero and
    /// saturates; NaN becomes 0.
    pub fn coerce(self, kind: SignalKind) -> Self {
        match (self, kind) {
            (Self::Float(f), SignalKind::Int) => Self::Int(f as i64),
            (Self::Int(i), SignalKind::Float) => Self::Float(i as f64),
            (v, _) => v,
        }
    }

    /// Int values are always valid; Float values must be finite.
    pub fn is_valid(self) -> bool {
        match self {
            Self::Int(_) => true,
            Self::Float(f) => f.is_finite(),
        }
    }

    /// Parse text as a value of `kind`: decimal or `0x` hex integers,
    /// decimal floats. Integers are accepted for Float signals.
    pub fn parse(kind: SignalKind, s: &str) -> Option<Self> {
        let s = s.trim();
        match kind {
            SignalKind::Int => parse_int(s).map(Self::Int),
            SignalKind::Float => s
                .parse::<f64>()
                .ok()
                .or_else(|| parse_int(s).map(|i| i as f64))
                .map(Self::Float),
        }
    }

    /// The zero value of `kind`.
    pub fn zero(kind: SignalKind) -> Self {
        match kind {
            SignalKind::Int => Self::Int(0),
            SignalKind::Float => Self::Float(0.0),
        }
    }
}

impl From<i64> for SignalValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for SignalValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for SignalValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for SignalValue {
    fn from(v: bool) -> Self {
        Self::Int(i64::from(v))
    }
}

impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
        }
    }
}

fn parse_int(s: &str) -> Option<i64> {
    let (neg, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let (radix, digits) = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => (16, hex),
        None => (10, digits),
    };
    // `from_str_radix` takes its own sign; only one is allowed.
    if digits.starts_with(['+', '-']) {
        return None;
    }
    let magnitude = i128::from(u64::from_str_radix(digits, radix).ok()?);
    i64::try_from(if neg { -magnitude } else { magnitude }).ok()
}

/// One row of the signal listing.
#[derive(Debug, Clone, Serialize)]
pub struct SignalInfo {
    pub id: SignalId,
    pub name: String,
    pub kind: SignalKind,
    pub dim: Option<String>,
    pub value: SignalValue,
    pub valid: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotion() {
        assert_eq!(SignalValue::Int(3).as_f64(), 3.0);
        assert_eq!(SignalValue::Float(2.5).as_int(), None);
    }

    #[test]
    fn coercion_truncates_and_saturates() {
        assert_eq!(SignalValue::Float(-2.9).coerce(SignalKind::Int), SignalValue::Int(-2));
        assert_eq!(SignalValue::Float(1e30).coerce(SignalKind::Int), SignalValue::Int(i64::MAX));
        assert_eq!(SignalValue::Float(f64::NAN).coerce(SignalKind::Int), SignalValue::Int(0));
        assert_eq!(SignalValue::Int(4).coerce(SignalKind::Float), SignalValue::Float(4.0));
    }

    #[test]
    fn validity() {
        assert!(SignalValue::Int(i64::MIN).is_valid());
        assert!(SignalValue::Float(0.1).is_valid());
        assert!(!SignalValue::Float(f64::NAN).is_valid());
        assert!(!SignalValue::Float(f64::NEG_INFINITY).is_valid());
    }

    #[test]
    fn parse_forms() {
        use SignalKind::*;
        assert_eq!(SignalValue::parse(Int, "0x10"), Some(SignalValue::Int(16)));
        assert_eq!(SignalValue::parse(Int, "-3"), Some(SignalValue::Int(-3)));
        assert_eq!(SignalValue::parse(Int, " 42 "), Some(SignalValue::Int(42)));
        assert_eq!(SignalValue::parse(Int, "2.5"), None);
        assert_eq!(SignalValue::parse(Float, "2.5"), Some(SignalValue::Float(2.5)));
        assert_eq!(SignalValue::parse(Float, "0x8"), Some(SignalValue::Float(8.0)));
        assert_eq!(SignalValue::parse(Float, "warm"), None);
    }

    #[test]
    fn parse_takes_one_sign_and_rejects_overflow() {
        use SignalKind::*;
        for text in ["--5", "+-5", "-+5", "-0x-5", "0x+5", "--9223372036854775808", "-"] {
            assert_eq!(SignalValue::parse(Int, text), None, "{text}");
        }
        assert_eq!(SignalValue::parse(Float, "--5"), None);
        assert_eq!(SignalValue::parse(Int, "+5"), Some(SignalValue::Int(5)));
        assert_eq!(
            SignalValue::parse(Int, "-9223372036854775808"),
            Some(SignalValue::Int(i64::MIN))
        );
        assert_eq!(SignalValue::parse(Int, "9223372036854775808"), None);
        assert_eq!(
            SignalValue::parse(Int, "-0x8000000000000000"),
            Some(SignalValue::Int(i64::MIN))
        );
    }

    #[test]
    fn serializes_as_plain_number() {
        assert_eq!(serde_json::to_string(&SignalValue::Int(7)).unwrap(), "7");
        assert_eq!(serde_json::to_string(&SignalKind::Float).unwrap(), "\"float\"");
    }
}
