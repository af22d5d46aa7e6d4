use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use musoq_error::{MusoqError, Result};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};

use crate::ty::TypeKind;

/// A dynamically-typed cell value.
///
/// Equality and hashing are structural: `Int(1)` and `Long(1)` are different
/// values. Cross-kind numeric comparison goes through [`Value::compare`] and
/// [`Value::sql_eq`], which promote along the numeric tower.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Decimal(Decimal),
    Double(f64),
    String(String),
}

/// Arithmetic operator applied by [`Value::arith`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl ArithOp {
    const fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
        }
    }
}

/// Integral operator applied by [`Value::bitwise`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOp {
    And,
    Or,
    Xor,
    ShiftLeft,
    ShiftRight,
}

impl Value {
    /// The kind of this value; `Null` for SQL null.
    #[must_use]
    pub const fn kind(&self) -> TypeKind {
        match self {
            Self::Null => TypeKind::Null,
            Self::Bool(_) => TypeKind::Bool,
            Self::Int(_) => TypeKind::Int,
            Self::Long(_) => TypeKind::Long,
            Self::Decimal(_) => TypeKind::Decimal,
            Self::Double(_) => TypeKind::Double,
            Self::String(_) => TypeKind::String,
        }
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integral payload widened to i64.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i as i64),
            Self::Long(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric payload as a decimal. Doubles that cannot be represented
    /// return `None`.
    #[must_use]
    pub fn to_decimal(&self) -> Option<Decimal> {
        match self {
            Self::Int(i) => Some(Decimal::from(*i)),
            Self::Long(i) => Some(Decimal::from(*i)),
            Self::Decimal(d) => Some(*d),
            Self::Double(f) => Decimal::from_f64(*f),
            _ => None,
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn to_double(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(f64::from(*i)),
            Self::Long(i) => Some(*i as f64),
            Self::Decimal(d) => d.to_f64(),
            Self::Double(f) => Some(*f),
            _ => None,
        }
    }

    /// Convert to `kind`, returning `None` when the conversion is lossy
    /// beyond truncation or the text does not parse.
    ///
    /// Null converts to null for every target kind.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn convert(&self, kind: TypeKind) -> Option<Self> {
        if self.is_null() {
            return Some(Self::Null);
        }
        if self.kind() == kind || kind == TypeKind::Any {
            return Some(self.clone());
        }
        match kind {
            TypeKind::Null => None,
            TypeKind::Bool => match self {
                Self::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" => Some(Self::Bool(true)),
                    "false" => Some(Self::Bool(false)),
                    _ => None,
                },
                _ => None,
            },
            TypeKind::Int => self
                .to_i64_truncating()
                .and_then(|i| i32::try_from(i).ok())
                .map(Self::Int),
            TypeKind::Long => self.to_i64_truncating().map(Self::Long),
            TypeKind::Decimal => match self {
                Self::String(s) => Decimal::from_str(s.trim()).ok().map(Self::Decimal),
                _ => self.to_decimal().map(Self::Decimal),
            },
            TypeKind::Double => match self {
                Self::String(s) => s.trim().parse::<f64>().ok().map(Self::Double),
                _ => self.to_double().map(Self::Double),
            },
            TypeKind::String => Some(Self::String(self.to_string())),
            TypeKind::Any => Some(self.clone()),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn to_i64_truncating(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(i64::from(*i)),
            Self::Long(i) => Some(*i),
            Self::Decimal(d) => d.trunc().to_i64(),
            Self::Double(f) => {
                let t = f.trunc();
                if t.is_finite() && t >= -9_223_372_036_854_775_808.0 && t < 9_223_372_036_854_775_808.0
                {
                    Some(t as i64)
                } else {
                    None
                }
            }
            Self::String(s) => s.trim().parse::<i64>().ok(),
            Self::Bool(_) | Self::Null => None,
        }
    }

    const fn sort_class(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) | Self::Long(_) | Self::Decimal(_) | Self::Double(_) => 2,
            Self::String(_) => 3,
        }
    }

    /// Total ordering used by ORDER BY and sort-merge joins.
    ///
    /// Nulls sort first. Numbers of different kinds compare after promotion.
    /// Values of different classes order as null < bool < number < string.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Ordering {
        let (ca, cb) = (self.sort_class(), other.sort_class());
        if ca != cb {
            return ca.cmp(&cb);
        }
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (a, b) => compare_numbers(a, b),
        }
    }

    /// SQL equality: `None` when either side is null.
    #[must_use]
    pub fn sql_eq(&self, other: &Self) -> Option<bool> {
        if self.is_null() || other.is_null() {
            return None;
        }
        Some(self.compare(other) == Ordering::Equal)
    }

    /// Apply an arithmetic operator with numeric promotion. `+` on a string
    /// operand concatenates. Null on either side yields null.
    pub fn arith(&self, op: ArithOp, other: &Self) -> Result<Self> {
        if self.is_null() || other.is_null() {
            return Ok(Self::Null);
        }
        if op == ArithOp::Add && (matches!(self, Self::String(_)) || matches!(other, Self::String(_))) {
            return Ok(Self::String(format!("{self}{other}")));
        }
        let kind = self
            .kind()
            .promote(other.kind())
            .filter(|k| k.is_numeric())
            .ok_or_else(|| {
                MusoqError::type_mismatch(
                    op.symbol(),
                    "numeric operands",
                    format!("{} and {}", self.kind(), other.kind()),
                )
            })?;
        let overflow = || MusoqError::runtime("arithmetic overflow", op.symbol());
        match kind {
            TypeKind::Int => {
                let (Self::Int(a), Self::Int(b)) = (self, other) else {
                    return Err(MusoqError::internal("int promotion mismatch"));
                };
                let (a, b) = (*a, *b);
                if matches!(op, ArithOp::Div | ArithOp::Rem) && b == 0 {
                    return Err(MusoqError::runtime("division by zero", op.symbol()));
                }
                let r = match op {
                    ArithOp::Add => a.checked_add(b),
                    ArithOp::Sub => a.checked_sub(b),
                    ArithOp::Mul => a.checked_mul(b),
                    ArithOp::Div => a.checked_div(b),
                    ArithOp::Rem => a.checked_rem(b),
                };
                r.map(Self::Int).ok_or_else(overflow)
            }
            TypeKind::Long => {
                let a = self.as_i64().ok_or_else(overflow)?;
                let b = other.as_i64().ok_or_else(overflow)?;
                if matches!(op, ArithOp::Div | ArithOp::Rem) && b == 0 {
                    return Err(MusoqError::runtime("division by zero", op.symbol()));
                }
                let r = match op {
                    ArithOp::Add => a.checked_add(b),
                    ArithOp::Sub => a.checked_sub(b),
                    ArithOp::Mul => a.checked_mul(b),
                    ArithOp::Div => a.checked_div(b),
                    ArithOp::Rem => a.checked_rem(b),
                };
                r.map(Self::Long).ok_or_else(overflow)
            }
            TypeKind::Decimal => {
                let a = self.to_decimal().ok_or_else(overflow)?;
                let b = other.to_decimal().ok_or_else(overflow)?;
                if matches!(op, ArithOp::Div | ArithOp::Rem) && b.is_zero() {
                    return Err(MusoqError::runtime("division by zero", op.symbol()));
                }
                let r = match op {
                    ArithOp::Add => a.checked_add(b),
                    ArithOp::Sub => a.checked_sub(b),
                    ArithOp::Mul => a.checked_mul(b),
                    ArithOp::Div => a.checked_div(b),
                    ArithOp::Rem => a.checked_rem(b),
                };
                r.map(Self::Decimal).ok_or_else(overflow)
            }
            _ => {
                let a = self.to_double().ok_or_else(overflow)?;
                let b = other.to_double().ok_or_else(overflow)?;
                Ok(Self::Double(match op {
                    ArithOp::Add => a + b,
                    ArithOp::Sub => a - b,
                    ArithOp::Mul => a * b,
                    ArithOp::Div => a / b,
                    ArithOp::Rem => a % b,
                }))
            }
        }
    }

    /// Apply an integral operator. The result is `Long` unless both sides
    /// are `Int`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn bitwise(&self, op: BitOp, other: &Self) -> Result<Self> {
        if self.is_null() || other.is_null() {
            return Ok(Self::Null);
        }
        let (Some(a), Some(b)) = (self.as_i64(), other.as_i64()) else {
            return Err(MusoqError::type_mismatch(
                "bitwise operator",
                "integral operands",
                format!("{} and {}", self.kind(), other.kind()),
            ));
        };
        let shift = |b: i64| {
            u32::try_from(b)
                .ok()
                .filter(|s| *s < 64)
                .ok_or_else(|| MusoqError::runtime(format!("invalid shift amount {b}"), "<< / >>"))
        };
        let r = match op {
            BitOp::And => a & b,
            BitOp::Or => a | b,
            BitOp::Xor => a ^ b,
            BitOp::ShiftLeft => a << shift(b)?,
            BitOp::ShiftRight => a >> shift(b)?,
        };
        if matches!((self, other), (Self::Int(_), Self::Int(_))) {
            return Ok(Self::Int(r as i32));
        }
        Ok(Self::Long(r))
    }

    /// Arithmetic negation.
    pub fn negate(&self) -> Result<Self> {
        let overflow = || MusoqError::runtime("arithmetic overflow", "unary -");
        match self {
            Self::Null => Ok(Self::Null),
            Self::Int(i) => i.checked_neg().map(Self::Int).ok_or_else(overflow),
            Self::Long(i) => i.checked_neg().map(Self::Long).ok_or_else(overflow),
            Self::Decimal(d) => Ok(Self::Decimal(-*d)),
            Self::Double(f) => Ok(Self::Double(-*f)),
            other => Err(MusoqError::type_mismatch(
                "unary -",
                "numeric operand",
                other.kind().name(),
            )),
        }
    }
}

fn compare_numbers(a: &Value, b: &Value) -> Ordering {
    let kind = a
        .kind()
        .promote(b.kind())
        .unwrap_or(TypeKind::Double);
    match kind {
        TypeKind::Int | TypeKind::Long => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => Ordering::Equal,
        },
        TypeKind::Decimal => match (a.to_decimal(), b.to_decimal()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => Ordering::Equal,
        },
        _ => match (a.to_double(), b.to_double()) {
            (Some(x), Some(y)) => canonical(x).total_cmp(&canonical(y)),
            _ => Ordering::Equal,
        },
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Long(a), Self::Long(b)) => a == b,
            (Self::Decimal(a), Self::Decimal(b)) => a == b,
            (Self::Double(a), Self::Double(b)) => canonical_bits(*a) == canonical_bits(*b),
            (Self::String(a), Self::String(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Null => {}
            Self::Bool(b) => b.hash(state),
            Self::Int(i) => i.hash(state),
            Self::Long(i) => i.hash(state),
            Self::Decimal(d) => d.hash(state),
            Self::Double(f) => canonical_bits(*f).hash(state),
            Self::String(s) => s.hash(state),
        }
    }
}

// -0.0 and 0.0 are one value; every NaN is one value.
fn canonical(f: f64) -> f64 {
    f64::from_bits(canonical_bits(f))
}

fn canonical_bits(f: f64) -> u64 {
    if f == 0.0 {
        0.0_f64.to_bits()
    } else if f.is_nan() {
        f64::NAN.to_bits()
    } else {
        f.to_bits()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Long(i) => write!(f, "{i}"),
            Self::Decimal(d) => write!(f, "{d}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Long(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Double(f)
    }
}

impl From<Decimal> for Value {
    fn from(d: Decimal) -> Self {
        Self::Decimal(d)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Case-insensitive `LIKE` matching: `%` matches any run, `_` one character.
///
/// Greedy scan with a single backtrack point per `%`, linear in practice.
#[must_use]
pub fn like_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    let (mut t, mut p) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == '%' {
            star = Some((p, t));
            p += 1;
        } else if p < pattern.len() && (pattern[p] == '_' || chars_eq_ci(pattern[p], text[t])) {
            p += 1;
            t += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}

fn chars_eq_ci(a: char, b: char) -> bool {
    a == b || a.to_lowercase().eq(b.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn int_arithmetic_stays_int() {
        let r = Value::Int(2).arith(ArithOp::Add, &Value::Int(1)).unwrap();
        assert_eq!(r, Value::Int(3));
    }

    #[test]
    fn arithmetic_promotes_along_tower() {
        let r = Value::Int(2).arith(ArithOp::Mul, &Value::Long(3)).unwrap();
        assert_eq!(r, Value::Long(6));
        let r = Value::Long(1)
            .arith(ArithOp::Add, &Value::Decimal(Decimal::new(15, 1)))
            .unwrap();
        assert_eq!(r, Value::Decimal(Decimal::new(25, 1)));
        let r = Value::Decimal(Decimal::new(5, 1))
            .arith(ArithOp::Add, &Value::Double(0.25))
            .unwrap();
        assert_eq!(r, Value::Double(0.75));
    }

    #[test]
    fn arithmetic_with_null_is_null() {
        assert_eq!(
            Value::Int(1).arith(ArithOp::Sub, &Value::Null).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn string_plus_concatenates() {
        let r = Value::from("ab").arith(ArithOp::Add, &Value::from("cd")).unwrap();
        assert_eq!(r, Value::from("abcd"));
        let r = Value::from("n=").arith(ArithOp::Add, &Value::Int(4)).unwrap();
        assert_eq!(r, Value::from("n=4"));
    }

    #[test]
    fn division_by_zero_is_runtime_error() {
        let err = Value::Int(1).arith(ArithOp::Div, &Value::Int(0)).unwrap_err();
        assert!(matches!(err, MusoqError::RuntimeEvaluation { .. }));
    }

    #[test]
    fn int_overflow_is_runtime_error() {
        let err = Value::Int(i32::MAX)
            .arith(ArithOp::Add, &Value::Int(1))
            .unwrap_err();
        assert!(matches!(err, MusoqError::RuntimeEvaluation { .. }));
    }

    #[test]
    fn bool_arithmetic_is_type_mismatch() {
        let err = Value::Bool(true)
            .arith(ArithOp::Mul, &Value::Int(1))
            .unwrap_err();
        assert!(matches!(err, MusoqError::TypeMismatch { .. }));
    }

    #[test]
    fn bitwise_ops() {
        assert_eq!(
            Value::Int(6).bitwise(BitOp::And, &Value::Int(3)).unwrap(),
            Value::Int(2)
        );
        assert_eq!(
            Value::Int(1).bitwise(BitOp::ShiftLeft, &Value::Long(4)).unwrap(),
            Value::Long(16)
        );
        assert!(Value::Int(1).bitwise(BitOp::ShiftLeft, &Value::Int(-1)).is_err());
    }

    #[test]
    fn compare_across_numeric_kinds() {
        assert_eq!(Value::Int(1).compare(&Value::Long(1)), Ordering::Equal);
        assert_eq!(Value::Int(1).compare(&Value::Double(1.5)), Ordering::Less);
        assert_eq!(
            Value::Decimal(Decimal::new(25, 1)).compare(&Value::Long(2)),
            Ordering::Greater
        );
        assert_eq!(Value::Null.compare(&Value::Int(0)), Ordering::Less);
        assert_eq!(Value::from("a").compare(&Value::Int(9)), Ordering::Greater);
    }

    #[test]
    fn sql_eq_null_is_unknown() {
        assert_eq!(Value::Null.sql_eq(&Value::Null), None);
        assert_eq!(Value::Int(2).sql_eq(&Value::Long(2)), Some(true));
    }

    #[test]
    fn structural_equality_distinguishes_kinds() {
        assert_ne!(Value::Int(1), Value::Long(1));
        assert_eq!(Value::Double(0.0), Value::Double(-0.0));
        let set: HashSet<Value> = [Value::Double(0.0), Value::Double(-0.0), Value::Int(0)]
            .into_iter()
            .collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn signed_zero_and_nan_compare_like_they_hash() {
        let (pos, neg) = (Value::Double(0.0), Value::Double(-0.0));
        assert_eq!(neg.compare(&pos), Ordering::Equal);
        assert_eq!(neg.sql_eq(&pos), Some(true));
        let nan = Value::Double(f64::NAN);
        let other_nan = Value::Double(-f64::NAN);
        assert_eq!(nan, other_nan);
        assert_eq!(nan.compare(&other_nan), Ordering::Equal);
        assert_eq!(Value::Double(1.0).compare(&nan), Ordering::Less);
    }

    #[test]
    fn convert_between_kinds() {
        assert_eq!(Value::Int(3).convert(TypeKind::Long), Some(Value::Long(3)));
        assert_eq!(Value::Double(3.9).convert(TypeKind::Int), Some(Value::Int(3)));
        assert_eq!(Value::Long(i64::MAX).convert(TypeKind::Int), None);
        assert_eq!(Value::from("42").convert(TypeKind::Int), Some(Value::Int(42)));
        assert_eq!(Value::from("x").convert(TypeKind::Int), None);
        assert_eq!(Value::Int(5).convert(TypeKind::String), Some(Value::from("5")));
        assert_eq!(Value::Null.convert(TypeKind::Int), Some(Value::Null));
    }

    #[test]
    fn like_patterns() {
        assert!(like_match("Hello", "h%"));
        assert!(like_match("Hello", "%LL%"));
        assert!(like_match("Hello", "H_llo"));
        assert!(!like_match("Hello", "H_lo"));
        assert!(like_match("", "%"));
        assert!(!like_match("abc", "abd%"));
        assert!(like_match("aXbXc", "a%b%c"));
    }

    proptest! {
        #[test]
        fn compare_is_antisymmetric(a in any::<i64>(), b in any::<i32>()) {
            let x = Value::Long(a);
            let y = Value::Int(b);
            prop_assert_eq!(x.compare(&y), y.compare(&x).reverse());
        }

        #[test]
        fn double_compare_agrees_with_equality(
            a in prop_oneof![Just(0.0), Just(-0.0), Just(f64::NAN), -3.0_f64..3.0],
            b in prop_oneof![Just(0.0), Just(-0.0), Just(f64::NAN), -3.0_f64..3.0],
        ) {
            let (x, y) = (Value::Double(a), Value::Double(b));
            prop_assert_eq!(x.compare(&y).is_eq(), x == y);
        }

        #[test]
        fn like_percent_matches_any_suffix(prefix in "[a-z]{0,6}", rest in "[a-z]{0,6}") {
            let text = format!("{prefix}{rest}");
            let pattern = format!("{prefix}%");
            prop_assert!(like_match(&text, &pattern));
        }
    }
}
