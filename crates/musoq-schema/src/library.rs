//! Base scalar library.
//!
//! Registered into every schema's registry and used on its own for queries
//! without a FROM clause. String methods return NULL when any argument is
//! NULL; conversions return NULL when the value does not convert.
#![allow(clippy::unnecessary_literal_bound)]

use musoq_error::{MusoqError, Result};
use musoq_types::{SemanticType, TypeKind, Value};

use crate::method::{CallContext, MethodRegistry, MethodSignature, ReturnType, ScalarMethod};

// ── Helpers ───────────────────────────────────────────────────────────────

fn any_null(args: &[Value]) -> bool {
    args.iter().any(Value::is_null)
}

fn text<'a>(args: &'a [Value], i: usize, method: &str) -> Result<&'a str> {
    args.get(i).and_then(Value::as_str).ok_or_else(|| {
        MusoqError::runtime(format!("argument {i} is not a string"), method)
    })
}

fn int_arg(args: &[Value], i: usize, method: &str) -> Result<i64> {
    args.get(i)
        .and_then(Value::as_i64)
        .ok_or_else(|| MusoqError::runtime(format!("argument {i} is not an integer"), method))
}

fn len_to_int(n: usize, method: &str) -> Result<Value> {
    i32::try_from(n)
        .map(Value::Int)
        .map_err(|_| MusoqError::runtime("length exceeds Int range", method))
}

fn sig(name: &str, params: &[TypeKind], ret: ReturnType) -> MethodSignature {
    MethodSignature::scalar(name, params, ret)
}

const STRING: TypeKind = TypeKind::String;

// ── Row context ───────────────────────────────────────────────────────────

/// `RowNumber()`: 1-based ordinal among rows accepted by WHERE so far.
pub struct RowNumberFunc;

impl ScalarMethod for RowNumberFunc {
    fn invoke(&self, cx: &CallContext<'_>, _args: &[Value]) -> Result<Value> {
        Ok(Value::Long(i64::try_from(cx.row_number).unwrap_or(i64::MAX)))
    }

    fn name(&self) -> &str {
        "RowNumber"
    }

    fn signatures(&self) -> Vec<MethodSignature> {
        vec![sig(
            "RowNumber",
            &[],
            ReturnType::Fixed(SemanticType::non_null(TypeKind::Long)),
        )]
    }
}

// ── String ────────────────────────────────────────────────────────────────

/// Single-string-argument transforms.
pub struct StringMapFunc {
    name: &'static str,
    apply: fn(&str) -> String,
}

impl StringMapFunc {
    #[must_use]
    pub fn to_upper() -> Self {
        Self {
            name: "ToUpper",
            apply: str::to_uppercase,
        }
    }

    #[must_use]
    pub fn to_lower() -> Self {
        Self {
            name: "ToLower",
            apply: str::to_lowercase,
        }
    }

    #[must_use]
    pub fn trim() -> Self {
        Self {
            name: "Trim",
            apply: |s| s.trim().to_owned(),
        }
    }
}

impl ScalarMethod for StringMapFunc {
    fn invoke(&self, _cx: &CallContext<'_>, args: &[Value]) -> Result<Value> {
        if any_null(args) {
            return Ok(Value::Null);
        }
        Ok(Value::String((self.apply)(text(args, 0, self.name)?)))
    }

    fn name(&self) -> &str {
        self.name
    }

    fn signatures(&self) -> Vec<MethodSignature> {
        vec![sig(self.name, &[STRING], ReturnType::Propagating(STRING))]
    }
}

pub struct LengthFunc;

impl ScalarMethod for LengthFunc {
    fn invoke(&self, _cx: &CallContext<'_>, args: &[Value]) -> Result<Value> {
        if any_null(args) {
            return Ok(Value::Null);
        }
        len_to_int(text(args, 0, "Length")?.chars().count(), "Length")
    }

    fn name(&self) -> &str {
        "Length"
    }

    fn signatures(&self) -> Vec<MethodSignature> {
        vec![sig("Length", &[STRING], ReturnType::Propagating(TypeKind::Int))]
    }
}

/// `Substring(s, start [, length])` with a 0-based character start.
/// Ranges past the end are clipped.
pub struct SubstringFunc;

impl ScalarMethod for SubstringFunc {
    fn invoke(&self, _cx: &CallContext<'_>, args: &[Value]) -> Result<Value> {
        if any_null(args) {
            return Ok(Value::Null);
        }
        let s = text(args, 0, "Substring")?;
        let start = usize::try_from(int_arg(args, 1, "Substring")?)
            .map_err(|_| MusoqError::runtime("start index must not be negative", "Substring"))?;
        let chars = s.chars().skip(start);
        let out: String = if args.len() > 2 {
            let len = usize::try_from(int_arg(args, 2, "Substring")?)
                .map_err(|_| MusoqError::runtime("length must not be negative", "Substring"))?;
            chars.take(len).collect()
        } else {
            chars.collect()
        };
        Ok(Value::String(out))
    }

    fn name(&self) -> &str {
        "Substring"
    }

    fn signatures(&self) -> Vec<MethodSignature> {
        vec![
            sig("Substring", &[STRING, TypeKind::Int], ReturnType::Propagating(STRING)),
            sig(
                "Substring",
                &[STRING, TypeKind::Int, TypeKind::Int],
                ReturnType::Propagating(STRING),
            ),
        ]
    }
}

/// `Concat(a, b, ...)`: NULL arguments contribute nothing.
pub struct ConcatFunc;

impl ScalarMethod for ConcatFunc {
    fn invoke(&self, _cx: &CallContext<'_>, args: &[Value]) -> Result<Value> {
        let mut out = String::new();
        for v in args.iter().filter(|v| !v.is_null()) {
            out.push_str(&v.to_string());
        }
        Ok(Value::String(out))
    }

    fn name(&self) -> &str {
        "Concat"
    }

    fn signatures(&self) -> Vec<MethodSignature> {
        vec![sig("Concat", &[], ReturnType::Fixed(SemanticType::non_null(STRING)))
            .with_variadic(TypeKind::Any)]
    }
}

/// Two-string predicates: `Contains`, `StartsWith`, `EndsWith`.
pub struct StringTestFunc {
    name: &'static str,
    test: fn(&str, &str) -> bool,
}

impl StringTestFunc {
    #[must_use]
    pub fn contains() -> Self {
        Self {
            name: "Contains",
            test: |s, p| s.contains(p),
        }
    }

    #[must_use]
    pub fn starts_with() -> Self {
        Self {
            name: "StartsWith",
            test: |s, p| s.starts_with(p),
        }
    }

    #[must_use]
    pub fn ends_with() -> Self {
        Self {
            name: "EndsWith",
            test: |s, p| s.ends_with(p),
        }
    }
}

impl ScalarMethod for StringTestFunc {
    fn invoke(&self, _cx: &CallContext<'_>, args: &[Value]) -> Result<Value> {
        if any_null(args) {
            return Ok(Value::Null);
        }
        Ok(Value::Bool((self.test)(
            text(args, 0, self.name)?,
            text(args, 1, self.name)?,
        )))
    }

    fn name(&self) -> &str {
        self.name
    }

    fn signatures(&self) -> Vec<MethodSignature> {
        vec![sig(self.name, &[STRING, STRING], ReturnType::Propagating(TypeKind::Bool))]
    }
}

pub struct ReplaceFunc;

impl ScalarMethod for ReplaceFunc {
    fn invoke(&self, _cx: &CallContext<'_>, args: &[Value]) -> Result<Value> {
        if any_null(args) {
            return Ok(Value::Null);
        }
        let s = text(args, 0, "Replace")?;
        let from = text(args, 1, "Replace")?;
        let to = text(args, 2, "Replace")?;
        if from.is_empty() {
            return Ok(Value::String(s.to_owned()));
        }
        Ok(Value::String(s.replace(from, to)))
    }

    fn name(&self) -> &str {
        "Replace"
    }

    fn signatures(&self) -> Vec<MethodSignature> {
        vec![sig("Replace", &[STRING, STRING, STRING], ReturnType::Propagating(STRING))]
    }
}

/// `IndexOf(s, needle)`: 0-based character index, or -1.
pub struct IndexOfFunc;

impl ScalarMethod for IndexOfFunc {
    fn invoke(&self, _cx: &CallContext<'_>, args: &[Value]) -> Result<Value> {
        if any_null(args) {
            return Ok(Value::Null);
        }
        let s = text(args, 0, "IndexOf")?;
        let needle = text(args, 1, "IndexOf")?;
        match s.find(needle) {
            Some(byte_idx) => len_to_int(s[..byte_idx].chars().count(), "IndexOf"),
            None => Ok(Value::Int(-1)),
        }
    }

    fn name(&self) -> &str {
        "IndexOf"
    }

    fn signatures(&self) -> Vec<MethodSignature> {
        vec![sig("IndexOf", &[STRING, STRING], ReturnType::Propagating(TypeKind::Int))]
    }
}

// ── Math ──────────────────────────────────────────────────────────────────

pub struct AbsFunc;

impl ScalarMethod for AbsFunc {
    fn invoke(&self, _cx: &CallContext<'_>, args: &[Value]) -> Result<Value> {
        let overflow = || MusoqError::runtime("integer overflow", "Abs");
        match args.first() {
            None | Some(Value::Null) => Ok(Value::Null),
            Some(Value::Int(n)) => n.checked_abs().map(Value::Int).ok_or_else(overflow),
            Some(Value::Long(n)) => n.checked_abs().map(Value::Long).ok_or_else(overflow),
            Some(Value::Decimal(d)) => Ok(Value::Decimal(d.abs())),
            Some(Value::Double(v)) => Ok(Value::Double(v.abs())),
            Some(other) => Err(MusoqError::type_mismatch("Abs", "numeric", other.kind().name())),
        }
    }

    fn name(&self) -> &str {
        "Abs"
    }

    fn signatures(&self) -> Vec<MethodSignature> {
        [TypeKind::Int, TypeKind::Long, TypeKind::Decimal, TypeKind::Double]
            .iter()
            .map(|k| sig("Abs", &[*k], ReturnType::ArgType(0)))
            .collect()
    }
}

/// `Round(x, digits)` with midpoint away from zero.
pub struct RoundFunc;

impl ScalarMethod for RoundFunc {
    fn invoke(&self, _cx: &CallContext<'_>, args: &[Value]) -> Result<Value> {
        if any_null(args) {
            return Ok(Value::Null);
        }
        let digits = int_arg(args, 1, "Round")?;
        let digits = u32::try_from(digits)
            .map_err(|_| MusoqError::runtime("digits must not be negative", "Round"))?;
        match &args[0] {
            Value::Decimal(d) => Ok(Value::Decimal(d.round_dp_with_strategy(
                digits,
                rust_decimal::RoundingStrategy::MidpointAwayFromZero,
            ))),
            Value::Double(v) => {
                let factor = 10_f64.powi(i32::try_from(digits).unwrap_or(i32::MAX));
                Ok(Value::Double((v * factor).round() / factor))
            }
            other => Err(MusoqError::type_mismatch("Round", "Decimal or Double", other.kind().name())),
        }
    }

    fn name(&self) -> &str {
        "Round"
    }

    fn signatures(&self) -> Vec<MethodSignature> {
        vec![
            sig("Round", &[TypeKind::Decimal, TypeKind::Int], ReturnType::ArgType(0)),
            sig("Round", &[TypeKind::Double, TypeKind::Int], ReturnType::ArgType(0)),
        ]
    }
}

// ── Conditional ───────────────────────────────────────────────────────────

/// `Coalesce(a, b, ...)`: first non-NULL argument.
pub struct CoalesceFunc;

impl ScalarMethod for CoalesceFunc {
    fn invoke(&self, _cx: &CallContext<'_>, args: &[Value]) -> Result<Value> {
        Ok(args
            .iter()
            .find(|v| !v.is_null())
            .cloned()
            .unwrap_or(Value::Null))
    }

    fn name(&self) -> &str {
        "Coalesce"
    }

    fn signatures(&self) -> Vec<MethodSignature> {
        vec![sig("Coalesce", &[TypeKind::Any], ReturnType::CommonOfArgs)
            .with_variadic(TypeKind::Any)]
    }
}

// ── Conversion ────────────────────────────────────────────────────────────

/// `ToString`, `ToInt32`, `ToInt64`, `ToDecimal`, `ToDouble`.
pub struct ConvertFunc {
    name: &'static str,
    target: TypeKind,
}

impl ConvertFunc {
    #[must_use]
    pub const fn new(name: &'static str, target: TypeKind) -> Self {
        Self { name, target }
    }
}

impl ScalarMethod for ConvertFunc {
    fn invoke(&self, _cx: &CallContext<'_>, args: &[Value]) -> Result<Value> {
        let Some(v) = args.first() else {
            return Ok(Value::Null);
        };
        if self.target == STRING {
            return Ok(if v.is_null() {
                Value::Null
            } else {
                Value::String(v.to_string())
            });
        }
        Ok(v.convert(self.target).unwrap_or(Value::Null))
    }

    fn name(&self) -> &str {
        self.name
    }

    fn signatures(&self) -> Vec<MethodSignature> {
        let ret = if self.target == STRING {
            ReturnType::Propagating(STRING)
        } else {
            ReturnType::Fixed(SemanticType::nullable(self.target))
        };
        vec![sig(self.name, &[TypeKind::Any], ret)]
    }
}

/// Register the base scalar methods.
pub fn register_base_library(registry: &mut MethodRegistry) {
    registry.register_scalar(RowNumberFunc);

    // String
    registry.register_scalar(StringMapFunc::to_upper());
    registry.register_scalar(StringMapFunc::to_lower());
    registry.register_scalar(StringMapFunc::trim());
    registry.register_scalar(LengthFunc);
    registry.register_scalar(SubstringFunc);
    registry.register_scalar(ConcatFunc);
    registry.register_scalar(StringTestFunc::contains());
    registry.register_scalar(StringTestFunc::starts_with());
    registry.register_scalar(StringTestFunc::ends_with());
    registry.register_scalar(ReplaceFunc);
    registry.register_scalar(IndexOfFunc);

    // Math
    registry.register_scalar(AbsFunc);
    registry.register_scalar(RoundFunc);

    // Conditional
    registry.register_scalar(CoalesceFunc);

    // Conversion
    registry.register_scalar(ConvertFunc::new("ToString", STRING));
    registry.register_scalar(ConvertFunc::new("ToInt32", TypeKind::Int));
    registry.register_scalar(ConvertFunc::new("ToInt64", TypeKind::Long));
    registry.register_scalar(ConvertFunc::new("ToDecimal", TypeKind::Decimal));
    registry.register_scalar(ConvertFunc::new("ToDouble", TypeKind::Double));
}
