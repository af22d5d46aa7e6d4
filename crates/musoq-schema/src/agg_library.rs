//! Base aggregate library.
//!
//! # NULL handling
//! Every aggregate skips NULL inputs. A group with no non-NULL input yields
//! NULL from `Sum`, `Avg`, `Min` and `Max`, `0` from `Count` and an empty
//! string from `AggregateValues`.
#![allow(clippy::unnecessary_literal_bound, clippy::cast_precision_loss)]

use std::cmp::Ordering;

use musoq_error::{MusoqError, Result};
use musoq_types::{ArithOp, Decimal, SemanticType, TypeKind, Value};

use crate::method::{AggregateMethod, MethodRegistry, MethodSignature, ReturnType};

fn first_arg<'a>(args: &'a [Value], method: &str) -> Result<&'a Value> {
    args.first()
        .ok_or_else(|| MusoqError::internal(format!("{method} called without arguments")))
}

fn nullable(kind: TypeKind) -> ReturnType {
    ReturnType::Fixed(SemanticType::nullable(kind))
}

// ── Count(x) ──────────────────────────────────────────────────────────────

pub struct CountFunc;

impl AggregateMethod for CountFunc {
    type State = i32;

    fn initial_state(&self) -> i32 {
        0
    }

    fn set(&self, state: &mut i32, args: &[Value]) -> Result<()> {
        if !first_arg(args, "Count")?.is_null() {
            *state = state
                .checked_add(1)
                .ok_or_else(|| MusoqError::runtime("count overflow", "Count"))?;
        }
        Ok(())
    }

    fn get(&self, state: i32) -> Result<Value> {
        Ok(Value::Int(state))
    }

    fn name(&self) -> &str {
        "Count"
    }

    fn signatures(&self) -> Vec<MethodSignature> {
        vec![MethodSignature::aggregate(
            "Count",
            &[TypeKind::Any],
            ReturnType::Fixed(SemanticType::non_null(TypeKind::Int)),
        )]
    }
}

// ── Sum(x) ────────────────────────────────────────────────────────────────

/// Sums in the widened kind: `Int` and `Long` accumulate as `Long`.
pub struct SumFunc;

const fn sum_kind(arg: TypeKind) -> TypeKind {
    match arg {
        TypeKind::Int | TypeKind::Long => TypeKind::Long,
        other => other,
    }
}

fn accumulate(acc: &mut Option<Value>, v: Value) -> Result<()> {
    *acc = Some(match acc.take() {
        None => v,
        Some(sum) => sum.arith(ArithOp::Add, &v)?,
    });
    Ok(())
}

fn widen(v: &Value, method: &str) -> Result<Value> {
    v.convert(sum_kind(v.kind()))
        .ok_or_else(|| MusoqError::type_mismatch(method, "numeric", v.kind().name()))
}

impl AggregateMethod for SumFunc {
    type State = Option<Value>;

    fn initial_state(&self) -> Option<Value> {
        None
    }

    fn set(&self, state: &mut Option<Value>, args: &[Value]) -> Result<()> {
        let v = first_arg(args, "Sum")?;
        if v.is_null() {
            return Ok(());
        }
        accumulate(state, widen(v, "Sum")?)
    }

    fn get(&self, state: Option<Value>) -> Result<Value> {
        Ok(state.unwrap_or(Value::Null))
    }

    fn name(&self) -> &str {
        "Sum"
    }

    fn signatures(&self) -> Vec<MethodSignature> {
        [TypeKind::Int, TypeKind::Long, TypeKind::Decimal, TypeKind::Double]
            .iter()
            .map(|k| MethodSignature::aggregate("Sum", &[*k], nullable(sum_kind(*k))))
            .collect()
    }
}

// ── Avg(x) ────────────────────────────────────────────────────────────────

/// Integral and decimal inputs average as `Decimal`; doubles as `Double`.
pub struct AvgFunc;

#[derive(Default)]
pub struct AvgState {
    sum: Option<Value>,
    count: i64,
}

impl AggregateMethod for AvgFunc {
    type State = AvgState;

    fn initial_state(&self) -> AvgState {
        AvgState::default()
    }

    fn set(&self, state: &mut AvgState, args: &[Value]) -> Result<()> {
        let v = first_arg(args, "Avg")?;
        if v.is_null() {
            return Ok(());
        }
        accumulate(&mut state.sum, widen(v, "Avg")?)?;
        state.count += 1;
        Ok(())
    }

    fn get(&self, state: AvgState) -> Result<Value> {
        let Some(sum) = state.sum else {
            return Ok(Value::Null);
        };
        match sum {
            Value::Double(total) => Ok(Value::Double(total / state.count as f64)),
            other => {
                let total = other
                    .to_decimal()
                    .ok_or_else(|| MusoqError::internal("Avg: non-numeric running sum"))?;
                total
                    .checked_div(Decimal::from(state.count))
                    .map(Value::Decimal)
                    .ok_or_else(|| MusoqError::runtime("decimal overflow", "Avg"))
            }
        }
    }

    fn name(&self) -> &str {
        "Avg"
    }

    fn signatures(&self) -> Vec<MethodSignature> {
        let mut sigs: Vec<MethodSignature> = [TypeKind::Int, TypeKind::Long, TypeKind::Decimal]
            .iter()
            .map(|k| MethodSignature::aggregate("Avg", &[*k], nullable(TypeKind::Decimal)))
            .collect();
        sigs.push(MethodSignature::aggregate(
            "Avg",
            &[TypeKind::Double],
            nullable(TypeKind::Double),
        ));
        sigs
    }
}

// ── Min(x) / Max(x) ───────────────────────────────────────────────────────

/// Keeps the extreme non-NULL value under [`Value::compare`].
pub struct ExtremeFunc {
    name: &'static str,
    keep: Ordering,
}

impl ExtremeFunc {
    #[must_use]
    pub const fn min() -> Self {
        Self {
            name: "Min",
            keep: Ordering::Less,
        }
    }

    #[must_use]
    pub const fn max() -> Self {
        Self {
            name: "Max",
            keep: Ordering::Greater,
        }
    }
}

impl AggregateMethod for ExtremeFunc {
    type State = Option<Value>;

    fn initial_state(&self) -> Option<Value> {
        None
    }

    fn set(&self, state: &mut Option<Value>, args: &[Value]) -> Result<()> {
        let v = first_arg(args, self.name)?;
        if v.is_null() {
            return Ok(());
        }
        let replace = state
            .as_ref()
            .map_or(true, |current| v.compare(current) == self.keep);
        if replace {
            *state = Some(v.clone());
        }
        Ok(())
    }

    fn get(&self, state: Option<Value>) -> Result<Value> {
        Ok(state.unwrap_or(Value::Null))
    }

    fn name(&self) -> &str {
        self.name
    }

    fn signatures(&self) -> Vec<MethodSignature> {
        [
            TypeKind::Bool,
            TypeKind::Int,
            TypeKind::Long,
            TypeKind::Decimal,
            TypeKind::Double,
            TypeKind::String,
            TypeKind::Any,
        ]
        .iter()
        .map(|k| MethodSignature::aggregate(self.name, &[*k], nullable(*k)))
        .collect()
    }
}

// ── AggregateValues(x) ────────────────────────────────────────────────────

/// Comma-joined text of the group's non-NULL values in arrival order.
pub struct AggregateValuesFunc;

impl AggregateMethod for AggregateValuesFunc {
    type State = Vec<String>;

    fn initial_state(&self) -> Vec<String> {
        Vec::new()
    }

    fn set(&self, state: &mut Vec<String>, args: &[Value]) -> Result<()> {
        let v = first_arg(args, "AggregateValues")?;
        if !v.is_null() {
            state.push(v.to_string());
        }
        Ok(())
    }

    fn get(&self, state: Vec<String>) -> Result<Value> {
        Ok(Value::String(state.join(",")))
    }

    fn name(&self) -> &str {
        "AggregateValues"
    }

    fn signatures(&self) -> Vec<MethodSignature> {
        vec![MethodSignature::aggregate(
            "AggregateValues",
            &[TypeKind::Any],
            ReturnType::Fixed(SemanticType::non_null(TypeKind::String)),
        )]
    }
}

/// Register the base aggregate methods.
pub fn register_base_aggregates(registry: &mut MethodRegistry) {
    registry.register_aggregate(CountFunc);
    registry.register_aggregate(SumFunc);
    registry.register_aggregate(AvgFunc);
    registry.register_aggregate(ExtremeFunc::min());
    registry.register_aggregate(ExtremeFunc::max());
    registry.register_aggregate(AggregateValuesFunc);
}
