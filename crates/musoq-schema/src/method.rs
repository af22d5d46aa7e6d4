//! Method signatures, scalar/aggregate method traits and the overload
//! registry.
//!
//! Every schema owns a [`MethodRegistry`]. Methods are keyed by their
//! canonical (uppercase) name; each name may carry several overloads.
//!
//! # Overload resolution
//!
//! 1. Collect overloads whose parameter kinds equal the argument kinds.
//! 2. If none, collect overloads every argument is assignable to.
//! 3. Exactly one candidate wins. Several candidates at the same step are
//!    an [`MusoqError::AmbiguousMethod`]; none at all is
//!    [`MusoqError::MethodNotFound`]. There is no "most specific" tie-break.
#![allow(clippy::unnecessary_literal_bound)]

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use musoq_error::{MusoqError, Result};
use musoq_types::{SemanticType, TypeKind, Value};
use tracing::debug;

use crate::source::SourceContext;

/// Scalar methods run per row; aggregate methods accumulate per group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    Scalar,
    Aggregate,
}

/// How a method's result type is derived from its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnType {
    /// Always this type.
    Fixed(SemanticType),
    /// This kind, nullable when any argument is nullable.
    Propagating(TypeKind),
    /// Same type as the argument at this position.
    ArgType(usize),
    /// Unified type of every argument.
    CommonOfArgs,
}

/// Declared shape of one overload.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodSignature {
    pub name: String,
    pub params: Vec<TypeKind>,
    /// Kind of any number of trailing arguments after `params`.
    pub variadic: Option<TypeKind>,
    pub return_type: ReturnType,
    pub kind: MethodKind,
    /// The engine hands the calling row's source context to the method.
    pub injects_source: bool,
}

/// Result of matching one signature against argument kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applicability {
    Exact,
    Assignable,
}

impl MethodSignature {
    #[must_use]
    pub fn scalar(name: &str, params: &[TypeKind], return_type: ReturnType) -> Self {
        Self {
            name: name.to_owned(),
            params: params.to_vec(),
            variadic: None,
            return_type,
            kind: MethodKind::Scalar,
            injects_source: false,
        }
    }

    #[must_use]
    pub fn aggregate(name: &str, params: &[TypeKind], return_type: ReturnType) -> Self {
        Self {
            kind: MethodKind::Aggregate,
            ..Self::scalar(name, params, return_type)
        }
    }

    #[must_use]
    pub const fn with_variadic(mut self, kind: TypeKind) -> Self {
        self.variadic = Some(kind);
        self
    }

    #[must_use]
    pub const fn with_source_injection(mut self) -> Self {
        self.injects_source = true;
        self
    }

    /// Declared kind of the argument at `index`, variadic tail included.
    #[must_use]
    pub fn param_at(&self, index: usize) -> Option<TypeKind> {
        self.params.get(index).copied().or(self.variadic)
    }

    fn applicability(&self, args: &[TypeKind]) -> Option<Applicability> {
        if args.len() < self.params.len()
            || (self.variadic.is_none() && args.len() != self.params.len())
        {
            return None;
        }
        let mut exact = true;
        for (i, arg) in args.iter().enumerate() {
            let param = self.param_at(i)?;
            if *arg == param && param != TypeKind::Any {
                continue;
            }
            if !arg.is_assignable_to(param) {
                return None;
            }
            exact = false;
        }
        Some(if exact {
            Applicability::Exact
        } else {
            Applicability::Assignable
        })
    }

    /// Result type for a call with the given argument types.
    pub fn result_type(&self, args: &[SemanticType]) -> Result<SemanticType> {
        match self.return_type {
            ReturnType::Fixed(ty) => Ok(ty),
            ReturnType::Propagating(kind) => {
                Ok(SemanticType::new(kind, args.iter().any(|a| a.nullable)))
            }
            ReturnType::ArgType(i) => args.get(i).copied().ok_or_else(|| {
                MusoqError::internal(format!("{} has no argument {i}", self.name))
            }),
            ReturnType::CommonOfArgs => {
                let mut iter = args.iter().copied();
                let first = iter.next().unwrap_or(SemanticType::NULL);
                iter.try_fold(first, |acc, ty| {
                    acc.unify(ty).ok_or_else(|| {
                        MusoqError::type_mismatch(
                            format!("arguments of {}", self.name),
                            acc.to_string(),
                            ty.to_string(),
                        )
                    })
                })
            }
        }
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        let mut first = true;
        for p in &self.params {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{p}")?;
        }
        if let Some(v) = self.variadic {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{v}...")?;
        }
        f.write_str(")")
    }
}

/// Per-call information the engine passes to a scalar method.
#[derive(Clone, Copy, Default)]
pub struct CallContext<'a> {
    /// Source object of the row being evaluated, for injecting methods.
    pub source_context: Option<&'a SourceContext>,
    /// 1-based ordinal of the row among the rows accepted so far.
    pub row_number: u64,
}

/// A scalar (row-level) method.
///
/// One implementation may serve several overloads; [`Self::signatures`]
/// lists them.
pub trait ScalarMethod: Send + Sync {
    fn invoke(&self, cx: &CallContext<'_>, args: &[Value]) -> Result<Value>;

    /// Canonical display name.
    fn name(&self) -> &str;

    fn signatures(&self) -> Vec<MethodSignature>;
}

/// An aggregate method with typed per-group state.
///
/// # State lifecycle
///
/// 1. [`initial_state`](Self::initial_state) creates a fresh accumulator
///    when a group is first seen.
/// 2. [`set`](Self::set) is called once per row of the group.
/// 3. [`get`](Self::get) consumes the state and produces the group's value.
pub trait AggregateMethod: Send + Sync {
    type State: Send;

    fn initial_state(&self) -> Self::State;

    fn set(&self, state: &mut Self::State, args: &[Value]) -> Result<()>;

    fn get(&self, state: Self::State) -> Result<Value>;

    fn name(&self) -> &str;

    fn signatures(&self) -> Vec<MethodSignature>;
}

/// Type-erased aggregate method object stored by the registry.
pub type ErasedAggregateMethod = dyn AggregateMethod<State = Box<dyn Any + Send>>;

/// Wraps a concrete [`AggregateMethod`] so the registry can store
/// heterogeneous aggregates behind one trait object.
pub struct AggregateAdapter<F> {
    inner: F,
}

impl<F> AggregateAdapter<F> {
    pub const fn new(inner: F) -> Self {
        Self { inner }
    }
}

impl<F> AggregateMethod for AggregateAdapter<F>
where
    F: AggregateMethod,
    F::State: 'static,
{
    type State = Box<dyn Any + Send>;

    fn initial_state(&self) -> Self::State {
        Box::new(self.inner.initial_state())
    }

    fn set(&self, state: &mut Self::State, args: &[Value]) -> Result<()> {
        let concrete = state.downcast_mut::<F::State>().ok_or_else(|| {
            MusoqError::internal(format!("{}: aggregate state type mismatch", self.name()))
        })?;
        self.inner.set(concrete, args)
    }

    fn get(&self, state: Self::State) -> Result<Value> {
        let concrete = state.downcast::<F::State>().map_err(|_| {
            MusoqError::internal(format!("{}: aggregate state type mismatch", self.name()))
        })?;
        self.inner.get(*concrete)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn signatures(&self) -> Vec<MethodSignature> {
        self.inner.signatures()
    }
}

/// A scalar overload chosen for a call site.
#[derive(Clone)]
pub struct ResolvedMethod {
    pub signature: Arc<MethodSignature>,
    pub method: Arc<dyn ScalarMethod>,
    pub return_type: SemanticType,
}

impl fmt::Debug for ResolvedMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedMethod")
            .field("signature", &self.signature.to_string())
            .field("return_type", &self.return_type)
            .finish_non_exhaustive()
    }
}

/// An aggregate overload chosen for a call site: the signature plus the
/// setter/getter pair through [`AggregateMethod`].
#[derive(Clone)]
pub struct ResolvedAggregate {
    pub signature: Arc<MethodSignature>,
    pub method: Arc<ErasedAggregateMethod>,
    pub return_type: SemanticType,
}

impl fmt::Debug for ResolvedAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedAggregate")
            .field("signature", &self.signature.to_string())
            .field("return_type", &self.return_type)
            .finish_non_exhaustive()
    }
}

struct Overload<M: ?Sized> {
    signature: Arc<MethodSignature>,
    method: Arc<M>,
}

impl<M: ?Sized> Clone for Overload<M> {
    fn clone(&self) -> Self {
        Self {
            signature: Arc::clone(&self.signature),
            method: Arc::clone(&self.method),
        }
    }
}

/// Canonical registry key.
fn canonical_name(name: &str) -> String {
    name.to_ascii_uppercase()
}

fn type_names(args: &[SemanticType]) -> Vec<String> {
    args.iter().map(ToString::to_string).collect()
}

/// Pick the single applicable overload, exact matches first.
fn select_overload<'a, M: ?Sized>(
    name: &str,
    overloads: &'a [Overload<M>],
    args: &[SemanticType],
) -> Result<&'a Overload<M>> {
    let kinds: Vec<TypeKind> = args.iter().map(|a| a.kind).collect();
    let mut exact = Vec::new();
    let mut assignable = Vec::new();
    for o in overloads {
        match o.signature.applicability(&kinds) {
            Some(Applicability::Exact) => exact.push(o),
            Some(Applicability::Assignable) => assignable.push(o),
            None => {}
        }
    }
    let (hit, candidates) = if exact.is_empty() {
        ("assignable", assignable)
    } else {
        ("exact", exact)
    };
    match candidates.as_slice() {
        [single] => {
            debug!(name, arity = args.len(), hit, "registry lookup");
            Ok(*single)
        }
        [] => {
            debug!(name, arity = args.len(), hit = "miss", "registry lookup");
            Err(MusoqError::MethodNotFound {
                name: name.to_owned(),
                arg_types: type_names(args),
            })
        }
        many => {
            debug!(name, arity = args.len(), hit = "ambiguous", "registry lookup");
            Err(MusoqError::AmbiguousMethod {
                name: name.to_owned(),
                arg_types: type_names(args),
                candidates: many.iter().map(|o| o.signature.to_string()).collect(),
            })
        }
    }
}

/// Scalar and aggregate overloads keyed by canonical name.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    scalars: HashMap<String, Vec<Overload<dyn ScalarMethod>>>,
    aggregates: HashMap<String, Vec<Overload<ErasedAggregateMethod>>>,
}

impl MethodRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the base library.
    #[must_use]
    pub fn with_base_library() -> Self {
        let mut registry = Self::new();
        crate::library::register_base_library(&mut registry);
        crate::agg_library::register_base_aggregates(&mut registry);
        registry
    }

    /// Register every overload a scalar method declares.
    pub fn register_scalar<F>(&mut self, method: F)
    where
        F: ScalarMethod + 'static,
    {
        let method: Arc<dyn ScalarMethod> = Arc::new(method);
        for signature in method.signatures() {
            self.scalars
                .entry(canonical_name(&signature.name))
                .or_default()
                .push(Overload {
                    signature: Arc::new(signature),
                    method: Arc::clone(&method),
                });
        }
    }

    /// Register every overload an aggregate method declares, through the
    /// type-erasing adapter.
    pub fn register_aggregate<F>(&mut self, method: F)
    where
        F: AggregateMethod + 'static,
        F::State: 'static,
    {
        let method: Arc<ErasedAggregateMethod> = Arc::new(AggregateAdapter::new(method));
        for signature in method.signatures() {
            self.aggregates
                .entry(canonical_name(&signature.name))
                .or_default()
                .push(Overload {
                    signature: Arc::new(signature),
                    method: Arc::clone(&method),
                });
        }
    }

    /// Copy every overload of `other` into `self`.
    pub fn extend(&mut self, other: &Self) {
        for (name, overloads) in &other.scalars {
            self.scalars
                .entry(name.clone())
                .or_default()
                .extend(overloads.iter().cloned());
        }
        for (name, overloads) in &other.aggregates {
            self.aggregates
                .entry(name.clone())
                .or_default()
                .extend(overloads.iter().cloned());
        }
    }

    /// Whether any overload of `name` is an aggregate.
    #[must_use]
    pub fn is_aggregate(&self, name: &str) -> bool {
        self.aggregates.contains_key(&canonical_name(name))
    }

    /// Whether `name` is registered at all.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        let canon = canonical_name(name);
        self.scalars.contains_key(&canon) || self.aggregates.contains_key(&canon)
    }

    pub fn resolve_scalar(&self, name: &str, args: &[SemanticType]) -> Result<ResolvedMethod> {
        let overloads = self
            .scalars
            .get(&canonical_name(name))
            .map_or(&[][..], Vec::as_slice);
        let chosen = select_overload(name, overloads, args)?;
        Ok(ResolvedMethod {
            return_type: chosen.signature.result_type(args)?,
            signature: Arc::clone(&chosen.signature),
            method: Arc::clone(&chosen.method),
        })
    }

    pub fn resolve_aggregate(
        &self,
        name: &str,
        args: &[SemanticType],
    ) -> Result<ResolvedAggregate> {
        let overloads = self
            .aggregates
            .get(&canonical_name(name))
            .map_or(&[][..], Vec::as_slice);
        let chosen = select_overload(name, overloads, args)?;
        Ok(ResolvedAggregate {
            return_type: chosen.signature.result_type(args)?,
            signature: Arc::clone(&chosen.signature),
            method: Arc::clone(&chosen.method),
        })
    }

    /// Number of registered overloads (scalar + aggregate).
    #[must_use]
    pub fn len(&self) -> usize {
        self.scalars.values().map(Vec::len).sum::<usize>()
            + self.aggregates.values().map(Vec::len).sum::<usize>()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
