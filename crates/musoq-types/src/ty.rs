use std::fmt;

/// Compile-time type of an expression or column.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum TypeKind {
    /// Type of the `null` literal; assignable to every other kind.
    Null,
    Bool,
    /// 32-bit signed integer.
    Int,
    /// 64-bit signed integer.
    Long,
    /// 96-bit fixed-point decimal.
    Decimal,
    /// 64-bit IEEE 754 float.
    Double,
    String,
    /// Dynamic type; checked at runtime.
    Any,
}

impl TypeKind {
    /// Position in the numeric tower, `None` for non-numeric kinds.
    #[must_use]
    pub const fn numeric_rank(self) -> Option<u8> {
        match self {
            Self::Int => Some(0),
            Self::Long => Some(1),
            Self::Decimal => Some(2),
            Self::Double => Some(3),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_numeric(self) -> bool {
        self.numeric_rank().is_some()
    }

    #[must_use]
    pub const fn is_integral(self) -> bool {
        matches!(self, Self::Int | Self::Long)
    }

    const fn from_rank(rank: u8) -> Self {
        match rank {
            0 => Self::Int,
            1 => Self::Long,
            2 => Self::Decimal,
            _ => Self::Double,
        }
    }

    /// Binary numeric promotion.
    ///
    /// `Null` adopts the other operand's kind and `Any` stays dynamic.
    /// Returns `None` when either side cannot take part in arithmetic.
    #[must_use]
    pub fn promote(self, other: Self) -> Option<Self> {
        match (self, other) {
            (Self::Null, Self::Null) => Some(Self::Null),
            (Self::Any, k) | (k, Self::Any) if k.is_numeric() || k == Self::Any || k == Self::Null => {
                Some(Self::Any)
            }
            (Self::Null, k) | (k, Self::Null) if k.is_numeric() => Some(k),
            (a, b) => {
                let ra = a.numeric_rank()?;
                let rb = b.numeric_rank()?;
                Some(Self::from_rank(ra.max(rb)))
            }
        }
    }

    /// Whether a value of `self` may be passed where `target` is expected.
    #[must_use]
    pub fn is_assignable_to(self, target: Self) -> bool {
        if self == target || target == Self::Any || self == Self::Null {
            return true;
        }
        match (self.numeric_rank(), target.numeric_rank()) {
            (Some(from), Some(to)) => from <= to,
            _ => false,
        }
    }

    /// Common kind of two branches (CASE arms, set-operation columns).
    #[must_use]
    pub fn unify(self, other: Self) -> Option<Self> {
        if self == other {
            return Some(self);
        }
        match (self, other) {
            (Self::Null, k) | (k, Self::Null) => Some(k),
            (Self::Any, _) | (_, Self::Any) => Some(Self::Any),
            (a, b) if a.is_numeric() && b.is_numeric() => a.promote(b),
            _ => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Null => "Null",
            Self::Bool => "Bool",
            Self::Int => "Int",
            Self::Long => "Long",
            Self::Decimal => "Decimal",
            Self::Double => "Double",
            Self::String => "String",
            Self::Any => "Any",
        }
    }
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Nullable-aware type attached to every typed expression.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct SemanticType {
    pub kind: TypeKind,
    pub nullable: bool,
}

impl SemanticType {
    pub const NULL: Self = Self::new(TypeKind::Null, true);
    pub const BOOL: Self = Self::new(TypeKind::Bool, false);
    pub const ANY: Self = Self::new(TypeKind::Any, true);

    #[must_use]
    pub const fn new(kind: TypeKind, nullable: bool) -> Self {
        Self { kind, nullable }
    }

    #[must_use]
    pub const fn non_null(kind: TypeKind) -> Self {
        Self::new(kind, false)
    }

    #[must_use]
    pub const fn nullable(kind: TypeKind) -> Self {
        Self::new(kind, true)
    }

    #[must_use]
    pub const fn with_nullable(self, nullable: bool) -> Self {
        Self::new(self.kind, nullable)
    }

    /// Common type of two branches; nullable if either side is.
    #[must_use]
    pub fn unify(self, other: Self) -> Option<Self> {
        let kind = self.kind.unify(other.kind)?;
        Some(Self::new(kind, self.nullable || other.nullable))
    }
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nullable && self.kind != TypeKind::Null && self.kind != TypeKind::Any {
            write!(f, "{}?", self.kind)
        } else {
            write!(f, "{}", self.kind)
        }
    }
}

/// Column descriptor exposed by a table or produced by a query.
///
/// Identity (equality and hashing) covers name, index and type together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SchemaColumn {
    pub name: String,
    /// Stable ordinal used for positional access.
    pub index: usize,
    pub ty: SemanticType,
}

impl SchemaColumn {
    #[must_use]
    pub fn new(name: impl Into<String>, index: usize, ty: SemanticType) -> Self {
        Self {
            name: name.into(),
            index,
            ty,
        }
    }
}
