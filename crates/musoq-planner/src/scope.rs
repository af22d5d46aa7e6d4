//! Scope arena and replay cursor.
//!
//! The metadata pass creates scopes in a fixed order: one per statement, CTE,
//! set-operation branch, FROM source and subquery. Parent/child links are
//! indices into the arena. Later passes replay the recorded creation order
//! with a [`ScopeWalker`], which fails if a pass visits the tree in a
//! different shape than the metadata pass built it.
//!
//! Symbol tables are append-only: there is no removal API.

use std::fmt;

use musoq_ast::{CompoundOp, JoinKind};
use musoq_error::{MusoqError, Result};
use musoq_types::SchemaColumn;

/// Stable index of a scope in its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub u32);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    /// Top-level statement.
    Query,
    /// Body of a `WITH name AS (...)` definition.
    Cte,
    /// One SELECT of a (possibly single-branch) set-operation chain.
    Branch,
    /// One FROM / JOIN / APPLY source.
    Source,
    /// A `(SELECT ...)` used as a FROM source.
    Subquery,
}

impl ScopeKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Cte => "cte",
            Self::Branch => "branch",
            Self::Source => "source",
            Self::Subquery => "subquery",
        }
    }
}

/// Physical strategy for an equi- or theta-join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinStrategy {
    NestedLoop,
    SortMerge,
    Hash,
    /// Right side re-opened per left row.
    Apply,
}

impl JoinStrategy {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NestedLoop => "nested-loop",
            Self::SortMerge => "sort-merge",
            Self::Hash => "hash",
            Self::Apply => "apply",
        }
    }
}

impl fmt::Display for JoinStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed fact recorded in a scope.
#[derive(Debug, Clone, PartialEq)]
pub enum Symbol {
    /// A FROM source bound under `alias`.
    Table {
        alias: String,
        schema: Option<String>,
        table: String,
        columns: Vec<SchemaColumn>,
        position: u32,
    },
    /// Output columns of a CTE.
    CteOutput {
        name: String,
        columns: Vec<SchemaColumn>,
    },
    /// Output columns of a branch or statement.
    OutputColumns(Vec<SchemaColumn>),
    /// Canonical text of each GROUP BY key.
    GroupKeys(Vec<String>),
    /// Canonical text of each aggregate slot.
    AggregateSlots(Vec<String>),
    /// Strategy picked for the join that introduced this source.
    Join {
        kind: JoinKind,
        strategy: JoinStrategy,
        key_pairs: usize,
    },
    /// Shape of a set-operation chain.
    SetShape { ops: Vec<CompoundOp>, arity: usize },
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub id: ScopeId,
    pub parent: Option<ScopeId>,
    pub children: Vec<ScopeId>,
    pub kind: ScopeKind,
    symbols: Vec<Symbol>,
}

impl Scope {
    #[must_use]
    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }
}

/// Arena of scopes in creation order.
#[derive(Debug, Clone, Default)]
pub struct ScopeArena {
    scopes: Vec<Scope>,
}

impl ScopeArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a scope under `parent` and record it in the creation order.
    pub fn push(&mut self, parent: Option<ScopeId>, kind: ScopeKind) -> Result<ScopeId> {
        let raw = u32::try_from(self.scopes.len())
            .map_err(|_| MusoqError::internal("scope arena overflow"))?;
        let id = ScopeId(raw);
        if let Some(p) = parent {
            self.get_mut(p)?.children.push(id);
        }
        self.scopes.push(Scope {
            id,
            parent,
            children: Vec::new(),
            kind,
            symbols: Vec::new(),
        });
        Ok(id)
    }

    pub fn get(&self, id: ScopeId) -> Result<&Scope> {
        self.scopes
            .get(id.0 as usize)
            .ok_or_else(|| MusoqError::internal(format!("unknown scope {id}")))
    }

    fn get_mut(&mut self, id: ScopeId) -> Result<&mut Scope> {
        self.scopes
            .get_mut(id.0 as usize)
            .ok_or_else(|| MusoqError::internal(format!("unknown scope {id}")))
    }

    /// Append a symbol to `id`.
    pub fn add_symbol(&mut self, id: ScopeId, symbol: Symbol) -> Result<()> {
        self.get_mut(id)?.symbols.push(symbol);
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Scope> {
        self.scopes.iter()
    }

    /// Replay cursor positioned before the first scope.
    #[must_use]
    pub fn walker(&self) -> ScopeWalker<'_> {
        ScopeWalker {
            arena: self,
            cursor: 0,
            stack: Vec::new(),
        }
    }
}

/// Index cursor that replays the arena's creation order.
pub struct ScopeWalker<'a> {
    arena: &'a ScopeArena,
    cursor: usize,
    stack: Vec<ScopeId>,
}

impl<'a> ScopeWalker<'a> {
    /// Step into the next recorded scope, which must have kind `expected`
    /// and be a child of the scope currently entered.
    pub fn enter(&mut self, expected: ScopeKind) -> Result<ScopeId> {
        let scope = self.arena.scopes.get(self.cursor).ok_or_else(|| {
            MusoqError::internal(format!(
                "scope replay ran past the end looking for a {} scope",
                expected.as_str()
            ))
        })?;
        if scope.kind != expected || scope.parent != self.stack.last().copied() {
            return Err(MusoqError::internal(format!(
                "scope replay out of order at {}: expected {} under {:?}, found {} under {:?}",
                scope.id,
                expected.as_str(),
                self.stack.last(),
                scope.kind.as_str(),
                scope.parent
            )));
        }
        self.cursor += 1;
        self.stack.push(scope.id);
        Ok(scope.id)
    }

    /// Leave the innermost entered scope.
    pub fn exit(&mut self) -> Result<()> {
        self.stack
            .pop()
            .map(|_| ())
            .ok_or_else(|| MusoqError::internal("scope replay exited past the root"))
    }

    #[must_use]
    pub fn current(&self) -> Option<ScopeId> {
        self.stack.last().copied()
    }

    #[must_use]
    pub const fn arena(&self) -> &'a ScopeArena {
        self.arena
    }

    /// Whether every recorded scope has been replayed and exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.cursor == self.arena.scopes.len() && self.stack.is_empty()
    }

    /// Fail unless the replay consumed the whole arena.
    pub fn finish(&self) -> Result<()> {
        if self.is_finished() {
            Ok(())
        } else {
            Err(MusoqError::internal(format!(
                "scope replay stopped at {} of {} scopes",
                self.cursor,
                self.arena.scopes.len()
            )))
        }
    }
}
