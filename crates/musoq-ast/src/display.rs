//! Query pretty-printing via `fmt::Display`.
//!
//! Printing then re-parsing a tree yields an equivalent tree. Operands that
//! are themselves operators are parenthesized, so printed text never depends
//! on precedence rules to parse back.

#[allow(clippy::wildcard_imports)]
use crate::*;
use std::fmt;

fn comma_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

fn needs_quoting(name: &str) -> bool {
    let Some(first) = name.chars().next() else {
        return true;
    };
    if !(first.is_alphabetic() || first == '_') {
        return true;
    }
    name.chars().any(|c| !(c.is_alphanumeric() || c == '_')) || is_keyword(name)
}

fn write_ident(f: &mut fmt::Formatter<'_>, name: &str) -> fmt::Result {
    if needs_quoting(name) {
        write!(f, "[{name}]")
    } else {
        f.write_str(name)
    }
}

fn write_operand(f: &mut fmt::Formatter<'_>, expr: &Expr) -> fmt::Result {
    if matches!(
        expr,
        Expr::BinaryOp { .. }
            | Expr::UnaryOp { .. }
            | Expr::In { .. }
            | Expr::Like { .. }
            | Expr::IsNull { .. }
    ) {
        write!(f, "({expr})")
    } else {
        write!(f, "{expr}")
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Long(n) => {
                if i32::try_from(*n).is_ok() {
                    write!(f, "{n}l")
                } else {
                    write!(f, "{n}")
                }
            }
            Self::Decimal(d) => {
                if d.scale() > 0 {
                    write!(f, "{d}")
                } else {
                    write!(f, "{d}d")
                }
            }
            Self::Double(v) => write!(f, "{v}f"),
            Self::String(s) => {
                f.write_str("'")?;
                for c in s.chars() {
                    match c {
                        '\'' => f.write_str("\\'")?,
                        '\\' => f.write_str("\\\\")?,
                        '\n' => f.write_str("\\n")?,
                        '\r' => f.write_str("\\r")?,
                        '\t' => f.write_str("\\t")?,
                        other => write!(f, "{other}")?,
                    }
                }
                f.write_str("'")
            }
            Self::Bool(true) => f.write_str("true"),
            Self::Bool(false) => f.write_str("false"),
            Self::Null => f.write_str("null"),
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(q) = &self.qualifier {
            write_ident(f, q)?;
            f.write_str(".")?;
        }
        write_ident(f, &self.name)
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Multiply => "*",
            Self::Divide => "/",
            Self::Modulo => "%",
            Self::Add => "+",
            Self::Subtract => "-",
            Self::ShiftLeft => "<<",
            Self::ShiftRight => ">>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::BitAnd => "&",
            Self::BitXor => "^",
            Self::BitOr => "|",
            Self::And => "and",
            Self::Or => "or",
        })
    }
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Negate => "-",
            Self::BitNot => "~",
            Self::Not => "not ",
        })
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(lit, _) => write!(f, "{lit}"),
            Self::Column(col, _) => write!(f, "{col}"),
            Self::BinaryOp {
                left, op, right, ..
            } => {
                write_operand(f, left)?;
                write!(f, " {op} ")?;
                write_operand(f, right)
            }
            Self::UnaryOp { op, expr, .. } => {
                write!(f, "{op}")?;
                write_operand(f, expr)
            }
            Self::FunctionCall {
                qualifier,
                name,
                args,
                ..
            } => {
                if let Some(q) = qualifier {
                    write_ident(f, q)?;
                    f.write_str(".")?;
                }
                write_ident(f, name)?;
                f.write_str("(")?;
                comma_list(f, args)?;
                f.write_str(")")
            }
            Self::Case {
                whens, else_expr, ..
            } => {
                f.write_str("case")?;
                for (cond, result) in whens {
                    write!(f, " when {cond} then {result}")?;
                }
                if let Some(e) = else_expr {
                    write!(f, " else {e}")?;
                }
                f.write_str(" end")
            }
            Self::In {
                expr, list, not, ..
            } => {
                write_operand(f, expr)?;
                f.write_str(if *not { " not in (" } else { " in (" })?;
                comma_list(f, list)?;
                f.write_str(")")
            }
            Self::Like {
                expr, pattern, not, ..
            } => {
                write_operand(f, expr)?;
                f.write_str(if *not { " not like " } else { " like " })?;
                write_operand(f, pattern)
            }
            Self::IsNull { expr, not, .. } => {
                write_operand(f, expr)?;
                f.write_str(if *not { " is not null" } else { " is null" })
            }
        }
    }
}

impl fmt::Display for ResultColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Star => f.write_str("*"),
            Self::TableStar(alias) => {
                write_ident(f, alias)?;
                f.write_str(".*")
            }
            Self::Expr { expr, alias } => {
                write!(f, "{expr}")?;
                if let Some(a) = alias {
                    f.write_str(" as ")?;
                    write_ident(f, a)?;
                }
                Ok(())
            }
        }
    }
}

fn write_alias(f: &mut fmt::Formatter<'_>, alias: Option<&str>) -> fmt::Result {
    if let Some(a) = alias {
        f.write_str(" ")?;
        write_ident(f, a)?;
    }
    Ok(())
}

impl fmt::Display for FromSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SchemaMethod {
                schema,
                method,
                args,
                alias,
                ..
            } => {
                f.write_str("#")?;
                write_ident(f, schema)?;
                f.write_str(".")?;
                write_ident(f, method)?;
                f.write_str("(")?;
                comma_list(f, args)?;
                f.write_str(")")?;
                write_alias(f, alias.as_deref())
            }
            Self::Reference { name, alias, .. } => {
                write_ident(f, name)?;
                write_alias(f, alias.as_deref())
            }
            Self::Subquery { query, alias, .. } => {
                write!(f, "({query})")?;
                write_alias(f, alias.as_deref())
            }
        }
    }
}

impl fmt::Display for JoinClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kw = match self.kind {
            JoinKind::Inner => "inner join",
            JoinKind::LeftOuter => "left outer join",
            JoinKind::RightOuter => "right outer join",
            JoinKind::CrossApply => "cross apply",
            JoinKind::OuterApply => "outer apply",
        };
        write!(f, "{kw} {}", self.source)?;
        if let Some(on) = &self.on {
            write!(f, " on {on}")?;
        }
        Ok(())
    }
}

impl fmt::Display for FromClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)?;
        for join in &self.joins {
            write!(f, " {join}")?;
        }
        Ok(())
    }
}

impl fmt::Display for SelectCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("select ")?;
        if self.distinct {
            f.write_str("distinct ")?;
        }
        comma_list(f, &self.columns)?;
        if let Some(from) = &self.from {
            write!(f, " from {from}")?;
        }
        if let Some(w) = &self.where_clause {
            write!(f, " where {w}")?;
        }
        if !self.group_by.is_empty() {
            f.write_str(" group by ")?;
            comma_list(f, &self.group_by)?;
        }
        if let Some(h) = &self.having {
            write!(f, " having {h}")?;
        }
        Ok(())
    }
}

impl fmt::Display for CompoundOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Union => "union",
            Self::UnionAll => "union all",
            Self::Intersect => "intersect",
            Self::Except => "except",
        })
    }
}

impl fmt::Display for SelectBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.select)?;
        for (op, core) in &self.compounds {
            write!(f, " {op} {core}")?;
        }
        Ok(())
    }
}

impl fmt::Display for OrderingTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr)?;
        if self.direction == SortDirection::Desc {
            f.write_str(" desc")?;
        }
        Ok(())
    }
}

impl fmt::Display for Cte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_ident(f, &self.name)?;
        write!(f, " as ({})", self.query)
    }
}

impl fmt::Display for SelectStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(with) = &self.with {
            f.write_str("with ")?;
            comma_list(f, &with.ctes)?;
            f.write_str(" ")?;
        }
        write!(f, "{}", self.body)?;
        if !self.order_by.is_empty() {
            f.write_str(" order by ")?;
            comma_list(f, &self.order_by)?;
        }
        if let Some(n) = self.skip {
            write!(f, " skip {n}")?;
        }
        if let Some(n) = self.take {
            write!(f, " take {n}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str) -> Expr {
        Expr::Column(ColumnRef::bare(name), Span::ZERO)
    }

    fn int(n: i32) -> Expr {
        Expr::Literal(Literal::Int(n), Span::ZERO)
    }

    #[test]
    fn nested_binary_ops_are_parenthesized() {
        let e = Expr::BinaryOp {
            left: Box::new(Expr::BinaryOp {
                left: Box::new(int(1)),
                op: BinaryOp::Add,
                right: Box::new(int(2)),
                span: Span::ZERO,
            }),
            op: BinaryOp::Multiply,
            right: Box::new(col("x")),
            span: Span::ZERO,
        };
        assert_eq!(e.to_string(), "(1 + 2) * x");
    }

    #[test]
    fn keyword_identifiers_are_bracketed() {
        let c = ColumnRef::qualified("t", "Select");
        assert_eq!(c.to_string(), "t.[Select]");
        let c = ColumnRef::bare("Has Space");
        assert_eq!(c.to_string(), "[Has Space]");
    }

    #[test]
    fn literal_suffixes_preserve_kind() {
        assert_eq!(Literal::Long(5).to_string(), "5l");
        assert_eq!(Literal::Long(5_000_000_000).to_string(), "5000000000");
        assert_eq!(Literal::Decimal(Decimal::new(15, 1)).to_string(), "1.5");
        assert_eq!(Literal::Decimal(Decimal::new(3, 0)).to_string(), "3d");
        assert_eq!(Literal::Double(2.5).to_string(), "2.5f");
        assert_eq!(Literal::String("it's".into()).to_string(), "'it\\'s'");
    }

    #[test]
    fn statement_prints_all_clauses() {
        let stmt = SelectStatement {
            with: None,
            body: SelectBody {
                select: SelectCore {
                    distinct: true,
                    columns: vec![ResultColumn::Expr {
                        expr: col("Name"),
                        alias: Some("n".into()),
                    }],
                    from: Some(FromClause {
                        source: FromSource::SchemaMethod {
                            schema: "test".into(),
                            method: "entities".into(),
                            args: vec![int(3)],
                            alias: Some("e".into()),
                            span: Span::ZERO,
                        },
                        joins: vec![],
                    }),
                    where_clause: Some(Box::new(Expr::IsNull {
                        expr: Box::new(col("Name")),
                        not: true,
                        span: Span::ZERO,
                    })),
                    group_by: vec![col("Name")],
                    having: None,
                    span: Span::ZERO,
                },
                compounds: vec![],
            },
            order_by: vec![OrderingTerm {
                expr: col("n"),
                direction: SortDirection::Desc,
            }],
            skip: Some(1),
            take: Some(2),
            span: Span::ZERO,
        };
        assert_eq!(
            stmt.to_string(),
            "select distinct Name as n from #test.entities(3) e where Name is not null \
             group by Name order by n desc skip 1 take 2"
        );
    }
}
