//! Query-level properties checked against simple in-memory models.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use musoq::{
    CompilationOptions, Engine, EngineConfig, InMemorySchema, InMemorySchemaProvider, Row,
    SchemaColumn, SemanticType, Table, TypeKind, Value,
};
use proptest::prelude::*;

// ── Fixtures ──────────────────────────────────────────────────────────────

fn int_col(name: &str, index: usize) -> SchemaColumn {
    SchemaColumn::new(name, index, SemanticType::non_null(TypeKind::Int))
}

fn items(rows: &[(i32, String)]) -> Table {
    let cols = vec![
        int_col("A", 0),
        SchemaColumn::new("B", 1, SemanticType::non_null(TypeKind::String)),
    ];
    let rows = rows
        .iter()
        .map(|(a, b)| Row::new(vec![Value::Int(*a), Value::from(b.as_str())]))
        .collect();
    Table::with_rows("items", cols, rows).unwrap()
}

fn others(rows: &[(Option<i32>, i32)]) -> Table {
    let cols = vec![
        SchemaColumn::new("K", 0, SemanticType::nullable(TypeKind::Int)),
        int_col("P", 1),
    ];
    let rows = rows
        .iter()
        .map(|(k, p)| Row::new(vec![k.map_or(Value::Null, Value::Int), Value::Int(*p)]))
        .collect();
    Table::with_rows("others", cols, rows).unwrap()
}

fn ints(name: &str, values: &[i32]) -> Table {
    let rows = values.iter().map(|v| Row::new(vec![Value::Int(*v)])).collect();
    Table::with_rows(name, vec![int_col("A", 0)], rows).unwrap()
}

fn engine(tables: Vec<Table>, compilation: CompilationOptions) -> Engine {
    let schema = tables
        .into_iter()
        .fold(InMemorySchema::new("t").with_chunk_size(7), InMemorySchema::with_table);
    let provider = InMemorySchemaProvider::new().with_schema(schema);
    let config = EngineConfig {
        compilation,
        ..EngineConfig::default()
    };
    Engine::with_config(Arc::new(provider), config).unwrap()
}

fn compare_rows(a: &[Value], b: &[Value]) -> Ordering {
    a.iter()
        .zip(b)
        .map(|(x, y)| x.compare(y))
        .find(|o| o.is_ne())
        .unwrap_or_else(|| a.len().cmp(&b.len()))
}

fn sorted(table: &Table) -> Vec<Vec<Value>> {
    let mut rows: Vec<Vec<Value>> = table.rows().iter().map(|r| r.values().to_vec()).collect();
    rows.sort_by(|a, b| compare_rows(a, b));
    rows
}

fn int_values(table: &Table) -> Vec<i32> {
    table
        .column_values(0)
        .into_iter()
        .map(|v| match v {
            Value::Int(i) => i,
            _ => unreachable!("expected Int"),
        })
        .collect()
}

fn longs(name: &str, values: &[Option<i64>]) -> Table {
    let cols = vec![SchemaColumn::new("K", 0, SemanticType::nullable(TypeKind::Long))];
    let rows = values
        .iter()
        .map(|v| Row::new(vec![v.map_or(Value::Null, Value::Long)]))
        .collect();
    Table::with_rows(name, cols, rows).unwrap()
}

fn doubles(name: &str, values: &[f64]) -> Table {
    let cols = vec![SchemaColumn::new("D", 0, SemanticType::non_null(TypeKind::Double))];
    let rows = values.iter().map(|v| Row::new(vec![Value::Double(*v)])).collect();
    Table::with_rows(name, cols, rows).unwrap()
}

const NESTED_LOOP: CompilationOptions = CompilationOptions {
    use_sort_merge_join: false,
    use_hash_join: false,
};
const SORT_MERGE: CompilationOptions = CompilationOptions {
    use_sort_merge_join: true,
    use_hash_join: false,
};
const HASH: CompilationOptions = CompilationOptions {
    use_sort_merge_join: false,
    use_hash_join: true,
};

fn item_rows() -> impl Strategy<Value = Vec<(i32, String)>> {
    proptest::collection::vec((-20_i32..20, "[a-c]{1,2}"), 0..40)
}

// ── Literal queries ───────────────────────────────────────────────────────

#[test]
fn literal_query_is_one_row() {
    let e = engine(Vec::new(), CompilationOptions::default());
    let t = e.query("SELECT 2 + 1, 10 - 4 * 2, 'a' + 'b'").unwrap();
    assert_eq!(t.count(), 1);
    assert_eq!(
        t.rows()[0].values(),
        &[Value::Int(3), Value::Int(2), Value::from("ab")]
    );
}

#[test]
fn literal_promotion_follows_the_numeric_tower() {
    let e = engine(Vec::new(), CompilationOptions::default());
    let t = e.query("SELECT 1 + 2.5").unwrap();
    assert_eq!(t.columns()[0].ty.kind, TypeKind::Decimal);
    assert_eq!(t.rows()[0][0].to_string(), "3.5");
}

#[test]
fn mixed_width_results_share_one_kind() {
    let tables = || vec![ints("lhs", &[1, 2, 2]), longs("wide", &[Some(1), Some(2), None])];
    let e = engine(tables(), CompilationOptions::default());

    let t = e
        .query("SELECT Coalesce(A, 0l) FROM #t.lhs() UNION SELECT K FROM #t.wide() WHERE K IS NOT NULL")
        .unwrap();
    assert_eq!(sorted(&t), vec![vec![Value::Long(1)], vec![Value::Long(2)]]);

    let t = e
        .query("SELECT CASE WHEN A > 1 THEN A ELSE 0l END FROM #t.lhs()")
        .unwrap();
    assert_eq!(t.column_values(0), vec![Value::Long(0), Value::Long(2), Value::Long(2)]);

    let query = "WITH c AS (SELECT Coalesce(A, 0l) AS X FROM #t.lhs()) \
                 SELECT x.X, w.K FROM c x INNER JOIN #t.wide() w ON x.X = w.K";
    for options in [NESTED_LOOP, SORT_MERGE, HASH] {
        let t = engine(tables(), options).query(query).unwrap();
        assert_eq!(t.count(), 3, "{options:?}");
    }
}

#[test]
fn signed_zero_is_one_value() {
    let e = engine(vec![doubles("ds", &[0.0, -0.0, 1.5])], CompilationOptions::default());
    let t = e.query("SELECT -0.0f = 0.0f").unwrap();
    assert_eq!(t.rows()[0][0], Value::Bool(true));
    let t = e.query("SELECT D FROM #t.ds() GROUP BY D").unwrap();
    assert_eq!(t.count(), 2);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    // ── Passthrough and filtering ─────────────────────────────────────────

    #[test]
    fn passthrough_keeps_every_row_and_select_order(rows in item_rows()) {
        let e = engine(vec![items(&rows)], CompilationOptions::default());
        let t = e.query("SELECT B, A FROM #t.items()").unwrap();
        prop_assert_eq!(t.count(), rows.len());
        let names: Vec<&str> = t.columns().iter().map(|c| c.name.as_str()).collect();
        prop_assert_eq!(names, vec!["B", "A"]);
        for (row, (a, b)) in t.rows().iter().zip(&rows) {
            prop_assert_eq!(row.values(), &[Value::from(b.as_str()), Value::Int(*a)]);
        }
    }

    #[test]
    fn where_is_a_pure_predicate(rows in item_rows(), threshold in -20_i32..20) {
        let e = engine(vec![items(&rows)], CompilationOptions::default());
        let query = format!("SELECT A FROM #t.items() WHERE A > {threshold}");
        let first = e.query(&query).unwrap();
        let expected: Vec<i32> = rows.iter().map(|(a, _)| *a).filter(|a| *a > threshold).collect();
        prop_assert_eq!(int_values(&first), expected);
        let again = e.query(&query).unwrap();
        prop_assert_eq!(sorted(&first), sorted(&again));
    }

    // ── Grouping ──────────────────────────────────────────────────────────

    #[test]
    fn group_aggregates_match_partitions(rows in item_rows()) {
        let e = engine(vec![items(&rows)], CompilationOptions::default());
        let t = e.query("SELECT B, Count(A), Sum(A) FROM #t.items() GROUP BY B").unwrap();
        let mut model: HashMap<String, (i32, i64)> = HashMap::new();
        for (a, b) in &rows {
            let entry = model.entry(b.clone()).or_default();
            entry.0 += 1;
            entry.1 += i64::from(*a);
        }
        prop_assert_eq!(t.count(), model.len());
        for row in t.rows() {
            let key = row[0].to_string();
            let (count, sum) = model[&key];
            prop_assert_eq!(&row[1], &Value::Int(count));
            prop_assert_eq!(&row[2], &Value::Long(sum));
        }
    }

    // ── Joins ─────────────────────────────────────────────────────────────

    #[test]
    fn join_strategies_agree(
        left in proptest::collection::vec((-5_i32..5, "[a-b]"), 0..20),
        right in proptest::collection::vec((proptest::option::of(-5_i32..5), -3_i32..3), 0..20),
    ) {
        let queries = [
            "SELECT a.A, a.B, o.K, o.P FROM #t.items() a INNER JOIN #t.others() o ON a.A = o.K",
            "SELECT a.A, o.P FROM #t.items() a LEFT OUTER JOIN #t.others() o ON o.K = a.A",
            "SELECT a.B, o.K FROM #t.items() a RIGHT OUTER JOIN #t.others() o ON a.A = o.K",
            "SELECT a.A, o.P FROM #t.items() a INNER JOIN #t.others() o ON a.A = o.K AND o.P > 0",
            "SELECT a.A, o.P FROM #t.items() a INNER JOIN #t.others() o ON a.A = o.K AND a.A = o.P",
        ];
        let engines = [NESTED_LOOP, SORT_MERGE, HASH]
            .map(|options| engine(vec![items(&left), others(&right)], options));
        for query in queries {
            let expected = sorted(&engines[0].query(query).unwrap());
            for e in &engines[1..] {
                prop_assert_eq!(&sorted(&e.query(query).unwrap()), &expected, "{}", query);
            }
        }
    }

    #[test]
    fn double_join_strategies_agree(
        left in proptest::collection::vec(prop_oneof![Just(0.0), Just(-0.0), Just(1.5)], 0..12),
        right in proptest::collection::vec(prop_oneof![Just(0.0), Just(-0.0), Just(1.5)], 0..12),
    ) {
        let query = "SELECT l.D, r.D FROM #t.lhs() l INNER JOIN #t.rhs() r ON l.D = r.D";
        let counts = [NESTED_LOOP, SORT_MERGE, HASH].map(|options| {
            engine(vec![doubles("lhs", &left), doubles("rhs", &right)], options)
                .query(query)
                .unwrap()
                .count()
        });
        let zero = |v: &[f64]| v.iter().filter(|d| **d == 0.0).count();
        let half = |v: &[f64]| v.len() - zero(v);
        let expected = zero(&left) * zero(&right) + half(&left) * half(&right);
        prop_assert_eq!(counts, [expected; 3]);
    }

    // ── Set operations ────────────────────────────────────────────────────

    #[test]
    fn set_operations_follow_row_membership(
        lhs in proptest::collection::vec(0_i32..6, 0..15),
        rhs in proptest::collection::vec(0_i32..6, 0..15),
    ) {
        let e = engine(vec![ints("lhs", &lhs), ints("rhs", &rhs)], CompilationOptions::default());
        let run = |op: &str| {
            let mut v = int_values(
                &e.query(&format!("SELECT A FROM #t.lhs() {op} SELECT A FROM #t.rhs()")).unwrap(),
            );
            v.sort_unstable();
            v
        };
        let mut all: Vec<i32> = lhs.iter().chain(&rhs).copied().collect();
        all.sort_unstable();
        prop_assert_eq!(run("UNION ALL"), all.clone());
        all.dedup();
        prop_assert_eq!(run("UNION"), all);

        let mut left_set = lhs.clone();
        left_set.sort_unstable();
        left_set.dedup();
        let intersect: Vec<i32> = left_set.iter().copied().filter(|v| rhs.contains(v)).collect();
        let except: Vec<i32> = left_set.iter().copied().filter(|v| !rhs.contains(v)).collect();
        prop_assert_eq!(run("INTERSECT"), intersect);
        prop_assert_eq!(run("EXCEPT"), except);
    }

    // ── SKIP / TAKE ───────────────────────────────────────────────────────

    #[test]
    fn skip_take_is_a_window_over_the_order(
        values in proptest::collection::vec(-50_i32..50, 0..30),
        skip in 0_usize..35,
        take in 0_usize..35,
    ) {
        let e = engine(vec![ints("lhs", &values)], CompilationOptions::default());
        let t = e
            .query(&format!("SELECT A FROM #t.lhs() ORDER BY A SKIP {skip} TAKE {take}"))
            .unwrap();
        let mut expected = values.clone();
        expected.sort_unstable();
        let expected: Vec<i32> = expected.into_iter().skip(skip).take(take).collect();
        prop_assert_eq!(int_values(&t), expected);
    }
}
