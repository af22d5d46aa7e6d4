//! End-to-end scenarios through the public facade.

use std::collections::HashMap;
use std::sync::Arc;

use musoq::{
    parse_query, CancellationToken, Engine, EngineConfig, EnvironmentVariables, ErrorCode,
    InMemorySchema, InMemorySchemaProvider, MusoqError, Row, SchemaColumn, SemanticType, Table,
    TypeKind, Value,
};
use proptest::prelude::*;

fn entities() -> Table {
    let cols = vec![
        SchemaColumn::new("Id", 0, SemanticType::non_null(TypeKind::Int)),
        SchemaColumn::new("Name", 1, SemanticType::non_null(TypeKind::String)),
        SchemaColumn::new("Category", 2, SemanticType::nullable(TypeKind::String)),
    ];
    let rows = [(1, "A", "X"), (2, "B", "X"), (3, "C", "Y"), (4, "D", "X"), (5, "E", "Y")]
        .iter()
        .map(|(id, name, cat)| Row::new(vec![Value::Int(*id), Value::from(*name), Value::from(*cat)]))
        .collect();
    Table::with_rows("entities", cols, rows).unwrap()
}

fn pair() -> Table {
    let cols = vec![SchemaColumn::new("Name", 0, SemanticType::non_null(TypeKind::String))];
    let rows = vec![Row::new(vec![Value::from("A")]), Row::new(vec![Value::from("B")])];
    Table::with_rows("pair", cols, rows).unwrap()
}

fn engine() -> Engine {
    let schema = InMemorySchema::new("test").with_table(entities()).with_table(pair());
    Engine::new(Arc::new(InMemorySchemaProvider::new().with_schema(schema)))
}

fn strings(table: &Table, index: usize) -> Vec<String> {
    table.column_values(index).iter().map(ToString::to_string).collect()
}

// ── Scenarios ─────────────────────────────────────────────────────────────

#[test]
fn select_names_from_entities() {
    let table = engine().query("SELECT Name FROM #test.pair()").unwrap();
    assert_eq!(table.columns().len(), 1);
    assert_eq!(table.columns()[0].name, "Name");
    assert_eq!(strings(&table, 0), vec!["A", "B"]);
}

#[test]
fn count_per_category() {
    let table = engine()
        .query("SELECT Count(Id) FROM #test.entities() GROUP BY Category")
        .unwrap();
    let mut counts = table.column_values(0);
    counts.sort_by(Value::compare);
    assert_eq!(counts, vec![Value::Int(2), Value::Int(3)]);
}

#[test]
fn case_and_like_in_projection() {
    let table = engine()
        .query(
            "SELECT Name, CASE WHEN Category = 'X' THEN 'ex' ELSE 'other' END \
             FROM #test.entities() WHERE Name LIKE '%a%' OR Id IN (3, 5)",
        )
        .unwrap();
    assert_eq!(strings(&table, 0), vec!["A", "C", "E"]);
    assert_eq!(strings(&table, 1), vec!["ex", "other", "other"]);
}

#[test]
fn distinct_with_order() {
    let table = engine()
        .query("SELECT DISTINCT Category FROM #test.entities() ORDER BY Category DESC")
        .unwrap();
    assert_eq!(strings(&table, 0), vec!["Y", "X"]);
}

#[test]
fn unknown_schema_is_a_compile_error() {
    let err = engine().query("SELECT Name FROM #nope.pair()").unwrap_err();
    assert!(err.is_compile_time());
    assert!(!matches!(err.error_code(), ErrorCode::Interrupt));
}

#[test]
fn syntax_error_is_reported_before_planning() {
    let err = engine().query("SELECT FROM").unwrap_err();
    assert!(err.is_compile_time());
    assert!(engine().cache().is_empty());
}

#[test]
fn cancelled_token_stops_execution() {
    let e = engine();
    let token = CancellationToken::new();
    let compiled = e
        .compile("SELECT Name FROM #test.entities()", EnvironmentVariables::new(), &token)
        .unwrap();
    token.cancel_with_reason("shutdown");
    let err = compiled.run(&token).unwrap_err();
    assert!(matches!(err, MusoqError::Cancelled));
}

#[test]
fn environment_changes_the_cache_key() {
    let e = engine();
    let token = CancellationToken::new();
    let query = "SELECT Name FROM #test.pair()";
    e.compile(query, EnvironmentVariables::new(), &token).unwrap();
    let mut env = EnvironmentVariables::new();
    env.insert(0, HashMap::from([("A".to_owned(), "1".to_owned())]));
    e.compile(query, env, &token).unwrap();
    assert_eq!(e.cache().len(), 2);
}

#[test]
fn config_loads_from_json() {
    let config = EngineConfig::from_json_str(
        r#"{"execution": {"parallelism": 2}, "plan_cache": {"capacity": 4}}"#,
    )
    .unwrap();
    assert_eq!(config.execution.parallelism, 2);
    assert_eq!(config.plan_cache.capacity, 4);
    let schema = InMemorySchema::new("test").with_table(entities());
    let e = Engine::with_config(
        Arc::new(InMemorySchemaProvider::new().with_schema(schema)),
        config,
    )
    .unwrap();
    let table = e.query("SELECT Id * 10 FROM #test.entities() ORDER BY Id DESC TAKE 2").unwrap();
    assert_eq!(strings(&table, 0), vec!["50", "40"]);
}

#[test]
fn stats_serialize_to_json() {
    let e = engine();
    let token = CancellationToken::new();
    let result = e
        .execute("SELECT Name FROM #test.pair()", EnvironmentVariables::new(), &token)
        .unwrap();
    let json = serde_json::to_value(result.stats).unwrap();
    assert_eq!(json["rows_read"], 2);
    let cache = serde_json::to_value(e.cache().stats()).unwrap();
    assert_eq!(cache["misses"], 1);
    assert_eq!(cache["entries"], 1);
}

// ── Canonical text ────────────────────────────────────────────────────────

#[test]
fn printed_queries_reparse_to_the_same_text() {
    let queries = [
        "select a.Name, Count(a.Id) as n from #test.entities() a group by a.Name having Count(a.Id) > 1",
        "with c as (select Name from #test.pair()) select Name from c order by Name desc skip 1 take 1",
        "SELECT x.Name FROM #test.pair() x LEFT OUTER JOIN #test.entities() e ON x.Name = e.Name",
        "SELECT Name FROM #test.pair() UNION ALL SELECT Name FROM #test.pair() EXCEPT SELECT Name FROM #test.pair()",
        "SELECT NOT (1 = 2) AND 'a' LIKE 'A%', -(3 + 4) * 2, 5 % 3",
        "SELECT Name FROM #test.entities() WHERE Category IS NOT NULL AND Id NOT IN (1, 2)",
    ];
    for query in queries {
        let printed = parse_query(query).unwrap().to_string();
        let reprinted = parse_query(&printed).unwrap().to_string();
        assert_eq!(printed, reprinted, "{query}");
    }
}

#[test]
fn double_literals_stay_finite() {
    let e = engine();
    let err = e.query("SELECT 1e400f").unwrap_err();
    assert!(err.is_compile_time(), "{err:?}");
    assert!(e.cache().is_empty());

    let printed = parse_query("SELECT 1e300f").unwrap().to_string();
    assert_eq!(parse_query(&printed).unwrap().to_string(), printed);
    let table = e.query(&printed).unwrap();
    assert_eq!(table.rows()[0][0], Value::Double(1e300));
}

#[derive(Debug, Clone)]
enum Arith {
    Lit(i32),
    Add(Box<Arith>, Box<Arith>),
    Sub(Box<Arith>, Box<Arith>),
    Mul(Box<Arith>, Box<Arith>),
}

impl Arith {
    fn text(&self) -> String {
        match self {
            Self::Lit(v) => v.to_string(),
            Self::Add(a, b) => format!("({} + {})", a.text(), b.text()),
            Self::Sub(a, b) => format!("({} - {})", a.text(), b.text()),
            Self::Mul(a, b) => format!("({} * {})", a.text(), b.text()),
        }
    }

    fn value(&self) -> i64 {
        match self {
            Self::Lit(v) => i64::from(*v),
            Self::Add(a, b) => a.value() + b.value(),
            Self::Sub(a, b) => a.value() - b.value(),
            Self::Mul(a, b) => a.value() * b.value(),
        }
    }
}

fn arith() -> impl Strategy<Value = Arith> {
    (0_i32..10).prop_map(Arith::Lit).prop_recursive(3, 16, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(a, b)| Arith::Add(Box::new(a), Box::new(b))),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| Arith::Sub(Box::new(a), Box::new(b))),
            (inner.clone(), inner).prop_map(|(a, b)| Arith::Mul(Box::new(a), Box::new(b))),
        ]
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn printed_arithmetic_reparses_and_evaluates_equal(expr in arith()) {
        let query = format!("SELECT {}", expr.text());
        let printed = parse_query(&query).unwrap().to_string();
        prop_assert_eq!(&parse_query(&printed).unwrap().to_string(), &printed);

        let e = engine();
        let original = e.query(&query).unwrap();
        let reprinted = e.query(&printed).unwrap();
        prop_assert_eq!(original.rows(), reprinted.rows());
        prop_assert_eq!(original.rows()[0][0].as_i64(), Some(expr.value()));
    }
}
