// Code generation integration tests
//
// 종단 간 테스트: LogicalPlan → QueryCompiler → Procedure → exec::execute

use dbx_codegen::codegen::ProductionStyle;
use dbx_codegen::codegen::ir::Intrinsic;
use dbx_codegen::config::{FilterPolicy, LaneWidth, Paradigm};
use dbx_codegen::error::DbxError;
use dbx_codegen::exec::{QueryResult, execute};
use dbx_codegen::plan::{
    AggregateExpr, BinaryOperator, DateField, Expr, JoinType, LogicalPlan, ScalarValue,
};
use dbx_codegen::runtime::{MemoryCatalog, ParquetCatalog, TableSource};
use dbx_codegen::{CodegenConfig, DbxResult, QueryCompiler, QueryOutput};

use arrow::array::{Date32Array, Int32Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use std::fs::File;
use std::sync::Arc;
use tempfile::tempdir;

// ─── Helpers ────────────────────────────────────────────

fn int_schema(names: &[&str], nullable: bool) -> SchemaRef {
    Arc::new(Schema::new(
        names
            .iter()
            .map(|name| Field::new(*name, DataType::Int32, nullable))
            .collect::<Vec<_>>(),
    ))
}

fn int_batch(schema: &SchemaRef, columns: Vec<Vec<Option<i32>>>) -> RecordBatch {
    RecordBatch::try_new(
        schema.clone(),
        columns
            .into_iter()
            .map(|c| Arc::new(Int32Array::from(c)) as _)
            .collect(),
    )
    .unwrap()
}

fn keyed_schema(key: &str, name: &str) -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(key, DataType::Int32, false),
        Field::new(name, DataType::Utf8, false),
    ]))
}

fn keyed_batch(schema: &SchemaRef, keys: &[i32], names: &[&str]) -> RecordBatch {
    RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(Int32Array::from(keys.to_vec())),
            Arc::new(StringArray::from(names.to_vec())),
        ],
    )
    .unwrap()
}

fn gt(column: usize, value: i32) -> Expr {
    Expr::binary(Expr::col(column), BinaryOperator::Gt, Expr::lit(ScalarValue::Int32(value)))
}

fn lt(column: usize, value: i32) -> Expr {
    Expr::binary(Expr::col(column), BinaryOperator::Lt, Expr::lit(ScalarValue::Int32(value)))
}

/// Every configuration a query result must not depend on.
fn all_configs(capacity: usize) -> Vec<CodegenConfig> {
    let base = CodegenConfig::default().with_vector_capacity(capacity);
    vec![
        base.clone().with_paradigm(Paradigm::NonVectorised),
        base.clone()
            .with_paradigm(Paradigm::Vectorised)
            .with_filter_policy(FilterPolicy::SelectionVector),
        base.clone()
            .with_paradigm(Paradigm::Vectorised)
            .with_filter_policy(FilterPolicy::ValidityMask),
        base.with_paradigm(Paradigm::Vectorised)
            .with_filter_policy(FilterPolicy::ValidityMask)
            .with_simd(LaneWidth::X4),
    ]
}

fn run(
    config: CodegenConfig,
    plan: &LogicalPlan,
    output: QueryOutput,
    source: &dyn TableSource,
) -> DbxResult<QueryResult> {
    dbx_codegen::logging::init_test();
    let procedure = QueryCompiler::new(config).compile(plan, output)?;
    assert_eq!(
        procedure.acquire_count(),
        procedure.release_count(),
        "unbalanced buffers in\n{procedure}"
    );
    let result = execute(&procedure, source)?;
    assert_eq!(result.pool.outstanding, 0);
    assert_eq!(result.pool.acquired, result.pool.released);
    Ok(result)
}

fn sorted(mut rows: Vec<Vec<ScalarValue>>) -> Vec<Vec<ScalarValue>> {
    rows.sort_by_key(|row| format!("{row:?}"));
    rows
}

// ═══════════════════════════════════════════════════════════
// 스캔 / 카운트
// ═══════════════════════════════════════════════════════════

/// 테스트 1: COUNT(*) over a multi-batch table
#[test]
fn test_count_star_all_paradigms() -> DbxResult<()> {
    let schema = int_schema(&["x"], false);
    let mut catalog = MemoryCatalog::new();
    catalog.register(
        "t",
        schema.clone(),
        vec![
            int_batch(&schema, vec![vec![Some(1), Some(2), Some(3)]]),
            int_batch(&schema, vec![vec![Some(4), Some(5)]]),
        ],
    )?;
    let scan = LogicalPlan::scan("t", schema, vec![0]);
    let counted = scan.clone().aggregate(vec![], vec![AggregateExpr::count_star()]);

    for config in all_configs(2) {
        let result = run(config.clone(), &scan, QueryOutput::Count, &catalog)?;
        assert_eq!(result.count, Some(5));

        let result = run(config, &counted, QueryOutput::Materialize, &catalog)?;
        assert_eq!(result.rows, vec![vec![ScalarValue::Int64(5)]]);
    }
    Ok(())
}

/// 테스트 2: empty tables still produce the plain aggregate row
#[test]
fn test_empty_table() -> DbxResult<()> {
    let schema = int_schema(&["x"], false);
    let mut catalog = MemoryCatalog::new();
    catalog.register("t", schema.clone(), vec![])?;
    let plan = LogicalPlan::scan("t", schema.clone(), vec![0])
        .aggregate(vec![], vec![AggregateExpr::count_star(), AggregateExpr::sum(0)]);
    let grouped = LogicalPlan::scan("t", schema, vec![0])
        .aggregate(vec![0], vec![AggregateExpr::count_star()]);

    for config in all_configs(4) {
        let result = run(config.clone(), &plan, QueryOutput::Materialize, &catalog)?;
        assert_eq!(result.rows, vec![vec![ScalarValue::Int64(0), ScalarValue::Int64(0)]]);

        let result = run(config, &grouped, QueryOutput::Materialize, &catalog)?;
        assert!(result.rows.is_empty());
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════
// 필터 / 집계
// ═══════════════════════════════════════════════════════════

/// 테스트 3: SUM after a filter that drops the NULL row
///
/// NULL reads as 0, so `x > 0` removes it.
#[test]
fn test_sum_after_filter() -> DbxResult<()> {
    let schema = int_schema(&["x"], true);
    let mut catalog = MemoryCatalog::new();
    catalog.register(
        "t",
        schema.clone(),
        vec![int_batch(&schema, vec![vec![Some(1), Some(2), Some(3), None]])],
    )?;
    let plan = LogicalPlan::scan("t", schema, vec![0])
        .filter(gt(0, 0))
        .aggregate(vec![], vec![AggregateExpr::sum(0), AggregateExpr::count_star()]);

    for capacity in [1, 3, 1024] {
        for config in all_configs(capacity) {
            let result = run(config, &plan, QueryOutput::Materialize, &catalog)?;
            assert_eq!(
                result.rows,
                vec![vec![ScalarValue::Int64(6), ScalarValue::Int64(3)]]
            );
        }
    }
    Ok(())
}

/// 테스트 4: GROUP BY k with SUM(v) and COUNT(*) in insertion order
#[test]
fn test_group_by_sum() -> DbxResult<()> {
    let schema = int_schema(&["k", "v"], false);
    let mut catalog = MemoryCatalog::new();
    catalog.register(
        "t",
        schema.clone(),
        vec![int_batch(
            &schema,
            vec![vec![Some(1), Some(2), Some(1)], vec![Some(10), Some(20), Some(5)]],
        )],
    )?;
    let plan = LogicalPlan::scan("t", schema, vec![0, 1])
        .aggregate(vec![0], vec![AggregateExpr::sum(1), AggregateExpr::count_star()]);

    // capacity 1 splits both the input and the group output into single rows
    for capacity in [1, 1024] {
        for config in all_configs(capacity) {
            let result = run(config, &plan, QueryOutput::Materialize, &catalog)?;
            assert_eq!(
                result.rows,
                vec![
                    vec![ScalarValue::Int32(1), ScalarValue::Int64(15), ScalarValue::Int32(2)],
                    vec![ScalarValue::Int32(2), ScalarValue::Int64(20), ScalarValue::Int32(1)],
                ]
            );
        }
    }
    Ok(())
}

/// 테스트 5: stacked filters narrow the same marker kind
#[test]
fn test_filter_composition() -> DbxResult<()> {
    let schema = int_schema(&["x", "y"], false);
    let xs: Vec<Option<i32>> = (1..=10).map(Some).collect();
    let ys: Vec<Option<i32>> = (1..=10).map(|v| Some(v % 3)).collect();
    let mut catalog = MemoryCatalog::new();
    catalog.register("t", schema.clone(), vec![int_batch(&schema, vec![xs, ys])])?;

    // x > 2 AND x < 8, then y <> 0
    let plan = LogicalPlan::scan("t", schema, vec![0, 1])
        .filter(Expr::and(gt(0, 2), lt(0, 8)))
        .filter(Expr::binary(
            Expr::col(1),
            BinaryOperator::NotEq,
            Expr::lit(ScalarValue::Int32(0)),
        ))
        .project(vec![Expr::col(0)]);

    for config in all_configs(4) {
        let result = run(config, &plan, QueryOutput::Materialize, &catalog)?;
        let xs: Vec<_> = result.rows.iter().map(|r| r[0].clone()).collect();
        assert_eq!(
            xs,
            [4, 5, 7].map(ScalarValue::Int32).to_vec(),
        );
    }
    Ok(())
}

/// 테스트 6: SIMD lane groups only appear under the validity policy
#[test]
fn test_simd_lane_filter() -> DbxResult<()> {
    let schema = int_schema(&["x"], false);
    let mut catalog = MemoryCatalog::new();
    catalog.register(
        "t",
        schema.clone(),
        vec![int_batch(&schema, vec![(0..11).map(Some).collect()])],
    )?;
    let plan = LogicalPlan::scan("t", schema, vec![0]).filter(Expr::and(gt(0, 2), lt(0, 9)));

    let simd = CodegenConfig::default()
        .with_paradigm(Paradigm::Vectorised)
        .with_filter_policy(FilterPolicy::ValidityMask)
        .with_simd(LaneWidth::X4);
    let procedure = QueryCompiler::new(simd.clone()).compile(&plan, QueryOutput::Count)?;
    assert_eq!(
        procedure.count_calls(|c| matches!(c, Intrinsic::SimdCompare { .. })),
        2
    );
    assert_eq!(procedure.count_calls(|c| matches!(c, Intrinsic::ValidityInit)), 1);
    assert_eq!(run(simd.clone(), &plan, QueryOutput::Count, &catalog)?.count, Some(6));

    // partial lane groups at the end of every 6-row batch
    let small = simd.with_vector_capacity(6);
    assert_eq!(run(small, &plan, QueryOutput::Count, &catalog)?.count, Some(6));

    let selection = CodegenConfig::default()
        .with_paradigm(Paradigm::Vectorised)
        .with_filter_policy(FilterPolicy::SelectionVector)
        .with_simd(LaneWidth::X4);
    let procedure = QueryCompiler::new(selection).compile(&plan, QueryOutput::Count)?;
    assert_eq!(
        procedure.count_calls(|c| matches!(c, Intrinsic::SimdCompare { .. })),
        0
    );
    Ok(())
}

// ═══════════════════════════════════════════════════════════
// 조인
// ═══════════════════════════════════════════════════════════

fn join_catalog(left: (&[i32], &[&str]), right: (&[i32], &[&str])) -> DbxResult<(MemoryCatalog, LogicalPlan)> {
    let ls = keyed_schema("lk", "lname");
    let rs = keyed_schema("rk", "rname");
    let mut catalog = MemoryCatalog::new();
    catalog.register("l", ls.clone(), vec![keyed_batch(&ls, left.0, left.1)])?;
    catalog.register("r", rs.clone(), vec![keyed_batch(&rs, right.0, right.1)])?;
    let plan = LogicalPlan::scan("l", ls, vec![0, 1]).join(
        LogicalPlan::scan("r", rs, vec![0, 1]),
        JoinType::Inner,
        Expr::eq(Expr::col(0), Expr::col(2)),
    );
    Ok((catalog, plan))
}

fn joined(lk: i32, lname: &str, rk: i32, rname: &str) -> Vec<ScalarValue> {
    vec![
        ScalarValue::Int32(lk),
        ScalarValue::Utf8(lname.to_string()),
        ScalarValue::Int32(rk),
        ScalarValue::Utf8(rname.to_string()),
    ]
}

/// 테스트 7: inner hash join, build side left
#[test]
fn test_inner_join() -> DbxResult<()> {
    let (catalog, plan) = join_catalog(
        (&[1, 2], &["a", "b"]),
        (&[1, 1, 3], &["x", "y", "z"]),
    )?;
    for config in all_configs(1024) {
        let result = run(config, &plan, QueryOutput::Materialize, &catalog)?;
        assert_eq!(result.rows, vec![joined(1, "a", 1, "x"), joined(1, "a", 1, "y")]);
    }
    Ok(())
}

/// 테스트 8: one probe row matching more build rows than a batch holds
#[test]
fn test_join_fan_out_exceeds_capacity() -> DbxResult<()> {
    let (catalog, plan) = join_catalog(
        (&[1, 1, 1, 2], &["a", "b", "c", "d"]),
        (&[1, 2], &["x", "y"]),
    )?;
    let expected = vec![
        joined(1, "a", 1, "x"),
        joined(1, "b", 1, "x"),
        joined(1, "c", 1, "x"),
        joined(2, "d", 2, "y"),
    ];
    for config in all_configs(2) {
        let result = run(config, &plan, QueryOutput::Materialize, &catalog)?;
        assert_eq!(result.rows, expected);
    }
    Ok(())
}

/// 테스트 9: join under a filter on the probe side, then grouped
#[test]
fn test_join_filter_group() -> DbxResult<()> {
    let (catalog, plan) = join_catalog(
        (&[1, 2, 3], &["a", "b", "c"]),
        (&[1, 2, 2, 3, 3, 3], &["u", "v", "w", "x", "y", "z"]),
    )?;
    let LogicalPlan::Join { left, right, join_type, on } = plan else {
        unreachable!()
    };
    let filtered = LogicalPlan::Join {
        left,
        right: Box::new((*right).filter(gt(0, 1))),
        join_type,
        on,
    }
    .aggregate(vec![0], vec![AggregateExpr::count_star()]);

    for config in all_configs(2) {
        let result = run(config, &filtered, QueryOutput::Materialize, &catalog)?;
        assert_eq!(
            sorted(result.rows),
            vec![
                vec![ScalarValue::Int32(2), ScalarValue::Int32(2)],
                vec![ScalarValue::Int32(3), ScalarValue::Int32(3)],
            ]
        );
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════
// 프로젝션 / 출력
// ═══════════════════════════════════════════════════════════

/// 테스트 10: arithmetic and CASE projections agree across paradigms
#[test]
fn test_projection_expressions() -> DbxResult<()> {
    let schema = int_schema(&["a", "b"], false);
    let mut catalog = MemoryCatalog::new();
    catalog.register(
        "t",
        schema.clone(),
        vec![int_batch(
            &schema,
            vec![vec![Some(1), Some(2), Some(3)], vec![Some(10), Some(2), Some(30)]],
        )],
    )?;
    let plan = LogicalPlan::scan("t", schema, vec![0, 1]).project(vec![
        Expr::binary(
            Expr::binary(Expr::col(0), BinaryOperator::Multiply, Expr::col(1)),
            BinaryOperator::Plus,
            Expr::lit(ScalarValue::Int32(1)),
        ),
        Expr::case_eq(
            Expr::col(0),
            Expr::col(1),
            Expr::lit(ScalarValue::Int32(100)),
            Expr::col(1),
        ),
    ]);
    for config in all_configs(2) {
        let result = run(config, &plan, QueryOutput::Materialize, &catalog)?;
        assert_eq!(
            result.rows,
            vec![
                vec![ScalarValue::Int32(11), ScalarValue::Int32(10)],
                vec![ScalarValue::Int32(5), ScalarValue::Int32(100)],
                vec![ScalarValue::Int32(91), ScalarValue::Int32(30)],
            ]
        );
    }
    Ok(())
}

/// 테스트 11: EXTRACT over a date column
#[test]
fn test_extract_date_fields() -> DbxResult<()> {
    let schema = Arc::new(Schema::new(vec![Field::new("d", DataType::Date32, false)]));
    // 2024-02-29, 1970-01-01
    let batch = RecordBatch::try_new(schema.clone(), vec![Arc::new(Date32Array::from(vec![19782, 0]))])?;
    let mut catalog = MemoryCatalog::new();
    catalog.register("t", schema.clone(), vec![batch])?;
    let plan = LogicalPlan::scan("t", schema, vec![0]).project(vec![
        Expr::extract(DateField::Year, Expr::col(0)),
        Expr::extract(DateField::Month, Expr::col(0)),
        Expr::extract(DateField::Day, Expr::col(0)),
    ]);
    for config in all_configs(1024) {
        let result = run(config, &plan, QueryOutput::Materialize, &catalog)?;
        assert_eq!(
            result.rows,
            vec![
                [2024, 2, 29].map(ScalarValue::Int32).to_vec(),
                [1970, 1, 1].map(ScalarValue::Int32).to_vec(),
            ]
        );
    }
    Ok(())
}

/// 테스트 12: Print sink formats one line per row
#[test]
fn test_print_sink() -> DbxResult<()> {
    let schema = keyed_schema("id", "name");
    let mut catalog = MemoryCatalog::new();
    catalog.register("t", schema.clone(), vec![keyed_batch(&schema, &[1, 2], &["a", "b"])])?;
    let plan = LogicalPlan::scan("t", schema, vec![0, 1]);
    for config in all_configs(1024) {
        let result = run(config, &plan, QueryOutput::Print, &catalog)?;
        assert_eq!(result.printed, vec!["1 | 'a'".to_string(), "2 | 'b'".to_string()]);
        assert!(result.rows.is_empty());
    }
    Ok(())
}

/// 테스트 13: literal-only projection falls back to row-at-a-time
#[test]
fn test_literal_projection_paradigm() -> DbxResult<()> {
    let schema = int_schema(&["x"], false);
    let mut catalog = MemoryCatalog::new();
    catalog.register("t", schema.clone(), vec![int_batch(&schema, vec![vec![Some(1), Some(2)]])])?;
    let plan = LogicalPlan::scan("t", schema, vec![0]).project(vec![Expr::lit(ScalarValue::Int64(7))]);

    let procedure = QueryCompiler::default().compile(&plan, QueryOutput::Materialize)?;
    assert_eq!(procedure.style, ProductionStyle::NonVectorised);
    let result = execute(&procedure, &catalog)?;
    assert_eq!(result.rows, vec![vec![ScalarValue::Int64(7)]; 2]);

    let forced = QueryCompiler::new(CodegenConfig::default().with_paradigm(Paradigm::Vectorised))
        .compile(&plan, QueryOutput::Materialize);
    assert!(matches!(forced, Err(DbxError::UnsupportedProduction { .. })));
    Ok(())
}

/// 테스트 17: integer division yields a fractional Double in every paradigm
#[test]
fn test_integer_division_promotes_to_double() -> DbxResult<()> {
    let schema = int_schema(&["a", "b"], false);
    let mut catalog = MemoryCatalog::new();
    catalog.register(
        "t",
        schema.clone(),
        vec![int_batch(
            &schema,
            vec![vec![Some(7), Some(1), Some(6)], vec![Some(2), Some(0), Some(4)]],
        )],
    )?;
    let plan = LogicalPlan::scan("t", schema, vec![0, 1])
        .filter(Expr::binary(
            Expr::col(1),
            BinaryOperator::NotEq,
            Expr::lit(ScalarValue::Int32(0)),
        ))
        .project(vec![
            Expr::binary(Expr::col(0), BinaryOperator::Divide, Expr::col(1)),
            Expr::binary(Expr::col(0), BinaryOperator::Divide, Expr::lit(ScalarValue::Int32(2))),
        ]);
    for config in all_configs(2) {
        let result = run(config, &plan, QueryOutput::Materialize, &catalog)?;
        assert_eq!(
            result.rows,
            vec![
                vec![ScalarValue::Float64(3.5), ScalarValue::Float64(3.5)],
                vec![ScalarValue::Float64(1.5), ScalarValue::Float64(3.0)],
            ]
        );
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════
// 리더 / 오류
// ═══════════════════════════════════════════════════════════

/// 테스트 14: Parquet-backed table with a reordered projection
#[test]
fn test_parquet_scan() -> DbxResult<()> {
    let dir = tempdir()?;
    let path = dir.path().join("t.parquet");
    let schema = int_schema(&["k", "v", "w"], false);
    let batch = int_batch(
        &schema,
        vec![
            vec![Some(1), Some(2), Some(1), Some(2)],
            vec![Some(5), Some(6), Some(7), Some(8)],
            vec![Some(0), Some(0), Some(0), Some(0)],
        ],
    );
    let mut writer = ArrowWriter::try_new(File::create(&path)?, schema.clone(), None)?;
    writer.write(&batch)?;
    writer.close()?;

    let mut catalog = ParquetCatalog::new();
    catalog.register("t", &path);
    let schema = catalog.schema("t")?;
    // columns (v, k): group by k, sum v
    let plan = LogicalPlan::scan("t", schema, vec![1, 0])
        .aggregate(vec![1], vec![AggregateExpr::sum(0)]);

    for config in all_configs(3) {
        let result = run(config, &plan, QueryOutput::Materialize, &catalog)?;
        assert_eq!(
            result.rows,
            vec![
                vec![ScalarValue::Int32(1), ScalarValue::Int64(12)],
                vec![ScalarValue::Int32(2), ScalarValue::Int64(14)],
            ]
        );
    }
    Ok(())
}

/// 테스트 15: unknown tables fail at execution, buffers still released
#[test]
fn test_missing_table() -> DbxResult<()> {
    let schema = int_schema(&["x"], false);
    let plan = LogicalPlan::scan("missing", schema, vec![0]).filter(gt(0, 1));
    let procedure = QueryCompiler::default().compile(&plan, QueryOutput::Count)?;
    let err = execute(&procedure, &MemoryCatalog::new()).unwrap_err();
    assert!(matches!(err, DbxError::TableNotFound(name) if name == "missing"));
    Ok(())
}

/// 테스트 16: unsupported plan shapes are rejected at compile time
#[test]
fn test_unsupported_plans() {
    let schema = int_schema(&["a", "b"], false);
    let scan = LogicalPlan::scan("t", schema, vec![0, 1]);
    let compiler = QueryCompiler::default();

    let left = scan.clone().join(scan.clone(), JoinType::Left, Expr::eq(Expr::col(0), Expr::col(2)));
    assert!(matches!(
        compiler.compile(&left, QueryOutput::Materialize),
        Err(DbxError::UnsupportedPlanShape { .. })
    ));

    let or = scan.filter(Expr::binary(gt(0, 1), BinaryOperator::Or, gt(1, 1)));
    assert!(matches!(
        compiler.compile(&or, QueryOutput::Materialize),
        Err(DbxError::UnsupportedPlanShape { .. })
    ));
}
