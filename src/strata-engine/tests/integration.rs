//! End-to-end tests for the clause pipeline:
//! storage setup, plan construction, execution, result verification.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use arrow::array::{
    Array, Float64Array, Int64Array, StringArray, TimestampNanosecondArray, UInt64Array,
};
use arrow::datatypes::{DataType as ArrowDataType, Field, Schema as ArrowSchema, TimeUnit};
use arrow::record_batch::RecordBatch;

use async_trait::async_trait;
use common_error::{StrataError, StrataResult};
use strata_core::{ColRange, OutputSchema, RangesAndKey, RowRange, Segment};
use strata_engine::expr::builder::{col, lit};
use strata_engine::{
    AggregationClause, AggregationOperator, CancellationHandle, Clause, ConcatClause,
    DateRangeClause, FilterClause, JoinType, MergeClause, NamedAggregator, PartitionClause,
    PassthroughClause, PipelineRunner, ProcessingConfig, ProjectClause, QueryResult,
    ResampleBoundary, ResampleClause, ResampleOrigin, RowRangeClause, RuntimeConfig, SortClause,
    SplitClause,
};
use strata_storage::{MemoryStorage, Storage};

const SECOND: i64 = 1_000_000_000;

fn value_segment(values: Vec<i64>) -> Segment {
    let schema = Arc::new(ArrowSchema::new(vec![Field::new(
        "v",
        ArrowDataType::Int64,
        true,
    )]));
    let batch = RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap();
    Segment::new(batch)
}

fn ts_segment(timestamps: Vec<i64>, values: Vec<i64>) -> Segment {
    let schema = Arc::new(ArrowSchema::new(vec![
        Field::new(
            "ts",
            ArrowDataType::Timestamp(TimeUnit::Nanosecond, None),
            false,
        ),
        Field::new("v", ArrowDataType::Int64, true),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(TimestampNanosecondArray::from(timestamps)),
            Arc::new(Int64Array::from(values)),
        ],
    )
    .unwrap();
    Segment::with_index(batch, "ts").unwrap()
}

fn ts_string_segment(timestamps: Vec<i64>, values: Vec<&str>) -> Segment {
    let schema = Arc::new(ArrowSchema::new(vec![
        Field::new(
            "ts",
            ArrowDataType::Timestamp(TimeUnit::Nanosecond, None),
            false,
        ),
        Field::new("c", ArrowDataType::Utf8, true),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(TimestampNanosecondArray::from(timestamps)),
            Arc::new(StringArray::from(values)),
        ],
    )
    .unwrap();
    Segment::with_index(batch, "ts").unwrap()
}

fn entry(key: &str, rows: (u64, u64)) -> RangesAndKey {
    RangesAndKey::new(RowRange::new(rows.0, rows.1), ColRange::new(0, 1), key)
}

async fn run_pipeline(
    storage: Arc<dyn Storage>,
    clauses: Vec<Clause>,
    config: ProcessingConfig,
    plan: Vec<RangesAndKey>,
) -> StrataResult<QueryResult> {
    PipelineRunner::new(clauses, storage, config)?.run(plan).await
}

fn int_column(batch: &RecordBatch, name: &str) -> Vec<i64> {
    batch
        .column_by_name(name)
        .unwrap()
        .as_any()
        .downcast_ref::<Int64Array>()
        .unwrap()
        .iter()
        .map(|v| v.unwrap())
        .collect()
}

// =============================================================================
// Filter
// =============================================================================

#[tokio::test]
async fn test_filter_across_two_segments() {
    // v = row_index * 2 over rows [0, 200); keep 50 <= v < 150.
    let storage = Arc::new(MemoryStorage::new());
    storage
        .write("s/0", value_segment((0..100).map(|i| i * 2).collect()))
        .await
        .unwrap();
    storage
        .write("s/1", value_segment((100..200).map(|i| i * 2).collect()))
        .await
        .unwrap();

    let predicate = col("v")
        .gt_eq(lit(50i64))
        .and(col("v").lt(lit(150i64)))
        .build();
    let clauses = vec![Clause::from(FilterClause::new(predicate, None).unwrap())];
    let plan = vec![entry("s/0", (0, 100)), entry("s/1", (100, 200))];

    let result = run_pipeline(storage, clauses, ProcessingConfig::default(), plan)
        .await
        .unwrap();
    let batch = result.concat().unwrap().unwrap();

    let values = int_column(&batch, "v");
    let expected: Vec<i64> = (50..150).step_by(2).map(|v| v as i64).collect();
    assert_eq!(values, expected);
    assert_eq!(values.len(), 50);
}

#[tokio::test]
async fn test_filter_is_idempotent() {
    let storage = Arc::new(MemoryStorage::new());
    storage
        .write("s/0", value_segment(vec![5, -3, 8, 0, -1, 12]))
        .await
        .unwrap();

    let build = || {
        Clause::from(FilterClause::new(col("v").gt(lit(0i64)).build(), None).unwrap())
    };
    let once = run_pipeline(
        Arc::clone(&storage) as Arc<dyn Storage>,
        vec![build()],
        ProcessingConfig::default(),
        vec![entry("s/0", (0, 6))],
    )
    .await
    .unwrap();
    let twice = run_pipeline(
        storage,
        vec![build(), build()],
        ProcessingConfig::default(),
        vec![entry("s/0", (0, 6))],
    )
    .await
    .unwrap();

    let once = once.concat().unwrap().unwrap();
    let twice = twice.concat().unwrap().unwrap();
    assert_eq!(int_column(&once, "v"), vec![5, 8, 12]);
    assert_eq!(int_column(&once, "v"), int_column(&twice, "v"));
}

#[tokio::test]
async fn test_filter_tautology_and_contradiction() {
    let storage = Arc::new(MemoryStorage::new());
    storage
        .write("s/0", value_segment(vec![1, 2, 3]))
        .await
        .unwrap();

    // A predicate no null-free row fails is the identity.
    let identity = Clause::from(
        FilterClause::new(col("v").is_not_null().build(), None).unwrap(),
    );
    let result = run_pipeline(
        Arc::clone(&storage) as Arc<dyn Storage>,
        vec![identity],
        ProcessingConfig::default(),
        vec![entry("s/0", (0, 3))],
    )
    .await
    .unwrap();
    assert_eq!(result.num_rows(), 3);

    let empty = Clause::from(FilterClause::new(col("v").is_null().build(), None).unwrap());
    let result = run_pipeline(
        storage,
        vec![empty],
        ProcessingConfig::default(),
        vec![entry("s/0", (0, 3))],
    )
    .await
    .unwrap();
    assert!(result.is_empty());
}

#[tokio::test]
async fn test_filter_rejects_column_rooted_ast() {
    let err = FilterClause::new(col("v").add(lit(1i64)).build(), None).unwrap_err();
    assert!(matches!(err, StrataError::InvalidUserArgument(_)));
}

// =============================================================================
// Project
// =============================================================================

#[tokio::test]
async fn test_project_preserves_rows_and_appends_column() {
    let storage = Arc::new(MemoryStorage::new());
    storage
        .write("s/0", value_segment(vec![1, 2, 3, 4]))
        .await
        .unwrap();

    let clauses = vec![Clause::from(
        ProjectClause::new(col("v").mul(col("v")).build(), "v_squared").unwrap(),
    )];
    let result = run_pipeline(
        storage,
        clauses,
        ProcessingConfig::default(),
        vec![entry("s/0", (0, 4))],
    )
    .await
    .unwrap();
    let batch = result.concat().unwrap().unwrap();

    assert_eq!(batch.num_rows(), 4);
    assert_eq!(int_column(&batch, "v"), vec![1, 2, 3, 4]);
    assert_eq!(int_column(&batch, "v_squared"), vec![1, 4, 9, 16]);
}

#[tokio::test]
async fn test_project_add_zero_is_identity() {
    let storage = Arc::new(MemoryStorage::new());
    storage
        .write("s/0", value_segment(vec![7, -2, 9]))
        .await
        .unwrap();

    let clauses = vec![Clause::from(
        ProjectClause::new(col("v").add(lit(0i64)).build(), "v").unwrap(),
    )];
    let result = run_pipeline(
        storage,
        clauses,
        ProcessingConfig::default(),
        vec![entry("s/0", (0, 3))],
    )
    .await
    .unwrap();
    let batch = result.concat().unwrap().unwrap();
    assert_eq!(int_column(&batch, "v"), vec![7, -2, 9]);
    assert_eq!(batch.num_columns(), 1);
}

// =============================================================================
// GroupBy + Aggregation
// =============================================================================

fn group_segment() -> Segment {
    let schema = Arc::new(ArrowSchema::new(vec![
        Field::new("a", ArrowDataType::Int64, true),
        Field::new("b", ArrowDataType::Int64, true),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(vec![1, 2, 3, 1, 2, 3, 1, 2, 3, 1])),
            Arc::new(Int64Array::from(vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10])),
        ],
    )
    .unwrap();
    Segment::new(batch)
}

#[tokio::test]
async fn test_group_by_sum_ascending_keys() {
    let storage = Arc::new(MemoryStorage::new());
    storage.write("s/0", group_segment()).await.unwrap();

    let clauses = vec![
        Clause::from(PartitionClause::new("a")),
        Clause::from(
            AggregationClause::new(
                "a",
                vec![NamedAggregator::new(AggregationOperator::Sum, "b", "b_sum")],
            )
            .unwrap(),
        ),
    ];
    let mut plan_entry = entry("s/0", (0, 10));
    plan_entry.col_range = ColRange::new(0, 2);

    let result = run_pipeline(
        storage,
        clauses,
        ProcessingConfig::default(),
        vec![plan_entry],
    )
    .await
    .unwrap();
    let batch = result.concat().unwrap().unwrap();

    assert_eq!(int_column(&batch, "a"), vec![1, 2, 3]);
    assert_eq!(int_column(&batch, "b_sum"), vec![22, 15, 18]);
}

#[tokio::test]
async fn test_group_by_multiple_aggregators() {
    let storage = Arc::new(MemoryStorage::new());
    storage.write("s/0", group_segment()).await.unwrap();

    let clauses = vec![
        Clause::from(PartitionClause::new("a")),
        Clause::from(
            AggregationClause::new(
                "a",
                vec![
                    NamedAggregator::new(AggregationOperator::Mean, "b", "b_mean"),
                    NamedAggregator::new(AggregationOperator::Count, "b", "b_count"),
                    NamedAggregator::new(AggregationOperator::First, "b", "b_first"),
                    NamedAggregator::new(AggregationOperator::Last, "b", "b_last"),
                ],
            )
            .unwrap(),
        ),
    ];
    let result = run_pipeline(
        storage,
        clauses,
        ProcessingConfig::default(),
        vec![entry("s/0", (0, 10))],
    )
    .await
    .unwrap();
    let batch = result.concat().unwrap().unwrap();

    assert_eq!(int_column(&batch, "a"), vec![1, 2, 3]);
    assert_eq!(int_column(&batch, "b_count"), vec![4, 3, 3]);
    // Group 1 holds b = {1, 4, 7, 10} at rows 0, 3, 6, 9.
    assert_eq!(int_column(&batch, "b_first"), vec![1, 2, 3]);
    assert_eq!(int_column(&batch, "b_last"), vec![10, 8, 9]);

    let means: Vec<f64> = batch
        .column_by_name("b_mean")
        .unwrap()
        .as_any()
        .downcast_ref::<Float64Array>()
        .unwrap()
        .iter()
        .map(|v| v.unwrap())
        .collect();
    assert_eq!(means, vec![5.5, 5.0, 6.0]);
}

#[tokio::test]
async fn test_aggregation_with_zero_groups_is_empty_with_schema() {
    let storage = Arc::new(MemoryStorage::new());
    storage.write("s/0", group_segment()).await.unwrap();

    let clauses = vec![
        Clause::from(FilterClause::new(col("b").gt(lit(1000i64)).build(), None).unwrap()),
        Clause::from(PartitionClause::new("a")),
        Clause::from(
            AggregationClause::new(
                "a",
                vec![NamedAggregator::new(AggregationOperator::Sum, "b", "b_sum")],
            )
            .unwrap(),
        ),
    ];
    let runner = PipelineRunner::new(clauses, storage, ProcessingConfig::default()).unwrap();

    let input = OutputSchema::new(vec![
        strata_core::FieldDef::new("a", strata_core::DataType::Int64),
        strata_core::FieldDef::new("b", strata_core::DataType::Int64),
    ]);
    let schema = runner.output_schema(input).unwrap();
    assert_eq!(schema.field_names(), vec!["a", "b_sum"]);

    let result = runner.run(vec![entry("s/0", (0, 10))]).await.unwrap();
    assert!(result.is_empty());
}

#[tokio::test]
async fn test_aggregation_must_not_be_first() {
    let storage = Arc::new(MemoryStorage::new());
    storage.write("s/0", group_segment()).await.unwrap();

    let clauses = vec![Clause::from(
        AggregationClause::new(
            "a",
            vec![NamedAggregator::new(AggregationOperator::Sum, "b", "b_sum")],
        )
        .unwrap(),
    )];
    let err = run_pipeline(
        storage,
        clauses,
        ProcessingConfig::default(),
        vec![entry("s/0", (0, 10))],
    )
    .await
    .unwrap_err();
    assert!(matches!(err, StrataError::AssertionFailure(_)));
}

// =============================================================================
// Resample
// =============================================================================

#[tokio::test]
async fn test_resample_three_second_buckets_left_left() {
    let storage = Arc::new(MemoryStorage::new());
    storage
        .write(
            "s/0",
            ts_segment(
                (0..6).map(|i| i * SECOND).collect(),
                vec![1, 2, 3, 4, 5, 6],
            ),
        )
        .await
        .unwrap();

    let generator: strata_engine::clauses::BucketGenerator =
        Arc::new(|_first, _last, _rule, _closed, _offset, _origin| {
            vec![0, 3 * SECOND, 6 * SECOND]
        });
    let mut resample = ResampleClause::<true>::new(
        "3s",
        ResampleBoundary::Left,
        generator,
        0,
        ResampleOrigin::default(),
    );
    resample.set_aggregations(vec![NamedAggregator::new(
        AggregationOperator::Sum,
        "v",
        "v",
    )]);

    let config = ProcessingConfig::default().with_index_range(0, 5 * SECOND);
    let plan = vec![entry("s/0", (0, 6)).with_time_range(0, 5 * SECOND)];
    let result = run_pipeline(storage, vec![Clause::from(resample)], config, plan)
        .await
        .unwrap();
    let batch = result.concat().unwrap().unwrap();

    let labels: Vec<i64> = batch
        .column_by_name("ts")
        .unwrap()
        .as_any()
        .downcast_ref::<TimestampNanosecondArray>()
        .unwrap()
        .iter()
        .map(|v| v.unwrap())
        .collect();
    assert_eq!(labels, vec![0, 3 * SECOND]);
    assert_eq!(int_column(&batch, "v"), vec![6, 15]);
}

#[tokio::test]
async fn test_resample_right_right_labels() {
    let storage = Arc::new(MemoryStorage::new());
    storage
        .write(
            "s/0",
            ts_segment(
                (1..=6).map(|i| i * SECOND).collect(),
                vec![1, 2, 3, 4, 5, 6],
            ),
        )
        .await
        .unwrap();

    let generator: strata_engine::clauses::BucketGenerator =
        Arc::new(|_first, _last, _rule, _closed, _offset, _origin| {
            vec![0, 3 * SECOND, 6 * SECOND]
        });
    let mut resample = ResampleClause::<false>::new(
        "3s",
        ResampleBoundary::Right,
        generator,
        0,
        ResampleOrigin::default(),
    );
    resample.set_aggregations(vec![NamedAggregator::new(
        AggregationOperator::Sum,
        "v",
        "v",
    )]);

    let config = ProcessingConfig::default().with_index_range(SECOND, 6 * SECOND);
    let plan = vec![entry("s/0", (0, 6)).with_time_range(SECOND, 6 * SECOND)];
    let result = run_pipeline(storage, vec![Clause::from(resample)], config, plan)
        .await
        .unwrap();
    let batch = result.concat().unwrap().unwrap();

    let labels: Vec<i64> = batch
        .column_by_name("ts")
        .unwrap()
        .as_any()
        .downcast_ref::<TimestampNanosecondArray>()
        .unwrap()
        .iter()
        .map(|v| v.unwrap())
        .collect();
    // RIGHT labels are the closing boundaries.
    assert_eq!(labels, vec![3 * SECOND, 6 * SECOND]);
    // (0, 3s] holds 1s..3s, (3s, 6s] holds 4s..6s.
    assert_eq!(int_column(&batch, "v"), vec![6, 15]);
}

#[tokio::test]
async fn test_resample_straddling_bucket_counted_once() {
    // Two row slices; bucket [3s, 6s) straddles both and must be
    // finalised exactly once, by the slice owning the boundary.
    let storage = Arc::new(MemoryStorage::new());
    storage
        .write(
            "s/0",
            ts_segment(vec![0, SECOND, 4 * SECOND], vec![1, 2, 4]),
        )
        .await
        .unwrap();
    storage
        .write(
            "s/1",
            ts_segment(vec![5 * SECOND, 7 * SECOND], vec![8, 16]),
        )
        .await
        .unwrap();

    let generator: strata_engine::clauses::BucketGenerator =
        Arc::new(|_first, _last, _rule, _closed, _offset, _origin| {
            vec![0, 3 * SECOND, 6 * SECOND, 9 * SECOND]
        });
    let mut resample = ResampleClause::<true>::new(
        "3s",
        ResampleBoundary::Left,
        generator,
        0,
        ResampleOrigin::default(),
    );
    resample.set_aggregations(vec![NamedAggregator::new(
        AggregationOperator::Sum,
        "v",
        "v",
    )]);

    let config = ProcessingConfig::default().with_index_range(0, 7 * SECOND);
    let plan = vec![
        entry("s/0", (0, 3)).with_time_range(0, 4 * SECOND),
        entry("s/1", (3, 5)).with_time_range(5 * SECOND, 7 * SECOND),
    ];
    let result = run_pipeline(storage, vec![Clause::from(resample)], config, plan)
        .await
        .unwrap();
    let batch = result.concat().unwrap().unwrap();

    let labels: Vec<i64> = batch
        .column_by_name("ts")
        .unwrap()
        .as_any()
        .downcast_ref::<TimestampNanosecondArray>()
        .unwrap()
        .iter()
        .map(|v| v.unwrap())
        .collect();
    assert_eq!(labels, vec![0, 3 * SECOND, 6 * SECOND]);
    assert_eq!(int_column(&batch, "v"), vec![3, 12, 16]);
}

// =============================================================================
// Merge
// =============================================================================

#[tokio::test]
async fn test_merge_is_stable_across_streams() {
    let storage = Arc::new(MemoryStorage::new());
    storage
        .write("s/0", ts_string_segment(vec![1, 3, 5], vec!["a", "b", "c"]))
        .await
        .unwrap();
    storage
        .write("s/1", ts_string_segment(vec![2, 3, 4], vec!["x", "y", "z"]))
        .await
        .unwrap();

    let clauses = vec![
        Clause::from(PassthroughClause::new()),
        Clause::from(MergeClause::new(true)),
    ];
    let plan = vec![entry("s/0", (0, 3)), entry("s/1", (3, 6))];
    let result = run_pipeline(storage, clauses, ProcessingConfig::default(), plan)
        .await
        .unwrap();
    let batch = result.concat().unwrap().unwrap();

    let values: Vec<String> = batch
        .column_by_name("c")
        .unwrap()
        .as_any()
        .downcast_ref::<StringArray>()
        .unwrap()
        .iter()
        .map(|v| v.unwrap().to_string())
        .collect();
    assert_eq!(values, vec!["a", "x", "b", "y", "z", "c"]);

    let streams: Vec<u64> = batch
        .column_by_name("symbol")
        .unwrap()
        .as_any()
        .downcast_ref::<UInt64Array>()
        .unwrap()
        .iter()
        .map(|v| v.unwrap())
        .collect();
    assert_eq!(streams, vec![0, 1, 0, 1, 1, 0]);
}

// =============================================================================
// Concat
// =============================================================================

fn xy_segment() -> Segment {
    let schema = Arc::new(ArrowSchema::new(vec![
        Field::new("x", ArrowDataType::Int64, true),
        Field::new("y", ArrowDataType::Int64, true),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(vec![1, 2, 3])),
            Arc::new(Int64Array::from(vec![10, 20, 30])),
        ],
    )
    .unwrap();
    Segment::new(batch)
}

fn yz_segment() -> Segment {
    let schema = Arc::new(ArrowSchema::new(vec![
        Field::new("y", ArrowDataType::Int64, true),
        Field::new("z", ArrowDataType::Int64, true),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(vec![40, 50])),
            Arc::new(Int64Array::from(vec![7, 8])),
        ],
    )
    .unwrap();
    Segment::new(batch)
}

#[tokio::test]
async fn test_concat_outer_unions_columns() {
    let storage = Arc::new(MemoryStorage::new());
    storage.write("a", xy_segment()).await.unwrap();
    storage.write("b", yz_segment()).await.unwrap();

    let clauses = vec![
        Clause::from(PassthroughClause::new()),
        Clause::from(ConcatClause::new(JoinType::Outer)),
    ];
    let plan = vec![entry("a", (0, 3)), entry("b", (3, 5))];
    let result = run_pipeline(storage, clauses, ProcessingConfig::default(), plan)
        .await
        .unwrap();
    let batch = result.concat().unwrap().unwrap();

    assert_eq!(
        batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect::<Vec<_>>(),
        vec!["x", "y", "z"]
    );
    assert_eq!(batch.num_rows(), 5);

    let x = batch
        .column_by_name("x")
        .unwrap()
        .as_any()
        .downcast_ref::<Int64Array>()
        .unwrap();
    assert_eq!(x.null_count(), 2);
    assert_eq!(x.value(0), 1);
    assert!(x.is_null(3));

    let z = batch
        .column_by_name("z")
        .unwrap()
        .as_any()
        .downcast_ref::<Int64Array>()
        .unwrap();
    assert_eq!(z.null_count(), 3);
    assert!(z.is_null(0));
    assert_eq!(z.value(3), 7);

    assert_eq!(int_column(&batch, "y"), vec![10, 20, 30, 40, 50]);
}

#[tokio::test]
async fn test_concat_inner_intersects_columns() {
    let storage = Arc::new(MemoryStorage::new());
    storage.write("a", xy_segment()).await.unwrap();
    storage.write("b", yz_segment()).await.unwrap();

    let clauses = vec![
        Clause::from(PassthroughClause::new()),
        Clause::from(ConcatClause::new(JoinType::Inner)),
    ];
    let plan = vec![entry("a", (0, 3)), entry("b", (3, 5))];
    let result = run_pipeline(storage, clauses, ProcessingConfig::default(), plan)
        .await
        .unwrap();
    let batch = result.concat().unwrap().unwrap();

    assert_eq!(batch.num_columns(), 1);
    assert_eq!(int_column(&batch, "y"), vec![10, 20, 30, 40, 50]);
}

#[tokio::test]
async fn test_split_then_concat_inner_round_trips() {
    let storage = Arc::new(MemoryStorage::new());
    storage
        .write("s/0", value_segment((0..10).collect()))
        .await
        .unwrap();

    let clauses = vec![
        Clause::from(SplitClause::new(3).unwrap()),
        Clause::from(ConcatClause::new(JoinType::Inner)),
    ];
    let result = run_pipeline(
        storage,
        clauses,
        ProcessingConfig::default(),
        vec![entry("s/0", (0, 10))],
    )
    .await
    .unwrap();
    let batch = result.concat().unwrap().unwrap();
    assert_eq!(int_column(&batch, "v"), (0..10).collect::<Vec<i64>>());
}

// =============================================================================
// Row range and date range
// =============================================================================

#[tokio::test]
async fn test_row_range_boundaries() {
    let storage = Arc::new(MemoryStorage::new());
    storage
        .write("s/0", value_segment((0..10).collect()))
        .await
        .unwrap();
    let total = ProcessingConfig::default().with_total_rows(10);

    for (clause, expected) in [
        (RowRangeClause::head(0), Vec::<i64>::new()),
        (RowRangeClause::tail(0), vec![]),
        (RowRangeClause::range(5, 5), vec![]),
        (RowRangeClause::range(-3, -1), vec![7, 8]),
        (RowRangeClause::head(3), vec![0, 1, 2]),
        (RowRangeClause::tail(2), vec![8, 9]),
    ] {
        let result = run_pipeline(
            Arc::clone(&storage) as Arc<dyn Storage>,
            vec![Clause::from(clause)],
            total.clone(),
            vec![entry("s/0", (0, 10))],
        )
        .await
        .unwrap();
        let values = match result.concat().unwrap() {
            Some(batch) => int_column(&batch, "v"),
            None => vec![],
        };
        assert_eq!(values, expected);
    }
}

#[tokio::test]
async fn test_date_range_pruning_and_trimming() {
    let storage = Arc::new(MemoryStorage::new());
    storage
        .write(
            "s/0",
            ts_segment((0..5).map(|i| i * SECOND).collect(), vec![0, 1, 2, 3, 4]),
        )
        .await
        .unwrap();
    storage
        .write(
            "s/1",
            ts_segment((5..10).map(|i| i * SECOND).collect(), vec![5, 6, 7, 8, 9]),
        )
        .await
        .unwrap();
    let plan = || {
        vec![
            entry("s/0", (0, 5)).with_time_range(0, 4 * SECOND),
            entry("s/1", (5, 10)).with_time_range(5 * SECOND, 9 * SECOND),
        ]
    };

    // Entirely outside the symbol span: empty, nothing fetched.
    let outside = DateRangeClause::new(100 * SECOND, 200 * SECOND);
    let result = run_pipeline(
        Arc::clone(&storage) as Arc<dyn Storage>,
        vec![Clause::from(outside)],
        ProcessingConfig::default(),
        plan(),
    )
    .await
    .unwrap();
    assert!(result.is_empty());

    // Entirely covering: unchanged.
    let covering = DateRangeClause::new(0, 9 * SECOND);
    let result = run_pipeline(
        Arc::clone(&storage) as Arc<dyn Storage>,
        vec![Clause::from(covering)],
        ProcessingConfig::default(),
        plan(),
    )
    .await
    .unwrap();
    assert_eq!(result.num_rows(), 10);

    // Inclusive of both endpoints.
    let window = DateRangeClause::new(3 * SECOND, 6 * SECOND);
    let result = run_pipeline(
        storage,
        vec![Clause::from(window)],
        ProcessingConfig::default(),
        plan(),
    )
    .await
    .unwrap();
    let batch = result.concat().unwrap().unwrap();
    assert_eq!(int_column(&batch, "v"), vec![3, 4, 5, 6]);
}

// =============================================================================
// Sort
// =============================================================================

#[tokio::test]
async fn test_sort_is_stable_per_row_slice() {
    let schema = Arc::new(ArrowSchema::new(vec![
        Field::new("k", ArrowDataType::Int64, true),
        Field::new("pos", ArrowDataType::Int64, true),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(vec![2, 1, 2, 1, 3])),
            Arc::new(Int64Array::from(vec![0, 1, 2, 3, 4])),
        ],
    )
    .unwrap();
    let storage = Arc::new(MemoryStorage::new());
    storage.write("s/0", Segment::new(batch)).await.unwrap();

    let result = run_pipeline(
        storage,
        vec![Clause::from(SortClause::new("k", 0))],
        ProcessingConfig::default(),
        vec![entry("s/0", (0, 5))],
    )
    .await
    .unwrap();
    let batch = result.concat().unwrap().unwrap();

    assert_eq!(int_column(&batch, "k"), vec![1, 1, 2, 2, 3]);
    // Equal keys keep their original order.
    assert_eq!(int_column(&batch, "pos"), vec![1, 3, 0, 2, 4]);
}

// =============================================================================
// Composed pipeline
// =============================================================================

#[tokio::test]
async fn test_date_filter_project_head_pipeline() {
    let storage = Arc::new(MemoryStorage::new());
    storage
        .write(
            "s/0",
            ts_segment(
                (0..10).map(|i| i * SECOND).collect(),
                vec![-1, 2, -3, 4, 5, 6, 7, 8, 9, 10],
            ),
        )
        .await
        .unwrap();

    let clauses = vec![
        Clause::from(DateRangeClause::new(SECOND, 9 * SECOND)),
        Clause::from(FilterClause::new(col("v").gt(lit(0i64)).build(), None).unwrap()),
        Clause::from(ProjectClause::new(col("v").mul(col("v")).build(), "v2").unwrap()),
        Clause::from(RowRangeClause::head(5)),
    ];
    let config = ProcessingConfig::default().with_total_rows(10);
    let plan = vec![entry("s/0", (0, 10)).with_time_range(0, 9 * SECOND)];

    let result = run_pipeline(storage, clauses, config, plan).await.unwrap();
    let batch = result.concat().unwrap().unwrap();

    assert!(batch.num_rows() <= 5);
    assert!(batch.column_by_name("v").is_some());
    assert!(batch.column_by_name("v2").is_some());
    let v = int_column(&batch, "v");
    let v2 = int_column(&batch, "v2");
    assert_eq!(v, vec![2, 4, 5, 6]);
    for (value, squared) in v.iter().zip(&v2) {
        assert_eq!(value * value, *squared);
    }
}

#[tokio::test]
async fn test_schema_propagation_matches_processed_output() {
    let storage = Arc::new(MemoryStorage::new());
    storage
        .write(
            "s/0",
            ts_segment((0..4).map(|i| i * SECOND).collect(), vec![1, 2, 3, 4]),
        )
        .await
        .unwrap();

    let clauses = vec![
        Clause::from(FilterClause::new(col("v").gt(lit(0i64)).build(), None).unwrap()),
        Clause::from(ProjectClause::new(col("v").mul(col("v")).build(), "v2").unwrap()),
    ];
    let runner =
        PipelineRunner::new(clauses, storage, ProcessingConfig::default()).unwrap();

    let input = OutputSchema::new(vec![
        strata_core::FieldDef::new("ts", strata_core::DataType::Timestamp),
        strata_core::FieldDef::new("v", strata_core::DataType::Int64),
    ])
    .with_index("ts");
    let declared = runner.output_schema(input).unwrap();

    let result = runner
        .run(vec![entry("s/0", (0, 4)).with_time_range(0, 3 * SECOND)])
        .await
        .unwrap();
    let descriptor = result.segments()[0].descriptor().unwrap();

    let declared_fields: Vec<(String, strata_core::DataType)> = declared
        .fields()
        .iter()
        .map(|f| (f.name.clone(), f.data_type.clone()))
        .collect();
    assert_eq!(declared_fields, descriptor.fields);
}

// =============================================================================
// Driver behaviour
// =============================================================================

#[tokio::test]
async fn test_empty_plan_runs_no_clause() {
    let storage = Arc::new(MemoryStorage::new());
    let clauses = vec![Clause::from(
        FilterClause::new(col("absent").gt(lit(0i64)).build(), None).unwrap(),
    )];
    let result = run_pipeline(storage, clauses, ProcessingConfig::default(), vec![])
        .await
        .unwrap();
    assert!(result.is_empty());
    assert!(result.segments().is_empty());
}

#[tokio::test]
async fn test_cancellation_surfaces_as_cancelled() {
    let storage = Arc::new(MemoryStorage::new());
    storage
        .write("s/0", value_segment(vec![1, 2, 3]))
        .await
        .unwrap();

    let (handle, rx) = CancellationHandle::new();
    handle.cancel();

    let runner = PipelineRunner::new(
        vec![Clause::from(PassthroughClause::new())],
        storage,
        ProcessingConfig::default(),
    )
    .unwrap()
    .with_cancellation(rx);

    let err = runner.run(vec![entry("s/0", (0, 3))]).await.unwrap_err();
    assert!(err.is_cancellation());
}

/// Storage that fails a configured number of fetches before recovering.
#[derive(Debug)]
struct FlakyStorage {
    inner: MemoryStorage,
    failures_left: AtomicU32,
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn fetch(&self, key: &str) -> StrataResult<Segment> {
        if self
            .failures_left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StrataError::storage("transient backend failure"));
        }
        self.inner.fetch(key).await
    }

    async fn write(&self, key: &str, segment: Segment) -> StrataResult<()> {
        self.inner.write(key, segment).await
    }

    async fn list(&self, prefix: &str) -> StrataResult<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn delete(&self, key: &str) -> StrataResult<()> {
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> StrataResult<bool> {
        self.inner.exists(key).await
    }
}

#[tokio::test]
async fn test_storage_retry_with_backoff() {
    let flaky = FlakyStorage {
        inner: MemoryStorage::new(),
        failures_left: AtomicU32::new(2),
    };
    flaky.write("s/0", value_segment(vec![1, 2])).await.unwrap();

    let result = run_pipeline(
        Arc::new(flaky),
        vec![Clause::from(PassthroughClause::new())],
        ProcessingConfig::default(),
        vec![entry("s/0", (0, 2))],
    )
    .await
    .unwrap();
    assert_eq!(result.num_rows(), 2);
}

#[tokio::test]
async fn test_storage_failure_beyond_retry_cap_fails_run() {
    let flaky = FlakyStorage {
        inner: MemoryStorage::new(),
        failures_left: AtomicU32::new(100),
    };
    flaky.write("s/0", value_segment(vec![1, 2])).await.unwrap();

    let runner = PipelineRunner::new(
        vec![Clause::from(PassthroughClause::new())],
        Arc::new(flaky),
        ProcessingConfig::default(),
    )
    .unwrap()
    .with_runtime(RuntimeConfig::default().with_max_fetch_retries(1));

    let err = runner.run(vec![entry("s/0", (0, 2))]).await.unwrap_err();
    assert!(matches!(err, StrataError::StorageError(_)));
}

#[tokio::test]
async fn test_component_manager_is_drained_after_run() {
    let storage = Arc::new(MemoryStorage::new());
    storage
        .write("s/0", value_segment((0..20).collect()))
        .await
        .unwrap();

    let runner = PipelineRunner::new(
        vec![
            Clause::from(SplitClause::new(4).unwrap()),
            Clause::from(FilterClause::new(col("v").gt(lit(5i64)).build(), None).unwrap()),
        ],
        storage,
        ProcessingConfig::default(),
    )
    .unwrap();

    let result = runner.run(vec![entry("s/0", (0, 20))]).await.unwrap();
    assert_eq!(result.num_rows(), 14);
    // Every bundle was released at a hand-off point.
    assert_eq!(runner.component_manager().live_slots(), 0);
}
