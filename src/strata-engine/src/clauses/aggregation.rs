//! Aggregation clause: collapse hash-partitioned entities into one row
//! per group key.

use std::collections::hash_map::Entry;
use std::sync::Arc;

use ahash::AHashMap;
use arrow::array::ArrayRef;
use arrow::datatypes::{Field, Schema as ArrowSchema};
use arrow::record_batch::RecordBatch;

use common_error::{StrataError, StrataResult};
use strata_core::{
    ColRange, DataType, FieldDef, OutputSchema, RangesAndKey, RowRange, Segment,
};

use super::{Clause, ClauseBehaviour, ClauseInfo, OutputOrder, require_manager};
use crate::aggregate::{AggPartial, KeyValue, NamedAggregator, build_column, scalar_at};
use crate::component::{ComponentManager, EntityId};
use crate::component::EntityBundle;
use crate::config::ProcessingConfig;
use crate::unit::ProcessingUnit;

/// Runs after [`super::PartitionClause`]: its structuring gathers every
/// entity sharing a bucket-id into one unit, and `process` folds that
/// bucket's rows into one output row per group-key value, key ascending.
#[derive(Debug)]
pub struct AggregationClause {
    clause_info: ClauseInfo,
    manager: Option<Arc<ComponentManager>>,
    config: ProcessingConfig,
    grouping_column: String,
    aggregators: Vec<NamedAggregator>,
}

impl AggregationClause {
    pub fn new(
        grouping_column: impl Into<String>,
        aggregators: Vec<NamedAggregator>,
    ) -> StrataResult<Self> {
        let grouping_column = grouping_column.into();
        if aggregators.is_empty() {
            return Err(StrataError::invalid_user_argument(
                "AggregationClause needs at least one named aggregator",
            ));
        }
        let mut input_columns: std::collections::HashSet<String> =
            [grouping_column.clone()].into_iter().collect();
        input_columns.extend(aggregators.iter().map(|a| a.input_column.clone()));

        let clause_info = ClauseInfo {
            input_columns: Some(input_columns),
            modifies_row_count: true,
            input_structure: super::ProcessingStructure::All,
            output_order: OutputOrder::SortedBy(grouping_column.clone()),
            ..ClauseInfo::default()
        };
        Ok(Self {
            clause_info,
            manager: None,
            config: ProcessingConfig::default(),
            grouping_column,
            aggregators,
        })
    }

    fn input_type(&self, unit: &ProcessingUnit, column: &str) -> Option<DataType> {
        unit.bundles.iter().find_map(|bundle| {
            bundle
                .segment
                .column_by_name(column)
                .and_then(|arr| DataType::from_arrow(arr.data_type()))
        })
    }

    fn aggregate_unit(&self, unit: &ProcessingUnit) -> StrataResult<Option<Segment>> {
        let Some(key_type) = self.input_type(unit, &self.grouping_column) else {
            if self.config.dynamic_schema {
                return Ok(None);
            }
            return Err(StrataError::missing_column(self.grouping_column.clone()));
        };
        let input_types: Vec<DataType> = self
            .aggregators
            .iter()
            .map(|agg| {
                self.input_type(unit, &agg.input_column)
                    .unwrap_or(DataType::Float64)
            })
            .collect();

        let mut groups: AHashMap<KeyValue, Vec<AggPartial>> = AHashMap::new();
        for bundle in &unit.bundles {
            self.fold_bundle(bundle, &input_types, &mut groups)?;
        }
        if groups.is_empty() {
            return Ok(None);
        }

        // Output rows are ordered by key value, not by hash.
        let mut keys: Vec<KeyValue> = groups.keys().cloned().collect();
        keys.sort_by(|a, b| a.sort_cmp(b));

        let key_cells: Vec<_> = keys.iter().map(KeyValue::to_value).collect();
        let mut fields = vec![Field::new(&self.grouping_column, key_type.to_arrow(), true)];
        let mut columns: Vec<ArrayRef> =
            vec![crate::aggregate::build_scalar_column(&key_type, &key_cells)?];

        for (agg_idx, agg) in self.aggregators.iter().enumerate() {
            let partials: Vec<AggPartial> = keys
                .iter()
                .map(|key| groups[key][agg_idx].clone())
                .collect();
            let column = build_column(agg.operator, &input_types[agg_idx], &partials)?;
            fields.push(Field::new(
                &agg.output_column,
                column.data_type().clone(),
                true,
            ));
            columns.push(column);
        }

        let batch = RecordBatch::try_new(Arc::new(ArrowSchema::new(fields)), columns)?;
        Segment::with_index(batch, self.grouping_column.clone()).map(Some)
    }

    fn fold_bundle(
        &self,
        bundle: &EntityBundle,
        input_types: &[DataType],
        groups: &mut AHashMap<KeyValue, Vec<AggPartial>>,
    ) -> StrataResult<()> {
        let segment = &bundle.segment;
        let Some(key_column) = segment.column_by_name(&self.grouping_column) else {
            return Ok(());
        };
        let value_columns: Vec<_> = self
            .aggregators
            .iter()
            .map(|agg| segment.column_by_name(&agg.input_column))
            .collect();

        for row in 0..segment.num_rows() {
            let Some(key_value) = scalar_at(key_column, row)? else {
                continue;
            };
            let Some(key) = KeyValue::from_value(&key_value) else {
                continue;
            };
            let partials = match groups.entry(key) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let fresh = self
                        .aggregators
                        .iter()
                        .zip(input_types)
                        .map(|(agg, dt)| AggPartial::new(agg.operator, dt))
                        .collect::<StrataResult<Vec<_>>>()?;
                    entry.insert(fresh)
                }
            };

            // The partition reshuffle destroyed row order; the hidden
            // companion column restores it for first/last tie-breaks.
            let row_index = match &bundle.row_indexes {
                Some(indexes) => indexes.value(row),
                None => bundle.row_range.start + row as u64,
            };
            for (agg_idx, column) in value_columns.iter().enumerate() {
                let Some(column) = *column else { continue };
                if let Some(value) = scalar_at(column, row)? {
                    partials[agg_idx].update(&value, row_index)?;
                }
            }
        }
        Ok(())
    }
}

impl From<AggregationClause> for Clause {
    fn from(clause: AggregationClause) -> Self {
        Self::Aggregation(clause)
    }
}

impl ClauseBehaviour for AggregationClause {
    fn name(&self) -> &'static str {
        "Aggregation"
    }

    fn structure_for_plan(&self, _plan: &mut Vec<RangesAndKey>) -> StrataResult<Vec<Vec<usize>>> {
        Err(StrataError::assertion(
            "AggregationClause should never be first in the pipeline",
        ))
    }

    fn structure_for_entities(
        &self,
        entity_ids: Vec<Vec<EntityId>>,
    ) -> StrataResult<Vec<Vec<EntityId>>> {
        let manager = require_manager(&self.manager, self.name())?;
        let flat: Vec<EntityId> = entity_ids.into_iter().flatten().collect();
        let bundles = manager.get_many(&flat)?;

        // One unit per bucket label; unlabelled entities form their own
        // bucket so aggregation still works without a partition stage.
        let mut buckets: Vec<(u64, Vec<EntityId>)> = Vec::new();
        for (&id, bundle) in flat.iter().zip(&bundles) {
            let bucket = bundle.bucket_id.unwrap_or(u64::MAX);
            match buckets.iter_mut().find(|(b, _)| *b == bucket) {
                Some((_, ids)) => ids.push(id),
                None => buckets.push((bucket, vec![id])),
            }
        }
        buckets.sort_by_key(|(bucket, _)| *bucket);
        Ok(buckets.into_iter().map(|(_, ids)| ids).collect())
    }

    fn process(&self, entity_ids: Vec<EntityId>) -> StrataResult<Vec<EntityId>> {
        if entity_ids.is_empty() {
            return Ok(vec![]);
        }
        let manager = require_manager(&self.manager, self.name())?;
        let unit = ProcessingUnit::gather(manager, entity_ids)?;

        let Some(segment) = self.aggregate_unit(&unit)? else {
            return Ok(vec![]);
        };
        let rows = segment.num_rows() as u64;
        let cols = segment.num_columns() as u64;
        let bundle = EntityBundle::new(segment, RowRange::new(0, rows), ColRange::new(0, cols));
        Ok(vec![manager.push(bundle)])
    }

    fn info(&self) -> &ClauseInfo {
        &self.clause_info
    }

    fn set_processing_config(&mut self, config: &ProcessingConfig) -> StrataResult<()> {
        self.config = config.clone();
        Ok(())
    }

    fn set_component_manager(&mut self, manager: Arc<ComponentManager>) {
        self.manager = Some(manager);
    }

    fn modify_schema(&self, schema: OutputSchema) -> StrataResult<OutputSchema> {
        schema.require_columns([self.grouping_column.as_str()], self.name())?;

        let key_type = schema
            .field(&self.grouping_column)
            .map(|f| f.data_type.clone())
            .unwrap_or(DataType::Float64);
        let mut output =
            OutputSchema::new(vec![FieldDef::new(self.grouping_column.clone(), key_type)])
                .with_index(self.grouping_column.clone())
                .with_dynamic(schema.dynamic);

        for agg in &self.aggregators {
            let input_type = match schema.field(&agg.input_column) {
                Some(field) => field.data_type.clone(),
                None if schema.dynamic => DataType::Float64,
                None => {
                    return Err(StrataError::schema_error(format!(
                        "Aggregation requires column '{}' which is not in the schema",
                        agg.input_column
                    )));
                }
            };
            output.add_field(FieldDef::new(
                agg.output_column.clone(),
                agg.operator.output_type(&input_type)?,
            ));
        }
        Ok(output)
    }
}

impl std::fmt::Display for AggregationClause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let aggs: Vec<String> = self
            .aggregators
            .iter()
            .map(|a| format!("{}({}) as {}", a.operator, a.input_column, a.output_column))
            .collect();
        write!(
            f,
            "AGGREGATE {{{}}} BY Column[\"{}\"]",
            aggs.join(", "),
            self.grouping_column
        )
    }
}
