//! The pipeline driver: plans storage fetches, streams entity groups
//! through the clause chain and assembles the final result.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;

use common_error::{StrataError, StrataResult};
use strata_core::{OutputSchema, RangesAndKey, Segment};
use strata_storage::Storage;

use super::context::RuntimeConfig;
use super::result::QueryResult;
use crate::clauses::{Clause, ClauseBehaviour, OutputOrder, stable_sort_by_column};
use crate::component::{ComponentManager, EntityBundle, EntityId};
use crate::config::ProcessingConfig;
use crate::structuring::structure_by_row_slice_plan;
use crate::unit::ProcessingUnit;

/// Per-run cancellation state: the user's token plus an internal abort
/// flag tripped by the first failing task.
#[derive(Clone)]
struct RunToken {
    user: watch::Receiver<bool>,
    aborted: Arc<AtomicBool>,
}

impl RunToken {
    fn check(&self) -> StrataResult<()> {
        if *self.user.borrow() {
            return Err(StrataError::cancelled("pipeline run was cancelled"));
        }
        if self.aborted.load(Ordering::Acquire) {
            return Err(StrataError::cancelled("run aborted after earlier failure"));
        }
        Ok(())
    }
}

/// Drives one pipeline run: a clause list over a storage plan.
///
/// Construction wires the processing config and the shared component
/// manager into every clause; `run` consumes a plan and yields the
/// assembled result. Build a fresh runner per read.
pub struct PipelineRunner {
    clauses: Vec<Arc<Clause>>,
    manager: Arc<ComponentManager>,
    storage: Arc<dyn Storage>,
    runtime: RuntimeConfig,
    cancel_rx: watch::Receiver<bool>,
}

impl PipelineRunner {
    pub fn new(
        clauses: Vec<Clause>,
        storage: Arc<dyn Storage>,
        config: ProcessingConfig,
    ) -> StrataResult<Self> {
        let manager = Arc::new(ComponentManager::new());
        let mut wired = Vec::with_capacity(clauses.len());
        for mut clause in clauses {
            clause.set_processing_config(&config)?;
            clause.set_component_manager(Arc::clone(&manager));
            if matches!(clause, Clause::RemoveColumnPartitioning(_)) {
                // Once per run, not per clause instance.
                tracing::warn!(
                    "read involves repartitioning column-sliced data; this can be slow"
                );
            }
            wired.push(Arc::new(clause));
        }
        let (_, cancel_rx) = watch::channel(false);
        Ok(Self {
            clauses: wired,
            manager,
            storage,
            runtime: RuntimeConfig::default(),
            cancel_rx,
        })
    }

    pub fn with_runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_cancellation(mut self, cancel_rx: watch::Receiver<bool>) -> Self {
        self.cancel_rx = cancel_rx;
        self
    }

    pub fn component_manager(&self) -> &ComponentManager {
        &self.manager
    }

    /// Describe the result schema up front by folding every clause's
    /// schema inference over the input schema. Pure; touches no data.
    pub fn output_schema(&self, input: OutputSchema) -> StrataResult<OutputSchema> {
        let mut schema = input;
        for clause in &self.clauses {
            schema = clause.modify_schema(schema)?;
        }
        Ok(schema)
    }

    /// Execute the pipeline over `plan`.
    pub async fn run(&self, mut plan: Vec<RangesAndKey>) -> StrataResult<QueryResult> {
        if plan.is_empty() {
            return Ok(QueryResult::default());
        }
        let token = RunToken {
            user: self.cancel_rx.clone(),
            aborted: Arc::new(AtomicBool::new(false)),
        };
        let semaphore = Arc::new(Semaphore::new(self.runtime.max_concurrent_tasks));

        let plan_groups = match self.clauses.first() {
            Some(clause) => clause.structure_for_plan(&mut plan)?,
            None => structure_by_row_slice_plan(&mut plan),
        };

        let mut groups = self
            .run_initial_stage(&plan, plan_groups, &token, &semaphore)
            .await?;
        for clause in self.clauses.iter().skip(1) {
            token.check()?;
            let structured = clause.structure_for_entities(groups)?;
            self.bump_shared_inputs(&structured)?;
            groups = self.run_stage(clause, structured, &token, &semaphore).await?;
        }
        self.assemble(groups)
    }

    /// Materialise each plan group and run it through the first clause.
    async fn run_initial_stage(
        &self,
        plan: &[RangesAndKey],
        plan_groups: Vec<Vec<usize>>,
        token: &RunToken,
        semaphore: &Arc<Semaphore>,
    ) -> StrataResult<Vec<Vec<EntityId>>> {
        let mut tasks: JoinSet<(usize, StrataResult<Vec<EntityId>>)> = JoinSet::new();
        for (group_idx, group) in plan_groups.into_iter().enumerate() {
            let entries: Vec<RangesAndKey> = group.iter().map(|&i| plan[i].clone()).collect();
            let storage = Arc::clone(&self.storage);
            let manager = Arc::clone(&self.manager);
            let clause = self.clauses.first().map(Arc::clone);
            let token = token.clone();
            let semaphore = Arc::clone(semaphore);
            let runtime = self.runtime.clone();

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (group_idx, Err(StrataError::cancelled("worker pool closed")));
                };
                let result = materialise_and_process(
                    &entries, storage, manager, clause, &token, &runtime,
                )
                .await;
                if result.is_err() {
                    token.aborted.store(true, Ordering::Release);
                }
                (group_idx, result)
            });
        }
        collect_stage(tasks, token).await
    }

    /// Run one clause's `process` over every group in parallel.
    async fn run_stage(
        &self,
        clause: &Arc<Clause>,
        groups: Vec<Vec<EntityId>>,
        token: &RunToken,
        semaphore: &Arc<Semaphore>,
    ) -> StrataResult<Vec<Vec<EntityId>>> {
        let mut tasks: JoinSet<(usize, StrataResult<Vec<EntityId>>)> = JoinSet::new();
        for (group_idx, ids) in groups.into_iter().enumerate() {
            let clause = Arc::clone(clause);
            let manager = Arc::clone(&self.manager);
            let token = token.clone();
            let semaphore = Arc::clone(semaphore);

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (group_idx, Err(StrataError::cancelled("worker pool closed")));
                };
                let result = (|| -> StrataResult<Vec<EntityId>> {
                    let output = match token.check() {
                        Ok(()) => clause.process(ids.clone()),
                        Err(cancelled) => Err(cancelled),
                    };
                    // Inputs are consumed at the hand-off point whether
                    // the task succeeded or not.
                    manager.release(&ids)?;
                    output
                })();
                if result.is_err() {
                    token.aborted.store(true, Ordering::Release);
                }
                (group_idx, result)
            });
        }
        collect_stage(tasks, token).await
    }

    /// An id appearing in several groups is consumed once per group;
    /// pre-bump so each release finds a live reference.
    fn bump_shared_inputs(&self, groups: &[Vec<EntityId>]) -> StrataResult<()> {
        let mut seen: HashMap<EntityId, usize> = HashMap::new();
        for id in groups.iter().flatten() {
            *seen.entry(*id).or_insert(0) += 1;
        }
        for (id, count) in seen {
            for _ in 1..count {
                self.manager.bump(&[id])?;
            }
        }
        Ok(())
    }

    /// Reassemble the terminal entity groups into the user result.
    fn assemble(&self, groups: Vec<Vec<EntityId>>) -> StrataResult<QueryResult> {
        let ids: Vec<EntityId> = groups.into_iter().flatten().collect();
        if ids.is_empty() {
            return Ok(QueryResult::default());
        }
        let bundles = self.manager.get_many(&ids)?;
        self.manager.release(&ids)?;

        // Column shards of one row slice are stitched back together;
        // runs arrive in first-clause group order.
        let mut segments: Vec<Segment> = Vec::new();
        let mut run: Vec<Arc<EntityBundle>> = Vec::new();
        for bundle in bundles {
            match run.last() {
                Some(last) if last.row_range == bundle.row_range => {
                    run.push(bundle);
                }
                _ => {
                    if !run.is_empty() {
                        segments.push(combine_run(&run)?);
                    }
                    run = vec![bundle];
                }
            }
        }
        if !run.is_empty() {
            segments.push(combine_run(&run)?);
        }

        let output_order = self
            .clauses
            .last()
            .map(|c| c.info().output_order.clone())
            .unwrap_or_default();
        match output_order {
            OutputOrder::PlanOrder => Ok(QueryResult::new(segments)),
            OutputOrder::SortedBy(key) => {
                // Each unit is key-sorted; a final stable sort of the
                // concatenation is the k-way merge.
                let result = QueryResult::new(segments);
                let Some(merged) = result.concat()? else {
                    return Ok(result);
                };
                let merged = match result.segments()[0].index_column() {
                    Some(index) => Segment::with_index(merged, index)?,
                    None => Segment::new(merged),
                };
                Ok(QueryResult::new(vec![stable_sort_by_column(&merged, &key)?]))
            }
        }
    }
}

/// Fetch one group's segments (with retry), publish them and run the
/// first clause's `process` over the group.
async fn materialise_and_process(
    entries: &[RangesAndKey],
    storage: Arc<dyn Storage>,
    manager: Arc<ComponentManager>,
    clause: Option<Arc<Clause>>,
    token: &RunToken,
    runtime: &RuntimeConfig,
) -> StrataResult<Vec<EntityId>> {
    // Backpressure: hold off while too many bundles are live.
    manager.wait_below(runtime.live_entity_high_water).await;

    let mut ids = Vec::with_capacity(entries.len());
    for entry in entries {
        let fetched = async {
            token.check()?;
            let segment = fetch_with_retry(&*storage, &entry.key, token, runtime).await?;
            if segment.num_rows() as u64 != entry.row_range.len() {
                return Err(StrataError::assertion(format!(
                    "segment under '{}' has {} rows but its range {:?} implies {}",
                    entry.key,
                    segment.num_rows(),
                    entry.row_range,
                    entry.row_range.len()
                )));
            }
            Ok(segment)
        }
        .await;
        match fetched {
            Ok(segment) => ids.push(manager.push(EntityBundle::new(
                segment,
                entry.row_range,
                entry.col_range,
            ))),
            Err(err) => {
                // Nothing is published from a failed group.
                manager.release(&ids)?;
                return Err(err);
            }
        }
    }

    match clause {
        Some(clause) => {
            let output = match token.check() {
                Ok(()) => clause.process(ids.clone()),
                Err(cancelled) => Err(cancelled),
            };
            manager.release(&ids)?;
            output
        }
        None => Ok(ids),
    }
}

async fn fetch_with_retry(
    storage: &dyn Storage,
    key: &str,
    token: &RunToken,
    runtime: &RuntimeConfig,
) -> StrataResult<Segment> {
    let mut backoff = Duration::from_millis(runtime.retry_backoff_ms);
    let mut attempt = 0u32;
    loop {
        token.check()?;
        match storage.fetch(key).await {
            Ok(segment) => return Ok(segment),
            Err(err @ StrataError::StorageError(_)) => {
                if attempt >= runtime.max_fetch_retries {
                    return Err(err);
                }
                attempt += 1;
                tracing::debug!(key, attempt, "storage fetch failed, backing off");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Join a stage's tasks, surfacing the first real error by group index;
/// cancellations only surface when nothing worse happened.
async fn collect_stage(
    mut tasks: JoinSet<(usize, StrataResult<Vec<EntityId>>)>,
    token: &RunToken,
) -> StrataResult<Vec<Vec<EntityId>>> {
    let mut results: Vec<(usize, StrataResult<Vec<EntityId>>)> = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let (group_idx, result) = joined
            .map_err(|e| StrataError::assertion(format!("worker task panicked: {e}")))?;
        results.push((group_idx, result));
    }
    results.sort_by_key(|(idx, _)| *idx);

    let mut cancelled = None;
    let mut outputs = Vec::with_capacity(results.len());
    for (_, result) in results {
        match result {
            Ok(ids) => outputs.push(ids),
            Err(err) if err.is_cancellation() => cancelled = cancelled.or(Some(err)),
            Err(err) => return Err(err),
        }
    }
    if let Some(err) = cancelled {
        return Err(err);
    }
    token.check()?;
    Ok(outputs)
}

/// Stitch the column shards of one row slice into a single segment.
fn combine_run(run: &[Arc<EntityBundle>]) -> StrataResult<Segment> {
    let unit = ProcessingUnit {
        ids: Vec::new(),
        bundles: run.to_vec(),
    };
    unit.combined_segment()
}
