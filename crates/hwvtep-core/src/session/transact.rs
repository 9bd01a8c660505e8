// ── Outbound transactions ──
//
// Turns a TransactCommand into wire operations against the current cache,
// submits it, and folds the device's answer back into the cache.

use std::collections::HashMap;
use std::sync::Arc;

use hwvtep_api::wire::{named_uuid_value, uuid_value};
use hwvtep_api::{Condition, Operation, OperationResult, Row};
use tracing::{debug, info, warn};

use super::ConnectionSession;
use super::history::{HistoryAction, HistoryEntry};
use crate::cache::{DeviceCache, EntityRef};
use crate::error::CoreError;
use crate::model::{DeviceId, DeviceRow, EntityKind, ModelKey, Reference, RowAction, TransactCommand};

/// Where a reference column points.
#[derive(Debug, Clone, PartialEq)]
enum RefTarget {
    /// A row the device already has.
    Device(DeviceId),
    /// A row inserted by an earlier step of the same transaction.
    Step(usize),
}

#[derive(Debug)]
enum StepAction {
    Insert,
    Update(DeviceId),
    Delete(DeviceId),
}

#[derive(Debug)]
struct Step {
    kind: EntityKind,
    key: ModelKey,
    action: StepAction,
    payload: Row,
    references: Vec<(Reference, RefTarget)>,
    prior: Option<Arc<DeviceRow>>,
}

#[derive(Debug, Default)]
struct Plan {
    steps: Vec<Step>,
    operations: Vec<Operation>,
}

fn named_row(step: usize) -> String {
    format!("row{step}")
}

/// Resolve every op against the cache. Deletes of rows the device never
/// had are dropped; a reference nothing can resolve fails the command.
fn plan(cache: &DeviceCache, cmd: &TransactCommand) -> Result<Plan, CoreError> {
    let mut plan = Plan::default();
    let mut inserted: HashMap<(EntityKind, ModelKey), usize> = HashMap::new();

    for op in &cmd.ops {
        let prior = cache.get(op.kind, &op.key);
        let existing = prior.as_ref().and_then(|r| r.device_id().cloned());
        let table = op.kind.table().to_owned();
        let index = plan.steps.len();

        match &op.action {
            RowAction::Delete => {
                let Some(id) = existing else {
                    debug!(kind = %op.kind, key = %op.key, "delete of unknown row skipped");
                    continue;
                };
                plan.operations.push(Operation::Delete {
                    table,
                    conditions: vec![Condition::uuid_eq(&id.to_string())],
                });
                plan.steps.push(Step {
                    kind: op.kind,
                    key: op.key.clone(),
                    action: StepAction::Delete(id),
                    payload: Row::new(),
                    references: Vec::new(),
                    prior,
                });
            }
            RowAction::Upsert {
                payload,
                references,
            } => {
                let mut row = payload.clone();
                let mut resolved = Vec::with_capacity(references.len());
                for reference in references {
                    let target = if let Some(step) =
                        inserted.get(&(reference.kind, reference.key.clone()))
                    {
                        RefTarget::Step(*step)
                    } else if let Some(id) = cache.device_id(reference.kind, &reference.key) {
                        RefTarget::Device(id)
                    } else {
                        return Err(CoreError::UnresolvedReference {
                            kind: op.kind,
                            key: op.key.clone(),
                            column: reference.column.clone(),
                            target_kind: reference.kind,
                            target: reference.key.clone(),
                        });
                    };
                    let value = match &target {
                        RefTarget::Device(id) => uuid_value(&id.to_string()),
                        RefTarget::Step(step) => named_uuid_value(&named_row(*step)),
                    };
                    row.insert(reference.column.clone(), value);
                    resolved.push((reference.clone(), target));
                }

                let action = if let Some(id) = existing {
                    plan.operations.push(Operation::Update {
                        table,
                        conditions: vec![Condition::uuid_eq(&id.to_string())],
                        row,
                    });
                    StepAction::Update(id)
                } else {
                    inserted.insert((op.kind, op.key.clone()), index);
                    plan.operations.push(Operation::Insert {
                        table,
                        row,
                        uuid_name: Some(named_row(index)),
                    });
                    StepAction::Insert
                };
                plan.steps.push(Step {
                    kind: op.kind,
                    key: op.key.clone(),
                    action,
                    payload: payload.clone(),
                    references: resolved,
                    prior,
                });
            }
        }
    }
    Ok(plan)
}

/// First failed operation, or a short result list.
fn first_error(results: &[OperationResult], expected: usize) -> Option<String> {
    if let Some((index, result)) = results.iter().enumerate().find(|(_, r)| r.is_error()) {
        let error = result.error.as_deref().unwrap_or_default();
        return Some(match &result.details {
            Some(details) => format!("operation {index}: {error} ({details})"),
            None => format!("operation {index}: {error}"),
        });
    }
    (results.len() < expected)
        .then(|| format!("{} results for {expected} operations", results.len()))
}

/// Submit one command. Failures are logged and recorded; nothing here
/// retries.
pub(super) async fn execute(session: &ConnectionSession, cmd: TransactCommand) {
    let inner = &session.inner;
    let label = cmd.label();

    let plan = match plan(&inner.cache, &cmd) {
        Ok(plan) => plan,
        Err(e) => {
            warn!(node = %inner.node, command = %label, error = %e, "command dropped");
            for op in &cmd.ops {
                inner.controller_history.record(
                    HistoryEntry::new(op.kind, op.key.clone(), None, HistoryAction::Failed)
                        .with_detail(e.to_string()),
                );
            }
            return;
        }
    };
    if plan.steps.is_empty() {
        debug!(node = %inner.node, command = %label, "nothing to submit");
        return;
    }

    for step in &plan.steps {
        inner.cache.mark_in_transit(step.kind, &step.key);
    }

    debug!(
        node = %inner.node,
        command = %label,
        operations = plan.operations.len(),
        "submitting transaction"
    );
    match inner.client.transact(&inner.schema, plan.operations).await {
        Ok(results) => match first_error(&results, plan.steps.len()) {
            None => confirm(session, &plan.steps, &results),
            Some(message) => {
                warn!(node = %inner.node, command = %label, error = %message, "device rejected transaction");
                restore(&inner.cache, &plan.steps);
                record_failed(session, &plan.steps, &message);
            }
        },
        Err(e) => {
            // Outcome unknown: rows stay in transit until the device
            // reports them or the sweep purges them.
            warn!(node = %inner.node, command = %label, error = %e, "transaction failed");
            record_failed(session, &plan.steps, &e.to_string());
            if e.is_transient() {
                session.report_fault(e.into());
            }
        }
    }
    inner.queue.on_config_data_available();
}

fn confirm(session: &ConnectionSession, steps: &[Step], results: &[OperationResult]) {
    let inner = &session.inner;

    // Device ids first, so references to rows inserted in this
    // transaction resolve below.
    let ids: Vec<Option<DeviceId>> = steps
        .iter()
        .zip(results)
        .map(|(step, result)| match &step.action {
            StepAction::Insert => result.inserted_uuid().map(DeviceId::from),
            StepAction::Update(id) | StepAction::Delete(id) => Some(id.clone()),
        })
        .collect();

    for (step, id) in steps.iter().zip(&ids) {
        let referrer = EntityRef::new(step.kind, step.key.clone());
        match (&step.action, id) {
            (StepAction::Delete(id), _) => {
                inner.cache.clear(step.kind, &step.key);
                inner.cache.release_refs(&referrer);
                inner.controller_history.record(HistoryEntry::new(
                    step.kind,
                    step.key.clone(),
                    Some(id.clone()),
                    HistoryAction::Delete,
                ));
            }
            (_, None) => {
                warn!(kind = %step.kind, key = %step.key, "insert returned no uuid");
                inner.cache.clear(step.kind, &step.key);
            }
            (action, Some(id)) => {
                let mut row = step
                    .prior
                    .as_ref()
                    .and_then(|r| r.payload().cloned())
                    .unwrap_or_default();
                row.extend(step.payload.clone());
                let mut shared = Vec::new();
                for (reference, target) in &step.references {
                    let resolved = match target {
                        RefTarget::Device(id) => Some(id.clone()),
                        RefTarget::Step(index) => ids.get(*index).cloned().flatten(),
                    };
                    if let Some(resolved) = resolved {
                        row.insert(reference.column.clone(), uuid_value(&resolved.to_string()));
                    }
                    if reference.kind.is_shared_resource() {
                        shared.push(EntityRef::new(reference.kind, reference.key.clone()));
                    }
                }

                inner
                    .cache
                    .mark_available(step.kind, step.key.clone(), id.clone(), row);
                inner.cache.set_refs(&referrer, &shared);
                let action = if matches!(action, StepAction::Insert) {
                    HistoryAction::Insert
                } else {
                    HistoryAction::Update
                };
                inner.controller_history.record(HistoryEntry::new(
                    step.kind,
                    step.key.clone(),
                    Some(id.clone()),
                    action,
                ));
            }
        }
    }
    info!(node = %inner.node, rows = steps.len(), "transaction confirmed");
}

/// Put rows back the way they were before submission. A rejected
/// transaction changed nothing on the device.
fn restore(cache: &DeviceCache, steps: &[Step]) {
    for step in steps {
        let prior = step
            .prior
            .as_ref()
            .and_then(|r| Some((r.device_id()?.clone(), r.payload().cloned().unwrap_or_default())));
        match prior {
            Some((id, payload)) => cache.mark_available(step.kind, step.key.clone(), id, payload),
            None => {
                cache.clear(step.kind, &step.key);
            }
        }
    }
}

fn record_failed(session: &ConnectionSession, steps: &[Step], detail: &str) {
    for step in steps {
        let id = match &step.action {
            StepAction::Insert => None,
            StepAction::Update(id) | StepAction::Delete(id) => Some(id.clone()),
        };
        session.inner.controller_history.record(
            HistoryEntry::new(step.kind, step.key.clone(), id, HistoryAction::Failed)
                .with_detail(detail),
        );
    }
}
