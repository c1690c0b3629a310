// Per-table diff and classification.
//
// Compares the central and client copies of one table, using both sides'
// pending change logs to attribute each divergence: one-sided changes
// become updates with a deterministic winner, two-sided changes become
// conflicts routed to the resolver.

use crate::model::{Direction, Record, RecordOperation};
use crate::tracker::ChangeEntry;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Which copy of the data an action applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Central,
    Client,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Central => "central",
            Self::Client => "client",
        }
    }
}

/// A non-conflicting operation ready to apply.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedAction {
    pub target: Side,
    pub operation: RecordOperation,
    pub record_id: String,
    /// The record to write; `None` for deletes.
    pub record: Option<Record>,
}

/// A field changed on both sides since the checkpoint.
///
/// `local` is the client copy, `remote` the central copy, matching the
/// conflict records surfaced to operators.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldConflict {
    pub record_id: String,
    pub field_name: String,
    pub local_value: Value,
    pub remote_value: Value,
    pub local_modified_at: DateTime<Utc>,
    pub remote_modified_at: DateTime<Utc>,
}

/// Classification result for one table.
#[derive(Debug, Default)]
pub struct TablePlan {
    pub actions: Vec<PlannedAction>,
    pub conflicts: Vec<FieldConflict>,
}

/// Pending changes for one side, indexed for classification.
#[derive(Debug, Default)]
pub struct ChangeIndex {
    fields: HashMap<String, HashMap<String, ChangeEntry>>,
    deletes: HashMap<String, ChangeEntry>,
    max_version: u64,
}

impl ChangeIndex {
    pub fn build(pending: Vec<ChangeEntry>) -> Self {
        let mut index = Self::default();
        for entry in pending {
            index.max_version = index.max_version.max(entry.version);
            match (&entry.operation, &entry.field_name) {
                (RecordOperation::Delete, _) => {
                    index.deletes.insert(entry.record_id.clone(), entry);
                }
                (_, Some(field)) => {
                    index
                        .fields
                        .entry(entry.record_id.clone())
                        .or_default()
                        .insert(field.clone(), entry);
                }
                // Field-less non-delete entries carry no usable diff
                (_, None) => {}
            }
        }
        index
    }

    /// Highest version among the pending entries; checkpoint target.
    pub fn max_version(&self) -> u64 {
        self.max_version
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.deletes.is_empty()
    }

    fn changed_field(&self, record_id: &str, field: &str) -> Option<&ChangeEntry> {
        self.fields.get(record_id).and_then(|f| f.get(field))
    }

    fn changed_record(&self, record_id: &str) -> bool {
        self.fields.contains_key(record_id)
    }

    fn deleted(&self, record_id: &str) -> bool {
        self.deletes.contains_key(record_id)
    }

    fn record_ids(&self) -> impl Iterator<Item = &String> {
        self.fields.keys().chain(self.deletes.keys())
    }
}

/// Classify one table's divergences into actions and conflicts.
///
/// For a full sync every record on either side is considered; for an
/// incremental sync only records touched in either pending log.
pub fn classify_table(
    direction: Direction,
    full: bool,
    central: &BTreeMap<String, Record>,
    client: &BTreeMap<String, Record>,
    central_pending: &ChangeIndex,
    client_pending: &ChangeIndex,
) -> TablePlan {
    let mut plan = TablePlan::default();

    let mut ids: BTreeSet<String> = BTreeSet::new();
    if full {
        ids.extend(central.keys().cloned());
        ids.extend(client.keys().cloned());
        ids.extend(central_pending.record_ids().cloned());
        ids.extend(client_pending.record_ids().cloned());
    } else {
        ids.extend(central_pending.record_ids().cloned());
        ids.extend(client_pending.record_ids().cloned());
    }

    for id in ids {
        match (central.get(&id), client.get(&id)) {
            (Some(central_record), Some(client_record)) => classify_pair(
                direction,
                &id,
                central_record,
                client_record,
                central_pending,
                client_pending,
                &mut plan,
            ),
            (Some(central_record), None) => {
                // Absent on the client: either the client deleted it, or it
                // has never been provisioned there.
                if client_pending.deleted(&id)
                    && direction.pushes_client()
                    && !central_pending.changed_record(&id)
                {
                    plan.actions.push(PlannedAction {
                        target: Side::Central,
                        operation: RecordOperation::Delete,
                        record_id: id,
                        record: None,
                    });
                } else if direction.pushes_central() {
                    plan.actions.push(PlannedAction {
                        target: Side::Client,
                        operation: RecordOperation::Insert,
                        record_id: id,
                        record: Some(central_record.clone()),
                    });
                }
            }
            (None, Some(client_record)) => {
                if central_pending.deleted(&id)
                    && direction.pushes_central()
                    && !client_pending.changed_record(&id)
                {
                    plan.actions.push(PlannedAction {
                        target: Side::Client,
                        operation: RecordOperation::Delete,
                        record_id: id,
                        record: None,
                    });
                } else if direction.pushes_client() {
                    plan.actions.push(PlannedAction {
                        target: Side::Central,
                        operation: RecordOperation::Insert,
                        record_id: id,
                        record: Some(client_record.clone()),
                    });
                }
            }
            // Gone from both sides; nothing left to reconcile.
            (None, None) => {}
        }
    }

    plan
}

#[allow(clippy::too_many_arguments)]
fn classify_pair(
    direction: Direction,
    id: &str,
    central_record: &Record,
    client_record: &Record,
    central_pending: &ChangeIndex,
    client_pending: &ChangeIndex,
    plan: &mut TablePlan,
) {
    if central_record.fingerprint() == client_record.fingerprint() {
        return;
    }

    let mut fields: BTreeSet<&String> = BTreeSet::new();
    fields.extend(central_record.fields.keys());
    fields.extend(client_record.fields.keys());

    let mut client_updates: BTreeMap<String, Value> = BTreeMap::new();
    let mut central_updates: BTreeMap<String, Value> = BTreeMap::new();

    for field in fields {
        let central_value = central_record.fields.get(field);
        let client_value = client_record.fields.get(field);
        if central_value == client_value {
            continue;
        }

        let central_entry = central_pending.changed_field(id, field);
        let client_entry = client_pending.changed_field(id, field);

        match (central_entry, client_entry) {
            (Some(central_change), Some(client_change)) => {
                plan.conflicts.push(FieldConflict {
                    record_id: id.to_string(),
                    field_name: field.clone(),
                    local_value: client_value.cloned().unwrap_or(Value::Null),
                    remote_value: central_value.cloned().unwrap_or(Value::Null),
                    local_modified_at: client_change.changed_at,
                    remote_modified_at: central_change.changed_at,
                });
            }
            (Some(_), None) => {
                if direction.pushes_central() {
                    client_updates
                        .insert(field.clone(), central_value.cloned().unwrap_or(Value::Null));
                }
            }
            (None, Some(_)) => {
                if direction.pushes_client() {
                    central_updates
                        .insert(field.clone(), client_value.cloned().unwrap_or(Value::Null));
                }
            }
            // Divergence with no attributable change (pre-tracking drift):
            // cannot name a winner, surface as a conflict with the
            // record-level timestamps.
            (None, None) => {
                plan.conflicts.push(FieldConflict {
                    record_id: id.to_string(),
                    field_name: field.clone(),
                    local_value: client_value.cloned().unwrap_or(Value::Null),
                    remote_value: central_value.cloned().unwrap_or(Value::Null),
                    local_modified_at: client_record.updated_at,
                    remote_modified_at: central_record.updated_at,
                });
            }
        }
    }

    let merged_version = central_record.version.max(client_record.version);
    let merged_updated_at = central_record.updated_at.max(client_record.updated_at);

    if !client_updates.is_empty() {
        let mut merged = client_record.clone();
        for (field, value) in client_updates {
            merged.fields.insert(field, value);
        }
        merged.version = merged_version;
        merged.updated_at = merged_updated_at;
        plan.actions.push(PlannedAction {
            target: Side::Client,
            operation: RecordOperation::Update,
            record_id: id.to_string(),
            record: Some(merged),
        });
    }
    if !central_updates.is_empty() {
        let mut merged = central_record.clone();
        for (field, value) in central_updates {
            merged.fields.insert(field, value);
        }
        merged.version = merged_version;
        merged.updated_at = merged_updated_at;
        plan.actions.push(PlannedAction {
            target: Side::Central,
            operation: RecordOperation::Update,
            record_id: id.to_string(),
            record: Some(merged),
        });
    }
}
