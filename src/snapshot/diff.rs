//! Schema Diff Engine
//!
//! Compares the previously recorded snapshot with the current one and reports
//! per-table additions, removals and modifications. Inside a modified table,
//! fields, indexes and relationships are compared the same way.
//!
//! Entities are matched by name. Adds are reported before removes, both in
//! snapshot declaration order, so the output is stable for a given input.

use crate::snapshot::{
    DatabaseSnapshot, FieldSnapshot, IndexSnapshot, RelationshipSnapshot, TableSnapshot,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Type of schema change detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Add,
    Remove,
    Modify,
}

/// Change to a whole table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChange {
    pub change_type: ChangeType,
    pub table_name: String,
    pub old_table: Option<TableSnapshot>,
    pub new_table: Option<TableSnapshot>,
    /// Populated only for `Modify`
    pub field_changes: Vec<FieldChange>,
    pub index_changes: Vec<IndexChange>,
    pub relationship_changes: Vec<RelationshipChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub change_type: ChangeType,
    pub field_name: String,
    pub old_field: Option<FieldSnapshot>,
    pub new_field: Option<FieldSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexChange {
    pub change_type: ChangeType,
    pub index_name: String,
    pub old_index: Option<IndexSnapshot>,
    pub new_index: Option<IndexSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipChange {
    pub change_type: ChangeType,
    pub relationship_name: String,
    pub old_relationship: Option<RelationshipSnapshot>,
    pub new_relationship: Option<RelationshipSnapshot>,
}

/// Complete schema diff result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub table_changes: Vec<TableChange>,
}

impl SchemaDiff {
    /// Derived from `table_changes`; there is no separate flag to drift out of sync
    pub fn has_changes(&self) -> bool {
        !self.table_changes.is_empty()
    }

    /// Number of atomic changes: one per added/removed table plus one per
    /// nested change of each modified table
    pub fn atomic_change_count(&self) -> usize {
        self.table_changes
            .iter()
            .map(|tc| match tc.change_type {
                ChangeType::Add | ChangeType::Remove => 1,
                ChangeType::Modify => {
                    tc.field_changes.len() + tc.index_changes.len() + tc.relationship_changes.len()
                }
            })
            .sum()
    }

    pub fn summary(&self) -> DiffSummary {
        let mut summary = DiffSummary::default();

        for tc in &self.table_changes {
            match tc.change_type {
                ChangeType::Add => summary.tables_added += 1,
                ChangeType::Remove => summary.tables_removed += 1,
                ChangeType::Modify => summary.tables_modified += 1,
            }
            for fc in &tc.field_changes {
                bump(&mut summary.fields, fc.change_type);
            }
            for ic in &tc.index_changes {
                bump(&mut summary.indexes, ic.change_type);
            }
            for rc in &tc.relationship_changes {
                bump(&mut summary.relationships, rc.change_type);
            }
        }

        summary.total_changes = self.atomic_change_count();
        summary
    }
}

/// Added / removed / modified counters for one entity kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
}

/// Summary statistics for the diff
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub tables_added: usize,
    pub tables_removed: usize,
    pub tables_modified: usize,
    pub fields: ChangeCounts,
    pub indexes: ChangeCounts,
    pub relationships: ChangeCounts,
    pub total_changes: usize,
}

fn bump(counts: &mut ChangeCounts, change_type: ChangeType) {
    match change_type {
        ChangeType::Add => counts.added += 1,
        ChangeType::Remove => counts.removed += 1,
        ChangeType::Modify => counts.modified += 1,
    }
}

/// Anything diffed by name
trait Named {
    fn name(&self) -> &str;
}

impl Named for TableSnapshot {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Named for FieldSnapshot {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Named for IndexSnapshot {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Named for RelationshipSnapshot {
    fn name(&self) -> &str {
        &self.name
    }
}

/// One matched entity: (change, old, new)
type Matched<'a, T> = (ChangeType, Option<&'a T>, Option<&'a T>);

/// The diff engine that compares schema snapshots
pub struct DiffEngine;

impl DiffEngine {
    /// Compare the previous snapshot (if any) with the current one
    pub fn diff(old: Option<&DatabaseSnapshot>, new: &DatabaseSnapshot) -> SchemaDiff {
        let old_tables: &[TableSnapshot] = old.map(|s| s.tables.as_slice()).unwrap_or(&[]);
        let mut table_changes = Vec::new();

        for (change_type, old_table, new_table) in Self::match_by_name(old_tables, &new.tables, true) {
            let change = match change_type {
                ChangeType::Add | ChangeType::Remove => {
                    let table = new_table.or(old_table);
                    TableChange {
                        change_type,
                        table_name: table.map(|t| t.name.clone()).unwrap_or_default(),
                        old_table: old_table.cloned(),
                        new_table: new_table.cloned(),
                        field_changes: Vec::new(),
                        index_changes: Vec::new(),
                        relationship_changes: Vec::new(),
                    }
                }
                ChangeType::Modify => match (old_table, new_table) {
                    (Some(from), Some(to)) => match Self::diff_table(from, to) {
                        Some(change) => change,
                        None => continue,
                    },
                    _ => continue,
                },
            };
            table_changes.push(change);
        }

        SchemaDiff { table_changes }
    }

    /// Compare the contents of a table present in both snapshots.
    ///
    /// Returns `None` when no field, index or relationship differs.
    fn diff_table(from: &TableSnapshot, to: &TableSnapshot) -> Option<TableChange> {
        let field_changes: Vec<FieldChange> = Self::match_by_name(&from.fields, &to.fields, false)
            .into_iter()
            .map(|(change_type, old, new)| FieldChange {
                change_type,
                field_name: name_of(old, new),
                old_field: old.cloned(),
                new_field: new.cloned(),
            })
            .collect();

        let index_changes: Vec<IndexChange> = Self::match_by_name(&from.indexes, &to.indexes, false)
            .into_iter()
            .map(|(change_type, old, new)| IndexChange {
                change_type,
                index_name: name_of(old, new),
                old_index: old.cloned(),
                new_index: new.cloned(),
            })
            .collect();

        let relationship_changes: Vec<RelationshipChange> =
            Self::match_by_name(&from.relationships, &to.relationships, false)
                .into_iter()
                .map(|(change_type, old, new)| RelationshipChange {
                    change_type,
                    relationship_name: name_of(old, new),
                    old_relationship: old.cloned(),
                    new_relationship: new.cloned(),
                })
                .collect();

        if field_changes.is_empty() && index_changes.is_empty() && relationship_changes.is_empty()
        {
            return None;
        }

        Some(TableChange {
            change_type: ChangeType::Modify,
            table_name: to.name.clone(),
            old_table: Some(from.clone()),
            new_table: Some(to.clone()),
            field_changes,
            index_changes,
            relationship_changes,
        })
    }

    /// Match two lists by name.
    ///
    /// With `descend` set, entries present on both sides are always reported
    /// as `Modify` so the caller can compare their contents; otherwise only
    /// when the two values differ.
    fn match_by_name<'a, T: Named + PartialEq>(
        old: &'a [T],
        new: &'a [T],
        descend: bool,
    ) -> Vec<Matched<'a, T>> {
        let old_map: HashMap<&str, &T> = old.iter().map(|o| (o.name(), o)).collect();
        let new_map: HashMap<&str, &T> = new.iter().map(|n| (n.name(), n)).collect();

        let mut matched = Vec::new();

        // Detect added and modified entries
        for item in new {
            match old_map.get(item.name()) {
                None => matched.push((ChangeType::Add, None, Some(item))),
                Some(previous) if descend || *previous != item => {
                    matched.push((ChangeType::Modify, Some(*previous), Some(item)))
                }
                Some(_) => {}
            }
        }

        // Detect removed entries
        for item in old {
            if !new_map.contains_key(item.name()) {
                matched.push((ChangeType::Remove, Some(item), None));
            }
        }

        matched
    }
}

fn name_of<T: Named>(old: Option<&T>, new: Option<&T>) -> String {
    new.or(old).map(|e| e.name().to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Field, FieldType, Index, Relationship, RelationshipType, TableSchema};
    use crate::snapshot::tests::{posts_table, users_table};
    use pretty_assertions::assert_eq;

    fn snap(tables: &[TableSchema]) -> DatabaseSnapshot {
        DatabaseSnapshot::capture_at(tables, 1_700_000_000).unwrap()
    }

    #[test]
    fn test_identical_snapshots_have_no_changes() {
        let tables = [users_table(), posts_table()];
        let diff = DiffEngine::diff(Some(&snap(&tables)), &snap(&tables));

        assert!(!diff.has_changes());
        assert!(diff.table_changes.is_empty());
    }

    #[test]
    fn test_first_run_adds_every_table() {
        let current = snap(&[users_table(), posts_table()]);
        let diff = DiffEngine::diff(None, &current);

        assert_eq!(diff.table_changes.len(), 2);
        for (change, table) in diff.table_changes.iter().zip(&current.tables) {
            assert_eq!(change.change_type, ChangeType::Add);
            assert_eq!(change.new_table.as_ref(), Some(table));
            assert!(change.old_table.is_none());
        }
    }

    #[test]
    fn test_removed_table_is_not_a_modify() {
        let before = snap(&[users_table(), posts_table()]);
        let after = snap(&[users_table()]);
        let diff = DiffEngine::diff(Some(&before), &after);

        assert_eq!(diff.table_changes.len(), 1);
        let change = &diff.table_changes[0];
        assert_eq!(change.change_type, ChangeType::Remove);
        assert_eq!(change.table_name, "posts");
        assert_eq!(change.old_table.as_ref(), before.table("posts"));
    }

    #[test]
    fn test_added_field_is_single_field_change() {
        let before = snap(&[TableSchema::builder("users")
            .field(Field::new("id", FieldType::Uuid).primary_key())
            .build()
            .unwrap()]);
        let after = snap(&[users_table()]);
        let diff = DiffEngine::diff(Some(&before), &after);

        assert_eq!(diff.table_changes.len(), 1);
        let change = &diff.table_changes[0];
        assert_eq!(change.change_type, ChangeType::Modify);
        assert_eq!(change.field_changes.len(), 1);
        assert_eq!(change.field_changes[0].change_type, ChangeType::Add);
        assert_eq!(change.field_changes[0].field_name, "email");
        assert!(change.index_changes.is_empty());
        assert!(change.relationship_changes.is_empty());
    }

    #[test]
    fn test_unique_toggle_is_modify() {
        let before = snap(&[users_table()]);
        let after = snap(&[TableSchema::builder("users")
            .field(Field::new("id", FieldType::Uuid).primary_key())
            .field(Field::new("email", FieldType::Text))
            .build()
            .unwrap()]);
        let diff = DiffEngine::diff(Some(&before), &after);

        let changes = &diff.table_changes[0].field_changes;
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Modify);
        assert!(changes[0].old_field.as_ref().unwrap().unique);
        assert!(!changes[0].new_field.as_ref().unwrap().unique);
    }

    #[test]
    fn test_default_value_change_is_detected() {
        let with_default = |value: Option<&str>| {
            let mut field = Field::new("status", FieldType::Text);
            if let Some(v) = value {
                field = field.default_value(v);
            }
            snap(&[TableSchema::builder("jobs").field(field).build().unwrap()])
        };

        let diff = DiffEngine::diff(Some(&with_default(None)), &with_default(Some("'new'")));
        assert_eq!(diff.table_changes[0].field_changes[0].change_type, ChangeType::Modify);

        let diff = DiffEngine::diff(Some(&with_default(Some("'new'"))), &with_default(Some("'new'")));
        assert!(!diff.has_changes());
    }

    #[test]
    fn test_index_column_order_matters() {
        let table = |columns: &[&str]| {
            snap(&[TableSchema::builder("events")
                .field(Field::new("a", FieldType::Integer))
                .field(Field::new("b", FieldType::Integer))
                .index(Index::new("idx_events_ab", columns))
                .build()
                .unwrap()])
        };

        let diff = DiffEngine::diff(Some(&table(&["a", "b"])), &table(&["b", "a"]));
        let changes = &diff.table_changes[0].index_changes;
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Modify);
        assert_eq!(changes[0].index_name, "idx_events_ab");
    }

    #[test]
    fn test_relationship_action_change_is_modify() {
        let before = snap(&[users_table(), posts_table()]);
        let mut changed = posts_table();
        changed.relationships[0] = Relationship::new("fk_posts_author", "author_id", "users", "id")
            .kind(RelationshipType::OneToOne);
        let after = snap(&[users_table(), changed]);

        let diff = DiffEngine::diff(Some(&before), &after);
        assert_eq!(diff.table_changes.len(), 1);
        let rc = &diff.table_changes[0].relationship_changes;
        assert_eq!(rc.len(), 1);
        assert_eq!(rc[0].change_type, ChangeType::Modify);
        assert_eq!(rc[0].relationship_name, "fk_posts_author");
    }

    #[test]
    fn test_adds_precede_removes() {
        let before = snap(&[TableSchema::builder("users")
            .field(Field::new("id", FieldType::Uuid))
            .field(Field::new("legacy", FieldType::Text))
            .build()
            .unwrap()]);
        let after = snap(&[TableSchema::builder("users")
            .field(Field::new("id", FieldType::Uuid))
            .field(Field::new("email", FieldType::Text))
            .build()
            .unwrap()]);

        let diff = DiffEngine::diff(Some(&before), &after);
        let kinds: Vec<_> = diff.table_changes[0]
            .field_changes
            .iter()
            .map(|fc| (fc.change_type, fc.field_name.as_str()))
            .collect();
        assert_eq!(kinds, vec![(ChangeType::Add, "email"), (ChangeType::Remove, "legacy")]);
    }

    #[test]
    fn test_summary_counts_atomic_changes() {
        let before = snap(&[users_table(), posts_table()]);
        let after = snap(&[TableSchema::builder("users")
            .field(Field::new("id", FieldType::Uuid).primary_key())
            .field(Field::new("email", FieldType::Text))
            .field(Field::new("name", FieldType::Text).nullable())
            .index(Index::new("idx_users_name", &["name"]))
            .build()
            .unwrap()]);

        let diff = DiffEngine::diff(Some(&before), &after);
        let summary = diff.summary();

        assert_eq!(summary.tables_removed, 1);
        assert_eq!(summary.tables_modified, 1);
        assert_eq!(summary.fields.added, 1);
        assert_eq!(summary.fields.modified, 1);
        assert_eq!(summary.indexes.added, 1);
        assert_eq!(summary.total_changes, 4);
        assert_eq!(diff.atomic_change_count(), 4);
    }
}
