//! Schema Snapshot Module
//!
//! Point-in-time captures of the declared schema. This module provides:
//! - Snapshot model (self-contained, string-typed, serializable)
//! - Snapshot store (JSON file persistence)
//! - Schema diff engine (comparing snapshots)
//!
//! Every enum is stored by its text tag so a snapshot written by one run can be
//! read back by another build without depending on in-memory representations.

pub mod diff;
pub mod store;

pub use diff::{
    ChangeCounts, ChangeType, DiffEngine, DiffSummary, FieldChange, IndexChange,
    RelationshipChange, SchemaDiff, TableChange,
};
pub use store::SnapshotStore;

use crate::error::{invalid_schema, MigrateResult};
use crate::schema::{
    AutoGenerate, Field, FieldType, HasMany, Index, ReferentialAction, Relationship,
    RelationshipType, TableSchema,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Current snapshot file format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Complete declared schema at a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSnapshot {
    pub version: u32,
    /// Unix seconds at capture
    pub created_at: i64,
    pub tables: Vec<TableSnapshot>,
}

impl DatabaseSnapshot {
    /// Capture the given tables using the current wall-clock time
    pub fn capture(tables: &[TableSchema]) -> MigrateResult<Self> {
        Self::capture_at(tables, Utc::now().timestamp())
    }

    /// Capture the given tables with an explicit timestamp.
    ///
    /// Every table is validated first; on any failure nothing is returned.
    pub fn capture_at(tables: &[TableSchema], created_at: i64) -> MigrateResult<Self> {
        let mut names = HashSet::new();
        for table in tables {
            table.validate()?;
            if !names.insert(table.name.as_str()) {
                return Err(invalid_schema(format!("duplicate table '{}'", table.name)));
            }
        }

        Ok(Self {
            version: SNAPSHOT_VERSION,
            created_at,
            tables: tables.iter().map(TableSnapshot::from_schema).collect(),
        })
    }

    pub fn table(&self, name: &str) -> Option<&TableSnapshot> {
        self.tables.iter().find(|t| t.name == name)
    }
}

/// One table inside a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub name: String,
    pub fields: Vec<FieldSnapshot>,
    pub indexes: Vec<IndexSnapshot>,
    pub relationships: Vec<RelationshipSnapshot>,
    pub has_many: Vec<HasManySnapshot>,
}

impl TableSnapshot {
    /// Capture the effective shape of a table (alters applied, dropped indexes removed)
    pub fn from_schema(table: &TableSchema) -> Self {
        Self {
            name: table.name.clone(),
            fields: table.effective_fields().iter().map(FieldSnapshot::from).collect(),
            indexes: table.effective_indexes().iter().map(IndexSnapshot::from).collect(),
            relationships: table.relationships.iter().map(RelationshipSnapshot::from).collect(),
            has_many: table.has_many.iter().map(HasManySnapshot::from).collect(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSnapshot> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn index(&self, name: &str) -> Option<&IndexSnapshot> {
        self.indexes.iter().find(|i| i.name == name)
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipSnapshot> {
        self.relationships.iter().find(|r| r.name == name)
    }
}

/// Column as recorded in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSnapshot {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    pub primary_key: bool,
    pub unique: bool,
    pub not_null: bool,
    pub default_value: Option<String>,
    pub auto_generated: bool,
    pub auto_generate_type: String,
}

impl FieldSnapshot {
    pub fn field_type(&self) -> MigrateResult<FieldType> {
        self.field_type.parse()
    }

    pub fn auto_generate(&self) -> MigrateResult<AutoGenerate> {
        self.auto_generate_type.parse()
    }
}

impl From<&Field> for FieldSnapshot {
    fn from(field: &Field) -> Self {
        Self {
            name: field.name.clone(),
            field_type: field.field_type.as_str().to_string(),
            primary_key: field.primary_key,
            unique: field.unique,
            not_null: field.not_null,
            default_value: field.default_value.clone(),
            auto_generated: field.is_auto_generated(),
            auto_generate_type: field.auto_generate.as_str().to_string(),
        }
    }
}

/// Index as recorded in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

impl From<&Index> for IndexSnapshot {
    fn from(index: &Index) -> Self {
        Self {
            name: index.name.clone(),
            columns: index.columns.clone(),
            unique: index.unique,
        }
    }
}

/// Relationship as recorded in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipSnapshot {
    pub name: String,
    pub column: String,
    pub references_table: String,
    pub references_column: String,
    pub relationship_type: String,
    pub on_delete: String,
    pub on_update: String,
}

impl RelationshipSnapshot {
    pub fn relationship_type(&self) -> MigrateResult<RelationshipType> {
        self.relationship_type.parse()
    }

    pub fn on_delete(&self) -> MigrateResult<ReferentialAction> {
        self.on_delete.parse()
    }

    pub fn on_update(&self) -> MigrateResult<ReferentialAction> {
        self.on_update.parse()
    }

    /// Whether this relationship materializes as a constraint on its own table
    pub fn carries_constraint(&self) -> MigrateResult<bool> {
        Ok(self.relationship_type()?.carries_constraint())
    }
}

impl From<&Relationship> for RelationshipSnapshot {
    fn from(rel: &Relationship) -> Self {
        Self {
            name: rel.name.clone(),
            column: rel.column.clone(),
            references_table: rel.references_table.clone(),
            references_column: rel.references_column.clone(),
            relationship_type: rel.relationship_type.as_str().to_string(),
            on_delete: rel.on_delete.as_str().to_string(),
            on_update: rel.on_update.as_str().to_string(),
        }
    }
}

/// Metadata-only one-to-many link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HasManySnapshot {
    pub name: String,
    pub table: String,
    pub foreign_key: String,
}

impl From<&HasMany> for HasManySnapshot {
    fn from(has_many: &HasMany) -> Self {
        Self {
            name: has_many.name.clone(),
            table: has_many.table.clone(),
            foreign_key: has_many.foreign_key.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::schema::{Field, FieldType, Index, Relationship};
    use pretty_assertions::assert_eq;

    pub(crate) fn users_table() -> TableSchema {
        TableSchema::builder("users")
            .field(Field::new("id", FieldType::Uuid).primary_key())
            .field(Field::new("email", FieldType::Text).unique())
            .build()
            .unwrap()
    }

    pub(crate) fn posts_table() -> TableSchema {
        TableSchema::builder("posts")
            .field(
                Field::new("id", FieldType::BigInt)
                    .primary_key()
                    .auto_generate(AutoGenerate::Increments),
            )
            .field(Field::new("author_id", FieldType::Uuid))
            .field(Field::new("title", FieldType::Text).default_value("'untitled'"))
            .index(Index::new("idx_posts_title", &["title"]))
            .relationship(
                Relationship::new("fk_posts_author", "author_id", "users", "id")
                    .on_delete(ReferentialAction::Cascade),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_capture_stringifies_enums() {
        let snapshot = DatabaseSnapshot::capture_at(&[posts_table()], 1_700_000_000).unwrap();

        assert_eq!(snapshot.version, SNAPSHOT_VERSION);
        assert_eq!(snapshot.created_at, 1_700_000_000);

        let posts = snapshot.table("posts").unwrap();
        let id = posts.field("id").unwrap();
        assert_eq!(id.field_type, "bigint");
        assert!(id.auto_generated);
        assert_eq!(id.auto_generate_type, "increments");

        let title = posts.field("title").unwrap();
        assert!(!title.auto_generated);
        assert_eq!(title.auto_generate_type, "none");
        assert_eq!(title.default_value.as_deref(), Some("'untitled'"));

        let fk = posts.relationship("fk_posts_author").unwrap();
        assert_eq!(fk.relationship_type, "many_to_one");
        assert_eq!(fk.on_delete, "cascade");
        assert_eq!(fk.on_update, "no_action");
        assert!(fk.carries_constraint().unwrap());
    }

    #[test]
    fn test_capture_rejects_duplicate_tables() {
        let result = DatabaseSnapshot::capture(&[users_table(), users_table()]);
        assert!(result.is_err());
    }

    #[test]
    fn test_snapshot_is_independent_of_source() {
        let mut table = users_table();
        let snapshot = DatabaseSnapshot::capture(std::slice::from_ref(&table)).unwrap();

        table.fields[1].name = "renamed".to_string();
        assert!(snapshot.table("users").unwrap().field("email").is_some());
    }

    #[test]
    fn test_json_shape_uses_type_key() {
        let snapshot = DatabaseSnapshot::capture_at(&[users_table()], 1).unwrap();
        let json = serde_json::to_value(&snapshot).unwrap();

        let field = &json["tables"][0]["fields"][0];
        assert_eq!(field["type"], "uuid");
        assert_eq!(field["primary_key"], true);
        assert!(field["default_value"].is_null());
    }

    #[test]
    fn test_snapshot_captures_effective_table() {
        let table = TableSchema::builder("users")
            .field(Field::new("email", FieldType::Text))
            .alter(Field::new("email", FieldType::Text).nullable())
            .index(Index::new("idx_users_email", &["email"]))
            .drop_index("idx_users_email")
            .build()
            .unwrap();

        let snapshot = TableSnapshot::from_schema(&table);
        assert!(!snapshot.fields[0].not_null);
        assert!(snapshot.indexes.is_empty());
    }
}
