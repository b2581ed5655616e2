//! Migration SQL generator
//!
//! Generates PostgreSQL DDL statements from snapshot entities. Every statement
//! ends with `;\n`. Table and index creation and every drop are guarded with
//! `IF [NOT] EXISTS`; `ADD COLUMN` and `ADD CONSTRAINT` are emitted bare, so
//! applying them twice fails instead of passing silently.

use crate::error::MigrateResult;
use crate::schema::AutoGenerate;
use crate::snapshot::{FieldSnapshot, IndexSnapshot, RelationshipSnapshot, TableSnapshot};
use std::fmt::Write;

/// How a column gets a value when none is supplied
#[derive(Debug, Clone, PartialEq, Eq)]
enum ValueSource {
    Identity,
    Default(String),
    Nothing,
}

fn value_source(field: &FieldSnapshot) -> MigrateResult<ValueSource> {
    let auto = if field.auto_generated {
        field.auto_generate()?
    } else {
        AutoGenerate::None
    };

    Ok(match auto {
        AutoGenerate::Increments => ValueSource::Identity,
        AutoGenerate::Uuid => ValueSource::Default("gen_random_uuid()".to_string()),
        AutoGenerate::Timestamp => ValueSource::Default("CURRENT_TIMESTAMP".to_string()),
        AutoGenerate::None => match &field.default_value {
            Some(value) => ValueSource::Default(value.clone()),
            None => ValueSource::Nothing,
        },
    })
}

fn effective_not_null(field: &FieldSnapshot) -> bool {
    field.not_null || field.primary_key
}

fn effective_unique(field: &FieldSnapshot) -> bool {
    field.unique && !field.primary_key
}

/// PostgreSQL's default name for a single-column unique constraint
fn unique_constraint_name(table: &str, column: &str) -> String {
    format!("{}_{}_key", table, column)
}

/// NOT NULL column that existing rows cannot satisfy without a manual backfill
pub fn needs_manual_default(field: &FieldSnapshot) -> MigrateResult<bool> {
    Ok(effective_not_null(field) && value_source(field)? == ValueSource::Nothing)
}

/// `<name> <type> [PRIMARY KEY] [NOT NULL] [UNIQUE] [identity | DEFAULT ...]`
pub fn column_definition(field: &FieldSnapshot) -> MigrateResult<String> {
    let mut def = format!("{} {}", field.name, field.field_type()?.sql_type());

    if field.primary_key {
        def.push_str(" PRIMARY KEY");
    } else {
        if field.not_null {
            def.push_str(" NOT NULL");
        }
        if field.unique {
            def.push_str(" UNIQUE");
        }
    }

    match value_source(field)? {
        ValueSource::Identity => def.push_str(" GENERATED ALWAYS AS IDENTITY"),
        ValueSource::Default(value) => {
            let _ = write!(def, " DEFAULT {}", value);
        }
        ValueSource::Nothing => {}
    }

    Ok(def)
}

/// Base table with its columns only
pub fn create_table(table: &TableSnapshot) -> MigrateResult<String> {
    let columns = table
        .fields
        .iter()
        .map(|f| column_definition(f).map(|def| format!("  {}", def)))
        .collect::<MigrateResult<Vec<_>>>()?;

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n);\n",
        table.name,
        columns.join(",\n")
    ))
}

pub fn drop_table(table: &str) -> String {
    format!("DROP TABLE IF EXISTS {} CASCADE;\n", table)
}

/// Add a column; a NOT NULL column with nothing to fill existing rows gets a
/// warning comment ahead of the statement
pub fn add_column(table: &str, field: &FieldSnapshot) -> MigrateResult<String> {
    let mut sql = String::new();

    if needs_manual_default(field)? {
        let _ = writeln!(
            sql,
            "-- WARNING: {}.{} is NOT NULL without a default; this fails on a table with rows.",
            table, field.name
        );
        sql.push_str("-- Add a DEFAULT or backfill the column manually before applying.\n");
    }

    let _ = writeln!(sql, "ALTER TABLE {} ADD COLUMN {};", table, column_definition(field)?);
    Ok(sql)
}

pub fn drop_column(table: &str, column: &str) -> String {
    format!("ALTER TABLE {} DROP COLUMN IF EXISTS {};\n", table, column)
}

/// Statements turning column `from` into column `to`.
///
/// The down direction is the same call with the arguments swapped.
pub fn alter_column(table: &str, from: &FieldSnapshot, to: &FieldSnapshot) -> MigrateResult<String> {
    let column = &to.name;
    let prefix = format!("ALTER TABLE {} ALTER COLUMN {}", table, column);
    let mut statements = Vec::new();

    // Constraints that would block the changes below go first
    if from.primary_key && !to.primary_key {
        statements.push(format!(
            "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}_pkey;",
            table, table
        ));
    }
    if effective_unique(from) && !effective_unique(to) {
        statements.push(format!(
            "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {};",
            table,
            unique_constraint_name(table, column)
        ));
    }

    let from_type = from.field_type()?;
    let to_type = to.field_type()?;
    if from_type != to_type {
        let sql_type = to_type.sql_type();
        statements.push(format!("{} TYPE {} USING {}::{};", prefix, sql_type, column, sql_type));
    }

    let from_source = value_source(from)?;
    let to_source = value_source(to)?;
    if from_source != to_source {
        if from_source == ValueSource::Identity {
            statements.push(format!("{} DROP IDENTITY IF EXISTS;", prefix));
        }
        match &to_source {
            ValueSource::Default(value) => {
                statements.push(format!("{} SET DEFAULT {};", prefix, value))
            }
            ValueSource::Identity | ValueSource::Nothing => {
                if matches!(from_source, ValueSource::Default(_)) {
                    statements.push(format!("{} DROP DEFAULT;", prefix));
                }
            }
        }
        if to_source == ValueSource::Identity {
            statements.push(format!("{} ADD GENERATED ALWAYS AS IDENTITY;", prefix));
        }
    }

    match (effective_not_null(from), effective_not_null(to)) {
        (false, true) => statements.push(format!("{} SET NOT NULL;", prefix)),
        (true, false) => statements.push(format!("{} DROP NOT NULL;", prefix)),
        _ => {}
    }

    if !effective_unique(from) && effective_unique(to) {
        statements.push(format!(
            "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({});",
            table,
            unique_constraint_name(table, column),
            column
        ));
    }
    if !from.primary_key && to.primary_key {
        statements.push(format!("ALTER TABLE {} ADD PRIMARY KEY ({});", table, column));
    }

    if statements.is_empty() {
        return Ok(format!("-- No DDL required for {}.{}\n", table, column));
    }

    let mut sql = statements.join("\n");
    sql.push('\n');
    Ok(sql)
}

pub fn create_index(table: &str, index: &IndexSnapshot) -> String {
    format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {} ({});\n",
        if index.unique { "UNIQUE " } else { "" },
        index.name,
        table,
        index.columns.join(", ")
    )
}

pub fn drop_index(index: &str) -> String {
    format!("DROP INDEX IF EXISTS {};\n", index)
}

/// Foreign-key constraint, or `None` for relationship kinds that never own one
pub fn add_foreign_key(table: &str, rel: &RelationshipSnapshot) -> MigrateResult<Option<String>> {
    if !rel.carries_constraint()? {
        return Ok(None);
    }

    Ok(Some(format!(
        "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {} ON UPDATE {};\n",
        table,
        rel.name,
        rel.column,
        rel.references_table,
        rel.references_column,
        rel.on_delete()?.sql(),
        rel.on_update()?.sql()
    )))
}

pub fn drop_foreign_key(table: &str, constraint: &str) -> String {
    format!("ALTER TABLE {} DROP CONSTRAINT IF EXISTS {};\n", table, constraint)
}
