//! Incremental migration file generator
//!
//! Walks a [`SchemaDiff`] and writes one up/down file pair per atomic change:
//! a whole table, a field, an index or a relationship. Files are named
//! `<timestamp>_<name>.sql` / `<timestamp>_<name>_down.sql`, where timestamps
//! come from a [`TimestampSequence`] so every pair sorts after the previous one.

use crate::error::{MigrateError, MigrateResult};
use crate::migration::{parse_timestamp, sql, DOWN_SUFFIX, SQL_EXTENSION};
use crate::snapshot::{
    ChangeType, FieldChange, IndexChange, IndexSnapshot, RelationshipChange, SchemaDiff,
    TableChange, TableSnapshot,
};
use chrono::Utc;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Kind of atomic change a migration implements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationKind {
    CreateTable,
    DropTable,
    AddColumn,
    DropColumn,
    AlterColumn,
    AddIndex,
    DropIndex,
    AlterIndex,
    AddForeignKey,
    DropForeignKey,
    AlterForeignKey,
}

impl MigrationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationKind::CreateTable => "create_table",
            MigrationKind::DropTable => "drop_table",
            MigrationKind::AddColumn => "add_column",
            MigrationKind::DropColumn => "drop_column",
            MigrationKind::AlterColumn => "alter_column",
            MigrationKind::AddIndex => "add_index",
            MigrationKind::DropIndex => "drop_index",
            MigrationKind::AlterIndex => "alter_index",
            MigrationKind::AddForeignKey => "add_fk",
            MigrationKind::DropForeignKey => "drop_fk",
            MigrationKind::AlterForeignKey => "alter_fk",
        }
    }
}

/// Generation policy knobs
#[derive(Debug, Clone, Copy, Default)]
pub struct GeneratorOptions {
    /// Refuse to generate a NOT NULL column addition that has no default
    /// instead of emitting a warning comment
    pub strict_not_null: bool,
}

/// One planned migration, not yet written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationScript {
    /// Deterministic name without timestamp, e.g. `users_add_column_email`
    pub name: String,
    pub table: String,
    pub kind: MigrationKind,
    pub up_sql: String,
    pub down_sql: String,
}

impl MigrationScript {
    fn header(&self, title: &str) -> String {
        format!(
            "-- {}: {}\n-- Table: {}\n-- Type: {}\n\n",
            title,
            self.name,
            self.table,
            self.kind.as_str()
        )
    }

    pub fn up_file_contents(&self) -> String {
        format!("{}{}", self.header("Migration"), self.up_sql)
    }

    pub fn down_file_contents(&self) -> String {
        format!("{}{}", self.header("Rollback"), self.down_sql)
    }
}

/// A migration pair written to disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedMigration {
    /// File stem of the up file, `<timestamp>_<name>`; this is the name the
    /// runner records once applied
    pub name: String,
    pub table: String,
    pub kind: MigrationKind,
    pub up_file: String,
    pub down_file: String,
}

/// Strictly increasing filename timestamps for one generation run
#[derive(Debug, Clone)]
pub struct TimestampSequence {
    next: i64,
}

impl TimestampSequence {
    pub fn starting_at(base: i64) -> Self {
        Self { next: base }
    }

    pub fn next_timestamp(&mut self) -> i64 {
        let ts = self.next;
        self.next += 1;
        ts
    }
}

/// Writes migration file pairs into a directory
#[derive(Debug, Clone)]
pub struct MigrationGenerator {
    output_dir: PathBuf,
    options: GeneratorOptions,
}

impl MigrationGenerator {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            options: GeneratorOptions::default(),
        }
    }

    pub fn with_options(mut self, options: GeneratorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Write migrations for `diff`, timestamped from the current wall clock
    pub async fn generate(&self, diff: &SchemaDiff) -> MigrateResult<Vec<GeneratedMigration>> {
        self.generate_at(diff, Utc::now().timestamp()).await
    }

    /// Write migrations for `diff`, numbering files from `base_timestamp`.
    ///
    /// The base is raised above any timestamp already present in the output
    /// directory. Nothing is written if planning fails, and a failed write
    /// removes the pairs this call already wrote.
    pub async fn generate_at(
        &self,
        diff: &SchemaDiff,
        base_timestamp: i64,
    ) -> MigrateResult<Vec<GeneratedMigration>> {
        if !diff.has_changes() {
            debug!("No schema changes, nothing to generate");
            return Ok(Vec::new());
        }

        let scripts = plan(diff, &self.options)?;

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let base = match self.latest_timestamp().await? {
            Some(latest) if latest >= base_timestamp => latest + 1,
            _ => base_timestamp,
        };
        let mut sequence = TimestampSequence::starting_at(base);

        let mut generated = Vec::with_capacity(scripts.len());
        for script in scripts {
            let stem = format!("{}_{}", sequence.next_timestamp(), script.name);
            let migration = GeneratedMigration {
                up_file: format!("{}{}", stem, SQL_EXTENSION),
                down_file: format!("{}{}", stem, DOWN_SUFFIX),
                name: stem,
                table: script.table.clone(),
                kind: script.kind,
            };

            match self.write_pair(&migration, &script).await {
                Ok(()) => {
                    info!("Generated migration {}", migration.up_file);
                    generated.push(migration);
                }
                Err(e) => {
                    generated.push(migration);
                    self.discard(&generated).await;
                    return Err(e);
                }
            }
        }

        Ok(generated)
    }

    async fn write_pair(
        &self,
        migration: &GeneratedMigration,
        script: &MigrationScript,
    ) -> MigrateResult<()> {
        tokio::fs::write(self.output_dir.join(&migration.up_file), script.up_file_contents()).await?;
        tokio::fs::write(self.output_dir.join(&migration.down_file), script.down_file_contents())
            .await?;
        Ok(())
    }

    /// Remove the file pairs of `migrations` from the output directory.
    ///
    /// Used to undo a run that could not complete; files already gone are ignored.
    pub async fn discard(&self, migrations: &[GeneratedMigration]) {
        for migration in migrations {
            for file in [&migration.up_file, &migration.down_file] {
                match tokio::fs::remove_file(self.output_dir.join(file)).await {
                    Ok(()) => debug!("Removed {}", file),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!("Failed to remove {}: {}", file, e),
                }
            }
        }
    }

    /// Highest timestamp prefix among existing `.sql` files
    async fn latest_timestamp(&self) -> MigrateResult<Option<i64>> {
        let mut entries = tokio::fs::read_dir(&self.output_dir).await?;
        let mut latest = None;

        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if !name.ends_with(SQL_EXTENSION) {
                continue;
            }
            if let Some(ts) = parse_timestamp(name) {
                latest = latest.max(Some(ts));
            }
        }

        Ok(latest)
    }
}

/// Turn a diff into ordered migration scripts without touching the filesystem.
///
/// Order: added tables (referenced tables first), then modified tables in
/// diff order, then foreign keys of added tables that could not go into their
/// create script, then removed tables.
pub fn plan(diff: &SchemaDiff, options: &GeneratorOptions) -> MigrateResult<Vec<MigrationScript>> {
    let mut scripts = Vec::new();

    let added: Vec<&TableSnapshot> = diff
        .table_changes
        .iter()
        .filter(|tc| tc.change_type == ChangeType::Add)
        .filter_map(|tc| tc.new_table.as_ref())
        .collect();
    let modified = diff
        .table_changes
        .iter()
        .filter(|tc| tc.change_type == ChangeType::Modify);

    // Tables whose final shape is not in place until later in the run
    let mut unsettled: HashSet<&str> = added.iter().map(|t| t.name.as_str()).collect();
    unsettled.extend(modified.clone().map(|tc| tc.table_name.as_str()));

    let mut deferred_fks = Vec::new();
    for table in order_by_dependencies(&added)? {
        scripts.push(create_table_script(table, &unsettled, &mut deferred_fks)?);
        unsettled.remove(table.name.as_str());
    }

    for tc in modified {
        modify_table_scripts(tc, options, &mut scripts)?;
    }

    scripts.append(&mut deferred_fks);

    for tc in diff
        .table_changes
        .iter()
        .filter(|tc| tc.change_type == ChangeType::Remove)
    {
        scripts.push(drop_table_script(tc)?);
    }

    Ok(scripts)
}

/// Stable dependency order: a table comes after the added tables it references.
/// Cycles fall back to declaration order.
fn order_by_dependencies<'a>(tables: &[&'a TableSnapshot]) -> MigrateResult<Vec<&'a TableSnapshot>> {
    let names: HashSet<&str> = tables.iter().map(|t| t.name.as_str()).collect();

    let mut deps: Vec<HashSet<&str>> = Vec::with_capacity(tables.len());
    for table in tables {
        let mut refs = HashSet::new();
        for rel in &table.relationships {
            let target = rel.references_table.as_str();
            if rel.carries_constraint()? && target != table.name && names.contains(target) {
                refs.insert(target);
            }
        }
        deps.push(refs);
    }

    let mut ordered: Vec<&TableSnapshot> = Vec::with_capacity(tables.len());
    let mut placed: HashSet<&str> = HashSet::new();
    let mut remaining: Vec<usize> = (0..tables.len()).collect();

    while !remaining.is_empty() {
        let pos = remaining
            .iter()
            .position(|&i| deps[i].iter().all(|d| placed.contains(d)))
            .unwrap_or(0);
        let i = remaining.remove(pos);
        placed.insert(tables[i].name.as_str());
        ordered.push(tables[i]);
    }

    Ok(ordered)
}

/// Constraints that reference an unsettled table other than `table` itself
/// are pushed to `deferred` as standalone scripts.
fn create_table_script(
    table: &TableSnapshot,
    unsettled: &HashSet<&str>,
    deferred: &mut Vec<MigrationScript>,
) -> MigrateResult<MigrationScript> {
    let mut up = sql::create_table(table)?;
    for index in &table.indexes {
        up.push_str(&sql::create_index(&table.name, index));
    }
    for rel in &table.relationships {
        let Some(fk) = sql::add_foreign_key(&table.name, rel)? else {
            continue;
        };
        let target = rel.references_table.as_str();
        if target == table.name || !unsettled.contains(target) {
            up.push_str(&fk);
        } else {
            debug!(
                "Deferring {}.{} until {} is in place",
                table.name, rel.name, target
            );
            deferred.push(MigrationScript {
                name: format!("{}_{}_{}", table.name, MigrationKind::AddForeignKey.as_str(), rel.column),
                table: table.name.clone(),
                kind: MigrationKind::AddForeignKey,
                up_sql: fk,
                down_sql: sql::drop_foreign_key(&table.name, &rel.name),
            });
        }
    }

    Ok(MigrationScript {
        name: format!("create_{}", table.name),
        table: table.name.clone(),
        kind: MigrationKind::CreateTable,
        up_sql: up,
        down_sql: sql::drop_table(&table.name),
    })
}

fn drop_table_script(tc: &TableChange) -> MigrateResult<MigrationScript> {
    let down = match &tc.old_table {
        Some(old) => sql::create_table(old)?,
        None => format!("-- Previous definition of {} unavailable\n", tc.table_name),
    };

    Ok(MigrationScript {
        name: format!("drop_{}", tc.table_name),
        table: tc.table_name.clone(),
        kind: MigrationKind::DropTable,
        up_sql: sql::drop_table(&tc.table_name),
        down_sql: down,
    })
}

fn modify_table_scripts(
    tc: &TableChange,
    options: &GeneratorOptions,
    scripts: &mut Vec<MigrationScript>,
) -> MigrateResult<()> {
    for fc in &tc.field_changes {
        scripts.push(field_script(&tc.table_name, fc, options)?);
    }
    for ic in &tc.index_changes {
        scripts.push(index_script(&tc.table_name, ic)?);
    }
    for rc in &tc.relationship_changes {
        if let Some(script) = relationship_script(&tc.table_name, rc)? {
            scripts.push(script);
        }
    }
    Ok(())
}

fn missing(what: &str, table: &str, name: &str) -> MigrateError {
    MigrateError::InvalidSchema(format!("diff for {}.{} is missing its {}", table, name, what))
}

fn field_script(
    table: &str,
    fc: &FieldChange,
    options: &GeneratorOptions,
) -> MigrateResult<MigrationScript> {
    let name = &fc.field_name;
    let (kind, up, down) = match fc.change_type {
        ChangeType::Add => {
            let new = fc.new_field.as_ref().ok_or_else(|| missing("new field", table, name))?;
            if sql::needs_manual_default(new)? {
                if options.strict_not_null {
                    return Err(MigrateError::UnsafeMigration(format!(
                        "column {}.{} is NOT NULL without a default",
                        table, name
                    )));
                }
                warn!(
                    "Column {}.{} is NOT NULL without a default; review the generated migration",
                    table, name
                );
            }
            (MigrationKind::AddColumn, sql::add_column(table, new)?, sql::drop_column(table, name))
        }
        ChangeType::Remove => {
            let old = fc.old_field.as_ref().ok_or_else(|| missing("old field", table, name))?;
            (MigrationKind::DropColumn, sql::drop_column(table, name), sql::add_column(table, old)?)
        }
        ChangeType::Modify => {
            let old = fc.old_field.as_ref().ok_or_else(|| missing("old field", table, name))?;
            let new = fc.new_field.as_ref().ok_or_else(|| missing("new field", table, name))?;
            (
                MigrationKind::AlterColumn,
                sql::alter_column(table, old, new)?,
                sql::alter_column(table, new, old)?,
            )
        }
    };

    Ok(MigrationScript {
        name: format!("{}_{}_{}", table, kind.as_str(), name),
        table: table.to_string(),
        kind,
        up_sql: up,
        down_sql: down,
    })
}

fn index_script(table: &str, ic: &IndexChange) -> MigrateResult<MigrationScript> {
    let name = &ic.index_name;
    let new_index = || ic.new_index.as_ref().ok_or_else(|| missing("new index", table, name));
    let old_index = || ic.old_index.as_ref().ok_or_else(|| missing("old index", table, name));
    let recreate =
        |index: &IndexSnapshot| format!("{}{}", sql::drop_index(name), sql::create_index(table, index));

    let (kind, up, down) = match ic.change_type {
        ChangeType::Add => (
            MigrationKind::AddIndex,
            sql::create_index(table, new_index()?),
            sql::drop_index(name),
        ),
        ChangeType::Remove => (
            MigrationKind::DropIndex,
            sql::drop_index(name),
            sql::create_index(table, old_index()?),
        ),
        ChangeType::Modify => (
            MigrationKind::AlterIndex,
            recreate(new_index()?),
            recreate(old_index()?),
        ),
    };

    Ok(MigrationScript {
        name: format!("{}_{}_{}", table, kind.as_str(), name),
        table: table.to_string(),
        kind,
        up_sql: up,
        down_sql: down,
    })
}

/// `None` when neither side of the change owns a constraint
fn relationship_script(
    table: &str,
    rc: &RelationshipChange,
) -> MigrateResult<Option<MigrationScript>> {
    let old_fk = match &rc.old_relationship {
        Some(rel) => sql::add_foreign_key(table, rel)?,
        None => None,
    };
    let new_fk = match &rc.new_relationship {
        Some(rel) => sql::add_foreign_key(table, rel)?,
        None => None,
    };

    let name = &rc.relationship_name;
    let drop = || sql::drop_foreign_key(table, name);

    let (kind, suffix, up, down) = match (rc.change_type, old_fk, new_fk) {
        (ChangeType::Add, _, Some(add)) => {
            let column = rc
                .new_relationship
                .as_ref()
                .map(|r| r.column.clone())
                .unwrap_or_else(|| name.clone());
            (MigrationKind::AddForeignKey, column, add, drop())
        }
        (ChangeType::Remove, Some(restore), _) => {
            (MigrationKind::DropForeignKey, name.clone(), drop(), restore)
        }
        (ChangeType::Modify, old_fk, new_fk) if old_fk.is_some() || new_fk.is_some() => {
            let up = format!(
                "{}{}",
                old_fk.as_ref().map(|_| drop()).unwrap_or_default(),
                new_fk.as_deref().unwrap_or_default()
            );
            let down = format!(
                "{}{}",
                new_fk.as_ref().map(|_| drop()).unwrap_or_default(),
                old_fk.as_deref().unwrap_or_default()
            );
            (MigrationKind::AlterForeignKey, name.clone(), up, down)
        }
        _ => {
            debug!("Relationship {}.{} carries no constraint, skipping", table, name);
            return Ok(None);
        }
    };

    Ok(Some(MigrationScript {
        name: format!("{}_{}_{}", table, kind.as_str(), suffix),
        table: table.to_string(),
        kind,
        up_sql: up,
        down_sql: down,
    }))
}
