//! Table schema definitions
//!
//! The in-memory table description consumed by the snapshot step. Tables are
//! assembled with [`TableSchema::builder`], which validates everything at
//! `build()` and returns the first problem it finds.

use crate::error::{invalid_schema, unknown_value, MigrateError, MigrateResult};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// PostgreSQL identifiers accepted for tables, columns, indexes and constraints
static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("identifier regex is valid"));

/// PostgreSQL keywords that cannot name a table or column without quoting.
/// Generated SQL never quotes identifiers, so these are rejected up front.
static RESERVED_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "all", "analyse", "analyze", "and", "any", "array", "as", "asc", "asymmetric",
        "authorization", "binary", "both", "case", "cast", "check", "collate", "collation",
        "column", "concurrently", "constraint", "create", "cross", "current_catalog",
        "current_date", "current_role", "current_schema", "current_time", "current_timestamp",
        "current_user", "default", "deferrable", "desc", "distinct", "do", "else", "end",
        "except", "false", "fetch", "for", "foreign", "freeze", "from", "full", "grant", "group",
        "having", "ilike", "in", "initially", "inner", "intersect", "into", "is", "isnull",
        "join", "lateral", "leading", "left", "like", "limit", "localtime", "localtimestamp",
        "natural", "not", "notnull", "null", "offset", "on", "only", "or", "order", "outer",
        "overlaps", "placing", "primary", "references", "returning", "right", "select",
        "session_user", "similar", "some", "symmetric", "system_user", "table", "tablesample",
        "then", "to", "trailing", "true", "union", "unique", "user", "using", "variadic",
        "verbose", "when", "where", "window", "with",
    ]
    .into_iter()
    .collect()
});

/// Declares an enum together with its stable text encoding.
///
/// Each variant is listed exactly once, so `as_str` and `FromStr` cannot drift
/// apart and adding a variant without a tag fails to compile.
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $tag:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Every variant, in declaration order
            pub const ALL: &'static [$name] = &[$( $name::$variant ),+];

            /// Stable tag written into snapshot files
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $tag ),+
                }
            }
        }

        impl FromStr for $name {
            type Err = MigrateError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $tag => Ok($name::$variant), )+
                    other => Err(unknown_value($kind, other)),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum! {
    /// Column data types
    FieldType, "field type" {
        Uuid => "uuid",
        Text => "text",
        Integer => "integer",
        BigInt => "bigint",
        SmallInt => "smallint",
        Boolean => "boolean",
        Real => "real",
        Double => "double",
        Numeric => "numeric",
        Timestamp => "timestamp",
        TimestampTz => "timestamptz",
        Date => "date",
        Time => "time",
        Json => "json",
        Jsonb => "jsonb",
        Bytea => "bytea",
    }
}

impl FieldType {
    /// PostgreSQL spelling used in DDL
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldType::Uuid => "UUID",
            FieldType::Text => "TEXT",
            FieldType::Integer => "INTEGER",
            FieldType::BigInt => "BIGINT",
            FieldType::SmallInt => "SMALLINT",
            FieldType::Boolean => "BOOLEAN",
            FieldType::Real => "REAL",
            FieldType::Double => "DOUBLE PRECISION",
            FieldType::Numeric => "NUMERIC",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::TimestampTz => "TIMESTAMPTZ",
            FieldType::Date => "DATE",
            FieldType::Time => "TIME",
            FieldType::Json => "JSON",
            FieldType::Jsonb => "JSONB",
            FieldType::Bytea => "BYTEA",
        }
    }

    fn is_integer(&self) -> bool {
        matches!(self, FieldType::Integer | FieldType::BigInt | FieldType::SmallInt)
    }

    fn is_temporal(&self) -> bool {
        matches!(
            self,
            FieldType::Timestamp | FieldType::TimestampTz | FieldType::Date | FieldType::Time
        )
    }
}

string_enum! {
    /// How the database fills a column when no value is supplied
    AutoGenerate, "auto-generate type" {
        None => "none",
        Uuid => "uuid",
        Timestamp => "timestamp",
        Increments => "increments",
    }
}

string_enum! {
    /// Cardinality of a relationship
    RelationshipType, "relationship type" {
        ManyToOne => "many_to_one",
        OneToMany => "one_to_many",
        OneToOne => "one_to_one",
        ManyToMany => "many_to_many",
    }
}

impl RelationshipType {
    /// Only these kinds place a foreign-key constraint on the declaring table
    pub fn carries_constraint(&self) -> bool {
        matches!(self, RelationshipType::ManyToOne | RelationshipType::OneToOne)
    }
}

string_enum! {
    /// ON DELETE / ON UPDATE behaviour of a foreign key
    ReferentialAction, "referential action" {
        Cascade => "cascade",
        SetNull => "set_null",
        SetDefault => "set_default",
        Restrict => "restrict",
        NoAction => "no_action",
    }
}

impl ReferentialAction {
    pub fn sql(&self) -> &'static str {
        match self {
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::SetDefault => "SET DEFAULT",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::NoAction => "NO ACTION",
        }
    }
}

/// Column definition
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    pub primary_key: bool,
    pub unique: bool,
    pub not_null: bool,
    pub default_value: Option<String>,
    pub auto_generate: AutoGenerate,
}

impl Field {
    /// A NOT NULL column with no default
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            primary_key: false,
            unique: false,
            not_null: true,
            default_value: None,
            auto_generate: AutoGenerate::None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.not_null = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.not_null = false;
        self
    }

    /// Raw SQL default expression, written verbatim after `DEFAULT`
    pub fn default_value(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn auto_generate(mut self, kind: AutoGenerate) -> Self {
        self.auto_generate = kind;
        self
    }

    pub fn is_auto_generated(&self) -> bool {
        self.auto_generate != AutoGenerate::None
    }
}

/// Index definition; column order is part of its identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

impl Index {
    pub fn new<S: AsRef<str>>(name: impl Into<String>, columns: &[S]) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| c.as_ref().to_string()).collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Foreign-key style relationship declared on this table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub name: String,
    pub column: String,
    pub references_table: String,
    pub references_column: String,
    pub relationship_type: RelationshipType,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
}

impl Relationship {
    /// A many-to-one link with `NO ACTION` on both delete and update
    pub fn new(
        name: impl Into<String>,
        column: impl Into<String>,
        references_table: impl Into<String>,
        references_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            column: column.into(),
            references_table: references_table.into(),
            references_column: references_column.into(),
            relationship_type: RelationshipType::ManyToOne,
            on_delete: ReferentialAction::NoAction,
            on_update: ReferentialAction::NoAction,
        }
    }

    pub fn kind(mut self, relationship_type: RelationshipType) -> Self {
        self.relationship_type = relationship_type;
        self
    }

    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        self.on_delete = action;
        self
    }

    pub fn on_update(mut self, action: ReferentialAction) -> Self {
        self.on_update = action;
        self
    }
}

/// Metadata-only one-to-many link; the foreign key lives on `table`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HasMany {
    pub name: String,
    pub table: String,
    pub foreign_key: String,
}

impl HasMany {
    pub fn new(
        name: impl Into<String>,
        table: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            foreign_key: foreign_key.into(),
        }
    }
}

/// Declared table
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableSchema {
    pub name: String,
    pub fields: Vec<Field>,
    /// In-place overrides of fields declared earlier
    pub alters: Vec<Field>,
    pub indexes: Vec<Index>,
    /// Names of indexes to leave out of the table
    pub drop_indexes: Vec<String>,
    pub relationships: Vec<Relationship>,
    pub has_many: Vec<HasMany>,
}

impl TableSchema {
    pub fn builder(name: impl Into<String>) -> TableSchemaBuilder {
        TableSchemaBuilder {
            table: TableSchema {
                name: name.into(),
                ..Default::default()
            },
        }
    }

    /// Fields after applying alters, in declaration order
    pub fn effective_fields(&self) -> Vec<Field> {
        self.fields
            .iter()
            .map(|field| {
                self.alters
                    .iter()
                    .rev()
                    .find(|alter| alter.name == field.name)
                    .unwrap_or(field)
                    .clone()
            })
            .collect()
    }

    /// Indexes minus the ones named in `drop_indexes`
    pub fn effective_indexes(&self) -> Vec<Index> {
        self.indexes
            .iter()
            .filter(|idx| !self.drop_indexes.contains(&idx.name))
            .cloned()
            .collect()
    }

    /// Check identifiers, uniqueness and cross references
    pub fn validate(&self) -> MigrateResult<()> {
        validate_identifier("table", &self.name)?;

        let mut field_names = HashSet::new();
        for field in &self.fields {
            validate_identifier("field", &field.name)?;
            if !field_names.insert(field.name.as_str()) {
                return Err(invalid_schema(format!(
                    "duplicate field '{}' in table '{}'",
                    field.name, self.name
                )));
            }
        }

        for alter in &self.alters {
            if !field_names.contains(alter.name.as_str()) {
                return Err(invalid_schema(format!(
                    "alter targets unknown field '{}' in table '{}'",
                    alter.name, self.name
                )));
            }
        }

        for field in self.effective_fields() {
            validate_auto_generate(&self.name, &field)?;
        }

        let mut index_names = HashSet::new();
        for index in &self.indexes {
            validate_identifier("index", &index.name)?;
            if !index_names.insert(index.name.as_str()) {
                return Err(invalid_schema(format!(
                    "duplicate index '{}' in table '{}'",
                    index.name, self.name
                )));
            }
            if index.columns.is_empty() {
                return Err(invalid_schema(format!("index '{}' has no columns", index.name)));
            }
            for column in &index.columns {
                if !field_names.contains(column.as_str()) {
                    return Err(invalid_schema(format!(
                        "index '{}' references unknown column '{}'",
                        index.name, column
                    )));
                }
            }
        }

        for name in &self.drop_indexes {
            if !index_names.contains(name.as_str()) {
                return Err(invalid_schema(format!(
                    "drop_index targets unknown index '{}' in table '{}'",
                    name, self.name
                )));
            }
        }

        let mut relationship_names = HashSet::new();
        for rel in &self.relationships {
            validate_identifier("relationship", &rel.name)?;
            validate_identifier("table", &rel.references_table)?;
            validate_identifier("column", &rel.references_column)?;
            if !relationship_names.insert(rel.name.as_str()) {
                return Err(invalid_schema(format!(
                    "duplicate relationship '{}' in table '{}'",
                    rel.name, self.name
                )));
            }
            if rel.relationship_type.carries_constraint()
                && !field_names.contains(rel.column.as_str())
            {
                return Err(invalid_schema(format!(
                    "relationship '{}' uses unknown column '{}'",
                    rel.name, rel.column
                )));
            }
        }

        Ok(())
    }
}

/// Chained builder for [`TableSchema`]
#[derive(Debug, Clone)]
pub struct TableSchemaBuilder {
    table: TableSchema,
}

impl TableSchemaBuilder {
    pub fn field(mut self, field: Field) -> Self {
        self.table.fields.push(field);
        self
    }

    pub fn alter(mut self, field: Field) -> Self {
        self.table.alters.push(field);
        self
    }

    pub fn index(mut self, index: Index) -> Self {
        self.table.indexes.push(index);
        self
    }

    pub fn drop_index(mut self, name: impl Into<String>) -> Self {
        self.table.drop_indexes.push(name.into());
        self
    }

    pub fn relationship(mut self, relationship: Relationship) -> Self {
        self.table.relationships.push(relationship);
        self
    }

    pub fn has_many(mut self, has_many: HasMany) -> Self {
        self.table.has_many.push(has_many);
        self
    }

    pub fn build(self) -> MigrateResult<TableSchema> {
        self.table.validate()?;
        Ok(self.table)
    }
}

fn validate_identifier(what: &str, name: &str) -> MigrateResult<()> {
    if !IDENTIFIER.is_match(name) {
        return Err(invalid_schema(format!("invalid {} name '{}'", what, name)));
    }
    if RESERVED_WORDS.contains(name.to_ascii_lowercase().as_str()) {
        return Err(invalid_schema(format!(
            "{} name '{}' is a reserved SQL keyword",
            what, name
        )));
    }
    Ok(())
}

fn validate_auto_generate(table: &str, field: &Field) -> MigrateResult<()> {
    let compatible = match field.auto_generate {
        AutoGenerate::None => true,
        AutoGenerate::Uuid => field.field_type == FieldType::Uuid,
        AutoGenerate::Increments => field.field_type.is_integer(),
        AutoGenerate::Timestamp => field.field_type.is_temporal(),
    };

    if compatible {
        Ok(())
    } else {
        Err(invalid_schema(format!(
            "field '{}.{}' of type {} cannot be auto-generated as {}",
            table, field.name, field.field_type, field.auto_generate
        )))
    }
}
