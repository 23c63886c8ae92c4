//! Declared schema metadata.
//!
//! Record types declare their table layout as `const` data
//! ([`Record::COLUMNS`](crate::repository::Record::COLUMNS)). This module
//! defines those building blocks and a [`SchemaRegistry`] that exposes the
//! full set of declared tables, read-only, to the migration collaborator.
//! Diff generation and SQL planning are the migration engine's problem; this
//! crate only hands over the metadata.

use serde::Serialize;

use crate::repository::Record;

/// Logical column type, rendered to a SQLite storage class in DDL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Boolean,
    /// Stored as RFC 3339 text.
    Timestamp,
    /// Stored as serialized JSON text.
    Json,
}

impl ColumnType {
    /// SQLite column type keyword for DDL rendering.
    pub fn sql(self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text | ColumnType::Timestamp | ColumnType::Json => "TEXT",
            ColumnType::Boolean => "BOOLEAN",
        }
    }
}

/// A single column declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ColumnDef {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
    pub unique: bool,
}

impl ColumnDef {
    /// A non-nullable column with no constraints.
    pub const fn new(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            nullable: false,
            primary_key: false,
            unique: false,
        }
    }

    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub const fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    fn render(&self) -> String {
        let mut sql = format!("{} {}", self.name, self.ty.sql());
        if self.primary_key {
            sql.push_str(" PRIMARY KEY");
            if self.ty == ColumnType::Integer {
                // Integer primary keys alias the rowid, giving
                // auto-generated ids in insertion order.
                sql.push_str(" AUTOINCREMENT");
            }
        } else if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if self.unique {
            sql.push_str(" UNIQUE");
        }
        sql
    }
}

/// Full declaration of one table.
#[derive(Debug, Clone, Serialize)]
pub struct TableDef {
    pub name: &'static str,
    pub columns: &'static [ColumnDef],
}

impl TableDef {
    /// Find a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Render a `CREATE TABLE` statement for this declaration.
    pub fn create_sql(&self) -> String {
        let cols: Vec<String> = self.columns.iter().map(ColumnDef::render).collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n);",
            self.name,
            cols.join(",\n    ")
        )
    }

    /// Render the matching `DROP TABLE` statement.
    pub fn drop_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS {};", self.name)
    }
}

/// The set of record types declared by the application.
///
/// Register every [`Record`] type once at startup; the registry is then the
/// read-only schema surface handed to the migration runner for skeleton
/// generation and to any external diffing tool.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    tables: Vec<TableDef>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self { tables: Vec::new() }
    }

    /// Register a record type. Re-registering the same table is a no-op.
    pub fn register<T: Record>(&mut self) {
        if self.tables.iter().any(|t| t.name == T::TABLE) {
            return;
        }
        self.tables.push(TableDef {
            name: T::TABLE,
            columns: T::COLUMNS,
        });
    }

    /// All declared tables, in registration order.
    pub fn tables(&self) -> &[TableDef] {
        &self.tables
    }

    /// Look up one table's declaration.
    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Render `CREATE TABLE` DDL for every declared table.
    pub fn ddl(&self) -> String {
        let stmts: Vec<String> = self.tables.iter().map(TableDef::create_sql).collect();
        stmts.join("\n\n")
    }
}
