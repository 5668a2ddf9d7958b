//! Tabular bulk-data service.
//!
//! The service manages named tables with fixed column schemas.
//! Each table has a catalog entry in `TableCatalog` and its column descriptors in `TableColumns`.
//! The rows live in a physical table `Bulk_<id>` keyed by a dense 0-based row number.
//!
//! Column kinds are fixed-width byte strings, 64-bit integers, 64-bit floats, and booleans.
//! Fixed-width strings follow HDF5 semantics: values longer than the width are refused,
//! and trailing NUL bytes are not stored.

use super::selector::Selector;
use crate::error::BackendContext;
use crate::{KBError, Result};

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};

use tracing::debug;

//-----------------------------------------------------------------------------

/// Kind of a column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnKind {
    /// Fixed-width byte string with the given width in bytes.
    String(usize),
    /// Signed 64-bit integer.
    Long,
    /// 64-bit float.
    Float,
    /// Boolean.
    Bool,
}

impl ColumnKind {
    fn code(&self) -> &'static str {
        match self {
            ColumnKind::String(_) => "string",
            ColumnKind::Long => "long",
            ColumnKind::Float => "float",
            ColumnKind::Bool => "bool",
        }
    }

    fn width(&self) -> usize {
        match self {
            ColumnKind::String(width) => *width,
            _ => 0,
        }
    }

    fn from_code(code: &str, width: usize) -> Option<Self> {
        match code {
            "string" => Some(ColumnKind::String(width)),
            "long" => Some(ColumnKind::Long),
            "float" => Some(ColumnKind::Float),
            "bool" => Some(ColumnKind::Bool),
            _ => None,
        }
    }

    fn sql_type(&self) -> &'static str {
        match self {
            ColumnKind::String(_) => "BLOB",
            ColumnKind::Long | ColumnKind::Bool => "INTEGER",
            ColumnKind::Float => "REAL",
        }
    }
}

/// A column descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
    pub description: String,
}

impl Column {
    /// Creates a fixed-width string column.
    pub fn string(name: &str, width: usize, description: &str) -> Self {
        Column { name: name.to_string(), kind: ColumnKind::String(width), description: description.to_string() }
    }

    /// Creates an integer column.
    pub fn long(name: &str, description: &str) -> Self {
        Column { name: name.to_string(), kind: ColumnKind::Long, description: description.to_string() }
    }

    /// Creates a float column.
    pub fn float(name: &str, description: &str) -> Self {
        Column { name: name.to_string(), kind: ColumnKind::Float, description: description.to_string() }
    }

    /// Creates a boolean column.
    pub fn bool(name: &str, description: &str) -> Self {
        Column { name: name.to_string(), kind: ColumnKind::Bool, description: description.to_string() }
    }
}

/// An ordered list of columns.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableSchema {
    pub columns: Vec<Column>,
}

impl TableSchema {
    /// Creates a schema from the columns.
    pub fn new(columns: Vec<Column>) -> Self {
        TableSchema { columns }
    }

    /// Returns the position and the descriptor of the named column.
    pub fn column(&self, name: &str) -> Option<(usize, &Column)> {
        self.columns.iter().enumerate().find(|(_, column)| column.name == name)
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns `true` if there are no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(KBError::Invariant(String::from("a table needs at least one column")));
        }
        for (i, column) in self.columns.iter().enumerate() {
            if !is_valid_column_name(&column.name) {
                return Err(KBError::Invariant(format!("invalid column name {:?}", column.name)));
            }
            if self.columns[..i].iter().any(|x| x.name == column.name) {
                return Err(KBError::Invariant(format!("duplicate column name {}", column.name)));
            }
            if column.kind == ColumnKind::String(0) {
                return Err(KBError::Invariant(format!("string column {} has zero width", column.name)));
            }
        }
        Ok(())
    }
}

/// Returns `true` if the name can be used as a column name.
pub fn is_valid_column_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {},
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn trim_nuls(bytes: &[u8]) -> &[u8] {
    let mut end = bytes.len();
    while end > 0 && bytes[end - 1] == 0 {
        end -= 1;
    }
    &bytes[..end]
}

//-----------------------------------------------------------------------------

/// A value in a table cell.
#[derive(Clone, Debug, PartialEq)]
pub enum Cell {
    Bytes(Vec<u8>),
    Long(i64),
    Float(f64),
    Bool(bool),
}

impl Cell {
    /// Creates a string cell.
    pub fn str(value: &str) -> Self {
        Cell::Bytes(value.as_bytes().to_vec())
    }

    /// Returns the bytes of a string cell.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Cell::Bytes(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the value of an integer cell.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Cell::Long(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the value of a float cell.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Cell::Float(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the value of a boolean cell.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Cell::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Consumes a string cell and returns it as UTF-8 text.
    pub fn into_string(self) -> Result<String> {
        match self {
            Cell::Bytes(value) => String::from_utf8(value).map_err(|x| {
                KBError::Invariant(format!("string cell is not valid UTF-8: {}", x))
            }),
            _ => Err(KBError::Invariant(format!("expected a string cell, got {:?}", self))),
        }
    }

    fn matches(&self, kind: ColumnKind) -> bool {
        matches!(
            (self, kind),
            (Cell::Bytes(_), ColumnKind::String(_)) | (Cell::Long(_), ColumnKind::Long) |
            (Cell::Float(_), ColumnKind::Float) | (Cell::Bool(_), ColumnKind::Bool)
        )
    }

    fn to_sql(&self) -> SqlValue {
        match self {
            Cell::Bytes(value) => SqlValue::Blob(trim_nuls(value).to_vec()),
            Cell::Long(value) => SqlValue::Integer(*value),
            Cell::Float(value) => SqlValue::Real(*value),
            Cell::Bool(value) => SqlValue::Integer(*value as i64),
        }
    }

    fn from_row(row: &Row, index: usize, kind: ColumnKind) -> rusqlite::Result<Self> {
        match kind {
            ColumnKind::String(_) => Ok(Cell::Bytes(row.get(index)?)),
            ColumnKind::Long => Ok(Cell::Long(row.get(index)?)),
            ColumnKind::Float => Ok(Cell::Float(row.get(index)?)),
            ColumnKind::Bool => Ok(Cell::Bool(row.get(index)?)),
        }
    }
}

//-----------------------------------------------------------------------------

/// A resolved table: catalog entry and column descriptors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Table {
    id: i64,
    name: String,
    schema: TableSchema,
}

impl Table {
    /// Returns the name of the table.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the column descriptors.
    pub fn columns(&self) -> &[Column] {
        &self.schema.columns
    }

    /// Returns the schema of the table.
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Returns the position and the descriptor of the named column.
    pub fn column(&self, name: &str) -> Option<(usize, &Column)> {
        self.schema.column(name)
    }

    /// Returns the width of the named string column.
    pub fn string_width(&self, name: &str) -> Option<usize> {
        match self.column(name)?.1.kind {
            ColumnKind::String(width) => Some(width),
            _ => None,
        }
    }

    fn physical(&self) -> String {
        format!("Bulk_{}", self.id)
    }

    fn column_list(&self) -> String {
        let names: Vec<String> = self.schema.columns.iter().map(|x| format!("\"{}\"", x.name)).collect();
        names.join(", ")
    }
}

//-----------------------------------------------------------------------------

/// Creates the catalog tables in a new backend database.
pub(crate) fn create_catalog(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute(
        "CREATE TABLE TableCatalog (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL
        ) STRICT",
        (),
    )?;
    connection.execute(
        "CREATE INDEX TableCatalogName ON TableCatalog(name)",
        (),
    )?;
    connection.execute(
        "CREATE TABLE TableColumns (
            table_id INTEGER NOT NULL,
            position INTEGER NOT NULL,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            width INTEGER NOT NULL,
            description TEXT NOT NULL,
            PRIMARY KEY (table_id, position)
        ) STRICT",
        (),
    )?;
    Ok(())
}

/// The tabular service of a session.
///
/// Every method runs within the session that created the service.
#[derive(Debug)]
pub struct TableService<'a> {
    connection: &'a mut Connection,
}

impl<'a> TableService<'a> {
    pub(crate) fn new(connection: &'a mut Connection) -> Self {
        TableService { connection }
    }

    /// Returns `true` if a table with the given name exists.
    pub fn table_exists(&mut self, name: &str) -> Result<bool> {
        let id: Option<i64> = self.connection.query_row(
            "SELECT id FROM TableCatalog WHERE name = ?1 LIMIT 1",
            (name,),
            |row| row.get(0)
        ).optional().context("looking up a table")?;
        Ok(id.is_some())
    }

    /// Creates a new table with the given name and schema.
    ///
    /// The catalog may contain several tables with the same name; see [`Self::create_if_missing`].
    pub fn create_table(&mut self, name: &str, schema: &TableSchema) -> Result<Table> {
        schema.validate()?;
        let transaction = self.connection.transaction().context("creating a table")?;
        transaction.execute(
            "INSERT INTO TableCatalog(name) VALUES (?1)",
            (name,),
        ).context("creating a catalog entry")?;
        let id = transaction.last_insert_rowid();
        {
            let mut insert = transaction.prepare(
                "INSERT INTO TableColumns(table_id, position, name, kind, width, description)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            ).context("creating column descriptors")?;
            for (position, column) in schema.columns.iter().enumerate() {
                insert.execute((
                    id, position, &column.name,
                    column.kind.code(), column.kind.width(), &column.description
                )).context("creating column descriptors")?;
            }
        }
        let table = Table { id, name: name.to_string(), schema: schema.clone() };
        let definitions: Vec<String> = schema.columns.iter().map(
            |x| format!("\"{}\" {} NOT NULL", x.name, x.kind.sql_type())
        ).collect();
        let sql = format!(
            "CREATE TABLE {} (_row INTEGER PRIMARY KEY, {}) STRICT",
            table.physical(), definitions.join(", ")
        );
        transaction.execute(&sql, ()).context("creating a physical table")?;
        transaction.commit().context("creating a table")?;
        debug!("Created table {} as {}", name, table.physical());
        Ok(table)
    }

    /// Creates the table if no table with the same name exists.
    ///
    /// Returns `true` if the table was created.
    /// An existing table is left unchanged even if its schema differs.
    pub fn create_if_missing(&mut self, name: &str, schema: &TableSchema) -> Result<bool> {
        if self.table_exists(name)? {
            return Ok(false);
        }
        self.create_table(name, schema)?;
        Ok(true)
    }

    /// Removes every catalog entry with the given name and returns the number of removed entries.
    ///
    /// Table ids are never reused.
    /// The physical rows stay in the backend file; reclaiming the space is an external concern.
    pub fn delete_table(&mut self, name: &str) -> Result<usize> {
        let transaction = self.connection.transaction().context("deleting a table")?;
        transaction.execute(
            "DELETE FROM TableColumns WHERE table_id IN (SELECT id FROM TableCatalog WHERE name = ?1)",
            (name,),
        ).context("deleting column descriptors")?;
        let removed = transaction.execute(
            "DELETE FROM TableCatalog WHERE name = ?1",
            (name,),
        ).context("deleting a table")?;
        transaction.commit().context("deleting a table")?;
        debug!("Removed {} catalog entries for table {}", removed, name);
        Ok(removed)
    }

    /// Resolves the table with the given name.
    ///
    /// If there are several tables with the same name, returns the most recent one.
    pub fn get_table(&mut self, name: &str) -> Result<Table> {
        let id: Option<i64> = self.connection.query_row(
            "SELECT id FROM TableCatalog WHERE name = ?1 ORDER BY id DESC LIMIT 1",
            (name,),
            |row| row.get(0)
        ).optional().context("resolving a table")?;
        let id = id.ok_or_else(|| KBError::MissingTable(name.to_string()))?;

        let mut statement = self.connection.prepare(
            "SELECT name, kind, width, description FROM TableColumns WHERE table_id = ?1 ORDER BY position"
        ).context("reading column descriptors")?;
        let mut rows = statement.query((id,)).context("reading column descriptors")?;
        let mut columns = Vec::new();
        while let Some(row) = rows.next().context("reading column descriptors")? {
            let column_name: String = row.get(0).context("reading column descriptors")?;
            let code: String = row.get(1).context("reading column descriptors")?;
            let width: usize = row.get(2).context("reading column descriptors")?;
            let description: String = row.get(3).context("reading column descriptors")?;
            let kind = ColumnKind::from_code(&code, width).ok_or_else(|| KBError::Invariant(
                format!("unknown column kind {} in table {}", code, name)
            ))?;
            columns.push(Column { name: column_name, kind, description });
        }
        Ok(Table { id, name: name.to_string(), schema: TableSchema::new(columns) })
    }

    /// Returns the number of rows in the table.
    pub fn nrows(&mut self, table: &Table) -> Result<usize> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.physical());
        self.connection.query_row(&sql, (), |row| row.get::<_, usize>(0)).context("counting rows")
    }

    // Checks that the row fits the schema of the table.
    fn check_row(table: &Table, row: &[Cell]) -> Result<()> {
        if row.len() != table.columns().len() {
            return Err(KBError::Invariant(format!(
                "expected {} values for table {}, got {}", table.columns().len(), table.name(), row.len()
            )));
        }
        for (cell, column) in row.iter().zip(table.columns()) {
            if !cell.matches(column.kind) {
                return Err(KBError::Invariant(format!(
                    "column {} of table {} expects a {} value, got {:?}",
                    column.name, table.name(), column.kind.code(), cell
                )));
            }
            if let (Cell::Bytes(value), ColumnKind::String(width)) = (cell, column.kind) {
                if value.len() > width {
                    return Err(KBError::Invariant(format!(
                        "value of length {} does not fit column {}({}) of table {}",
                        value.len(), column.name, width, table.name()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Appends the rows to the table in one transaction.
    ///
    /// Returns the number of rows in the table after the append.
    /// If any row does not fit the schema, nothing is appended.
    pub fn append(&mut self, table: &Table, rows: &[Vec<Cell>]) -> Result<usize> {
        for row in rows.iter() {
            Self::check_row(table, row)?;
        }
        let mut nrows = self.nrows(table)?;
        let placeholders = vec!["?"; table.columns().len() + 1].join(", ");
        let sql = format!(
            "INSERT INTO {}(_row, {}) VALUES ({})",
            table.physical(), table.column_list(), placeholders
        );
        let transaction = self.connection.transaction().context("appending rows")?;
        {
            let mut insert = transaction.prepare(&sql).context("appending rows")?;
            for row in rows.iter() {
                let mut values = Vec::with_capacity(row.len() + 1);
                values.push(SqlValue::Integer(nrows as i64));
                values.extend(row.iter().map(|x| x.to_sql()));
                insert.execute(params_from_iter(values)).context("appending rows")?;
                nrows += 1;
            }
        }
        transaction.commit().context("appending rows")?;
        Ok(nrows)
    }

    // Runs a query returning full rows in row order.
    fn query_rows(&mut self, table: &Table, condition: &str, params: Vec<SqlValue>) -> Result<Vec<Vec<Cell>>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY _row",
            table.column_list(), table.physical(), condition
        );
        let mut statement = self.connection.prepare(&sql).context("reading rows")?;
        let mut rows = statement.query(params_from_iter(params)).context("reading rows")?;
        let mut result = Vec::new();
        while let Some(row) = rows.next().context("reading rows")? {
            let mut cells = Vec::with_capacity(table.columns().len());
            for (i, column) in table.columns().iter().enumerate() {
                cells.push(Cell::from_row(row, i, column.kind).context("reading rows")?);
            }
            result.push(cells);
        }
        Ok(result)
    }

    /// Reads rows `start..stop` in row order.
    pub fn read(&mut self, table: &Table, start: usize, stop: usize) -> Result<Vec<Vec<Cell>>> {
        self.query_rows(
            table, "_row >= ? AND _row < ?",
            vec![SqlValue::Integer(start as i64), SqlValue::Integer(stop as i64)]
        )
    }

    /// Reads a single row, or returns [`None`] if the row does not exist.
    pub fn read_row(&mut self, table: &Table, row: usize) -> Result<Option<Vec<Cell>>> {
        let mut rows = self.query_rows(table, "_row = ?", vec![SqlValue::Integer(row as i64)])?;
        Ok(rows.pop())
    }

    /// Reads the rows with the given row numbers in the given order.
    ///
    /// Fails if a row does not exist.
    pub fn read_coordinates(&mut self, table: &Table, coordinates: &[usize]) -> Result<Vec<Vec<Cell>>> {
        let mut result = Vec::with_capacity(coordinates.len());
        for row in coordinates.iter() {
            let cells = self.read_row(table, *row)?.ok_or_else(|| {
                KBError::NotFound(format!("row {} does not exist in table {}", row, table.name()))
            })?;
            result.push(cells);
        }
        Ok(result)
    }

    /// Reads rows `start..stop` of the named column.
    pub fn read_column(&mut self, table: &Table, name: &str, start: usize, stop: usize) -> Result<Vec<Cell>> {
        let (_, column) = table.column(name).ok_or_else(|| {
            KBError::NotFound(format!("column {} does not exist in table {}", name, table.name()))
        })?;
        let kind = column.kind;
        let sql = format!(
            "SELECT \"{}\" FROM {} WHERE _row >= ?1 AND _row < ?2 ORDER BY _row",
            name, table.physical()
        );
        let mut statement = self.connection.prepare(&sql).context("reading a column")?;
        let mut rows = statement.query((start, stop)).context("reading a column")?;
        let mut result = Vec::new();
        while let Some(row) = rows.next().context("reading a column")? {
            result.push(Cell::from_row(row, 0, kind).context("reading a column")?);
        }
        Ok(result)
    }

    /// Returns the numbers of rows within `start..stop` that match the selector.
    pub fn read_where(&mut self, table: &Table, selector: &Selector, start: usize, stop: usize) -> Result<Vec<usize>> {
        let (condition, mut params) = selector.to_sql(table)?;
        let sql = format!(
            "SELECT _row FROM {} WHERE _row >= ? AND _row < ? AND {} ORDER BY _row",
            table.physical(), condition
        );
        let mut values = vec![SqlValue::Integer(start as i64), SqlValue::Integer(stop as i64)];
        values.append(&mut params);
        let mut statement = self.connection.prepare(&sql).context("evaluating a selector")?;
        let mut rows = statement.query(params_from_iter(values)).context("evaluating a selector")?;
        let mut result = Vec::new();
        while let Some(row) = rows.next().context("evaluating a selector")? {
            result.push(row.get::<_, usize>(0).context("evaluating a selector")?);
        }
        Ok(result)
    }
}

//-----------------------------------------------------------------------------
