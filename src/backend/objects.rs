//! Relational object store.
//!
//! Objects are stored in table `Objects` with one row per object and their attributes in table `Attributes`.
//! The store knows nothing about entity schemas beyond what each saved record declares:
//! its class lineage, the attributes it requires, and an optional unique key.
//! Enumeration values live in table `Enums`, and only their identifiers appear in attributes.

use crate::error::{BackendContext, ValidationFailure};
use crate::{KBError, Result};

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension};

use std::collections::BTreeMap;

//-----------------------------------------------------------------------------

/// A raw object as seen by the backend.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectRecord {
    /// Object identifier.
    pub vid: String,
    /// Most derived class of the object.
    pub class: String,
    /// The class and its ancestors, most derived first.
    pub lineage: Vec<String>,
    /// Value that must be unique over all objects.
    pub unique_key: Option<String>,
    /// Attributes that must be present and not null when saving.
    pub required: Vec<String>,
    /// Attribute values in wire representation.
    pub attributes: BTreeMap<String, SqlValue>,
}

impl ObjectRecord {
    fn lineage_string(&self) -> String {
        let mut result = String::from("/");
        for class in self.lineage.iter() {
            result.push_str(class);
            result.push('/');
        }
        result
    }

    fn parse_lineage(lineage: &str) -> Vec<String> {
        lineage.split('/').filter(|x| !x.is_empty()).map(|x| x.to_string()).collect()
    }
}

/// An enumeration value and its opaque identifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnumEntry {
    pub id: i64,
    pub class: String,
    pub value: String,
}

//-----------------------------------------------------------------------------

/// Creates the object store tables in a new backend database.
pub(crate) fn create_store(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute(
        "CREATE TABLE Objects (
            vid TEXT PRIMARY KEY,
            class TEXT NOT NULL,
            lineage TEXT NOT NULL,
            unique_key TEXT UNIQUE
        ) STRICT",
        (),
    )?;
    connection.execute(
        "CREATE TABLE Attributes (
            vid TEXT NOT NULL,
            name TEXT NOT NULL,
            value ANY,
            PRIMARY KEY (vid, name)
        ) STRICT",
        (),
    )?;
    connection.execute(
        "CREATE INDEX AttributeValues ON Attributes(name, value)",
        (),
    )?;
    connection.execute(
        "CREATE TABLE Enums (
            id INTEGER PRIMARY KEY,
            class TEXT NOT NULL,
            value TEXT NOT NULL,
            UNIQUE (class, value)
        ) STRICT",
        (),
    )?;
    Ok(())
}

//-----------------------------------------------------------------------------

/// Saves a new object or replaces an existing object with the same VID.
///
/// Fails with [`KBError::BackendValidation`] if a required attribute is missing or the unique key is taken.
pub(crate) fn save(connection: &mut Connection, record: &ObjectRecord) -> Result<String> {
    let mut failure = ValidationFailure { class: record.class.clone(), ..Default::default() };
    for name in record.required.iter() {
        match record.attributes.get(name) {
            None | Some(SqlValue::Null) => failure.missing.push(name.clone()),
            _ => {},
        }
    }

    let transaction = connection.transaction().context("saving an object")?;
    if let Some(key) = record.unique_key.as_ref() {
        let owner: Option<String> = transaction.query_row(
            "SELECT vid FROM Objects WHERE unique_key = ?1",
            (key,),
            |row| row.get(0)
        ).optional().context("checking a unique key")?;
        if owner.is_some() && owner.as_ref() != Some(&record.vid) {
            failure.duplicate_key = Some(key.clone());
        }
    }
    if !failure.is_empty() {
        return Err(KBError::BackendValidation(failure));
    }

    transaction.execute(
        "INSERT INTO Objects(vid, class, lineage, unique_key) VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(vid) DO UPDATE SET class = excluded.class, lineage = excluded.lineage, unique_key = excluded.unique_key",
        (&record.vid, &record.class, record.lineage_string(), &record.unique_key),
    ).context("saving an object")?;
    transaction.execute(
        "DELETE FROM Attributes WHERE vid = ?1",
        (&record.vid,),
    ).context("saving an object")?;
    {
        let mut insert = transaction.prepare(
            "INSERT INTO Attributes(vid, name, value) VALUES (?1, ?2, ?3)"
        ).context("saving an object")?;
        for (name, value) in record.attributes.iter() {
            if *value == SqlValue::Null {
                continue;
            }
            insert.execute((&record.vid, name, value)).context("saving an object")?;
        }
    }
    transaction.commit().context("saving an object")?;
    Ok(record.vid.clone())
}

/// Returns the object with the given VID, or [`None`] if there is no such object.
pub(crate) fn get(connection: &Connection, vid: &str) -> Result<Option<ObjectRecord>> {
    let header: Option<(String, String, Option<String>)> = connection.query_row(
        "SELECT class, lineage, unique_key FROM Objects WHERE vid = ?1",
        (vid,),
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?))
    ).optional().context("loading an object")?;
    let (class, lineage, unique_key) = match header {
        Some(header) => header,
        None => return Ok(None),
    };

    let mut attributes = BTreeMap::new();
    let mut statement = connection.prepare(
        "SELECT name, value FROM Attributes WHERE vid = ?1"
    ).context("loading an object")?;
    let mut rows = statement.query((vid,)).context("loading an object")?;
    while let Some(row) = rows.next().context("loading an object")? {
        let name: String = row.get(0).context("loading an object")?;
        let value: SqlValue = row.get(1).context("loading an object")?;
        attributes.insert(name, value);
    }

    Ok(Some(ObjectRecord {
        vid: vid.to_string(),
        class,
        lineage: ObjectRecord::parse_lineage(&lineage),
        unique_key,
        required: Vec::new(),
        attributes,
    }))
}

/// Returns all objects of the class or its subclasses, optionally with an attribute equal to the given value.
///
/// Objects are returned in VID order.
pub(crate) fn find(connection: &Connection, class: &str, field: Option<&(String, SqlValue)>) -> Result<Vec<ObjectRecord>> {
    let pattern = format!("/{}/", class);
    let mut vids: Vec<String> = Vec::new();
    match field {
        Some((name, value)) => {
            let mut statement = connection.prepare(
                "SELECT o.vid FROM Objects o JOIN Attributes a ON o.vid = a.vid
                WHERE instr(o.lineage, ?1) > 0 AND a.name = ?2 AND a.value = ?3
                ORDER BY o.vid"
            ).context("finding objects")?;
            let mut rows = statement.query((&pattern, name, value)).context("finding objects")?;
            while let Some(row) = rows.next().context("finding objects")? {
                vids.push(row.get(0).context("finding objects")?);
            }
        },
        None => {
            let mut statement = connection.prepare(
                "SELECT vid FROM Objects WHERE instr(lineage, ?1) > 0 ORDER BY vid"
            ).context("finding objects")?;
            let mut rows = statement.query((&pattern,)).context("finding objects")?;
            while let Some(row) = rows.next().context("finding objects")? {
                vids.push(row.get(0).context("finding objects")?);
            }
        },
    }

    let mut result = Vec::with_capacity(vids.len());
    for vid in vids.iter() {
        if let Some(record) = get(connection, vid)? {
            result.push(record);
        }
    }
    Ok(result)
}

/// Deletes the object and returns `true` if it existed.
pub(crate) fn delete(connection: &mut Connection, vid: &str) -> Result<bool> {
    let transaction = connection.transaction().context("deleting an object")?;
    transaction.execute("DELETE FROM Attributes WHERE vid = ?1", (vid,)).context("deleting an object")?;
    let removed = transaction.execute("DELETE FROM Objects WHERE vid = ?1", (vid,)).context("deleting an object")?;
    transaction.commit().context("deleting an object")?;
    Ok(removed > 0)
}

//-----------------------------------------------------------------------------

/// Returns all enumeration values.
pub(crate) fn enums(connection: &Connection) -> Result<Vec<EnumEntry>> {
    let mut statement = connection.prepare(
        "SELECT id, class, value FROM Enums ORDER BY id"
    ).context("loading enumerations")?;
    let mut rows = statement.query(()).context("loading enumerations")?;
    let mut result = Vec::new();
    while let Some(row) = rows.next().context("loading enumerations")? {
        result.push(EnumEntry {
            id: row.get(0).context("loading enumerations")?,
            class: row.get(1).context("loading enumerations")?,
            value: row.get(2).context("loading enumerations")?,
        });
    }
    Ok(result)
}

/// Adds the missing values to an enumeration and returns the number of added values.
pub(crate) fn register_enum(connection: &mut Connection, class: &str, values: &[String]) -> Result<usize> {
    let transaction = connection.transaction().context("registering an enumeration")?;
    let mut added = 0;
    {
        let mut insert = transaction.prepare(
            "INSERT OR IGNORE INTO Enums(class, value) VALUES (?1, ?2)"
        ).context("registering an enumeration")?;
        for value in values.iter() {
            added += insert.execute((class, value)).context("registering an enumeration")?;
        }
    }
    transaction.commit().context("registering an enumeration")?;
    Ok(added)
}

//-----------------------------------------------------------------------------
