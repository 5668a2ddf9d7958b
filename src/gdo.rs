//! Genotype data object (GDO) repositories.
//!
//! Each markers set with `N` markers has its own repository table with columns `vid`, `op_vid`, `probs`, and `confidence`.
//! The probabilities form a `2 x N` array and the confidences an array of length `N`.
//! Both are stored as packed little-endian `f32` values in fixed-width string columns of `2 * N * 4` and `N * 4` bytes.
//! The tabular store drops trailing NUL bytes from string values, so a stored value may be shorter than the column.
//! Such values are padded with NUL bytes to the full width before decoding.
//!
//! A [`GdoRepository`] caches a `VID -> row` index for each table it has read from.
//! The cache is process-local and assumes a single writer.

use crate::backend::{Cell, Gateway, Session, Table, TableService};
use crate::schema::{self, FLOAT_BYTES};
use crate::{vid, KBError, Result};

use ndarray::{Array1, Array2};

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

use tracing::{debug, info};

#[cfg(test)]
mod tests;

//-----------------------------------------------------------------------------

/// A genotype data object.
#[derive(Clone, Debug, PartialEq)]
pub struct Gdo {
    /// Markers set of the GDO.
    pub set_vid: String,
    /// Row of the GDO in the repository table.
    pub row_id: usize,
    pub vid: String,
    pub op_vid: String,
    /// Probabilities of the AA and BB genotypes; shape `(2, N)`.
    pub probs: Array2<f32>,
    /// Confidence values; shape `(N,)`.
    pub confs: Array1<f32>,
}

impl Gdo {
    /// Returns the number of markers.
    pub fn len(&self) -> usize {
        self.confs.len()
    }

    /// Returns `true` if the GDO covers no markers.
    pub fn is_empty(&self) -> bool {
        self.confs.is_empty()
    }
}

//-----------------------------------------------------------------------------

/// Serializes the values as little-endian `f32`.
pub fn pack<'a, I: IntoIterator<Item = &'a f32>>(values: I) -> Vec<u8> {
    values.into_iter().flat_map(|x| x.to_le_bytes()).collect()
}

/// Deserializes little-endian `f32` values from a string column of the given width.
///
/// Short values are padded with NUL bytes to the full width.
pub fn unpack(bytes: &[u8], width: usize) -> Result<Vec<f32>> {
    if bytes.len() > width {
        return Err(KBError::Invariant(format!("packed value of {} bytes exceeds column width {}", bytes.len(), width)));
    }
    if width % FLOAT_BYTES != 0 {
        return Err(KBError::Invariant(format!("column width {} is not a multiple of {}", width, FLOAT_BYTES)));
    }
    let mut padded = bytes.to_vec();
    padded.resize(width, 0);
    Ok(padded.chunks_exact(FLOAT_BYTES).map(|x| f32::from_le_bytes([x[0], x[1], x[2], x[3]])).collect())
}

// Column widths of a repository table.
#[derive(Clone, Debug)]
struct Widths {
    probs: usize,
    confs: usize,
}

impl Widths {
    fn new(table: &Table) -> Result<Self> {
        let probs = table.string_width("probs");
        let confs = table.string_width("confidence");
        match (probs, confs) {
            (Some(probs), Some(confs)) if probs == 2 * confs && confs % FLOAT_BYTES == 0 => Ok(Widths { probs, confs }),
            _ => Err(KBError::Invariant(format!("table {} is not a GDO repository", table.name()))),
        }
    }

    fn markers(&self) -> usize {
        self.confs / FLOAT_BYTES
    }
}

fn decode_row(set_vid: &str, table: &Table, widths: &Widths, row_id: usize, cells: Vec<Cell>) -> Result<Gdo> {
    let mut cells = cells.into_iter();
    let mut next = || cells.next().ok_or_else(|| KBError::Invariant(format!("truncated row {} in table {}", row_id, table.name())));
    let vid = next()?.into_string()?;
    let op_vid = next()?.into_string()?;
    let probs = next()?;
    let confs = next()?;
    let (probs, confs) = match (probs.as_bytes(), confs.as_bytes()) {
        (Some(probs), Some(confs)) => (unpack(probs, widths.probs)?, unpack(confs, widths.confs)?),
        _ => return Err(KBError::Invariant(format!("row {} of table {} has non-string arrays", row_id, table.name()))),
    };
    let n = widths.markers();
    let probs = Array2::from_shape_vec((2, n), probs).map_err(|x| {
        KBError::Invariant(format!("cannot reshape probabilities of GDO {}: {}", vid, x))
    })?;
    Ok(Gdo {
        set_vid: set_vid.to_string(),
        row_id,
        vid,
        op_vid,
        probs,
        confs: Array1::from_vec(confs),
    })
}

//-----------------------------------------------------------------------------

/// GDO repositories of all markers sets.
#[derive(Debug, Default)]
pub struct GdoRepository {
    // Table name -> (GDO VID -> row).
    index: RefCell<HashMap<String, HashMap<String, usize>>>,
}

impl GdoRepository {
    /// Creates a repository handle with empty caches.
    pub fn new() -> Self {
        Self::default()
    }

    fn invalidate(&self, table: &str) {
        if self.index.borrow_mut().remove(table).is_some() {
            debug!("Invalidated the GDO index of {}", table);
        }
    }

    /// Creates the repository table for a markers set with `n` markers.
    ///
    /// Fails if the set already has a repository or `n` is zero.
    pub fn create_repository(&self, gateway: &Gateway, set_vid: &str, n: usize) -> Result<()> {
        if n == 0 {
            return Err(KBError::Validation(format!("markers set {} has no markers", set_vid)));
        }
        let name = schema::gdo_table_name(set_vid);
        let created = gateway.with_tables(|tables| schema::create_if_missing(tables, &name, &schema::gdo_schema(n)))?;
        if !created {
            return Err(KBError::Validation(format!("markers set {} already has a GDO repository", set_vid)));
        }
        self.invalidate(&name);
        Ok(())
    }

    /// Appends a GDO to the repository of the markers set and returns its VID.
    ///
    /// Fails with [`KBError::Invariant`] if the arrays do not match the size of the set.
    pub fn append(&self, gateway: &Gateway, set_vid: &str, probs: &Array2<f32>, confs: &Array1<f32>, op_vid: &str) -> Result<String> {
        let name = schema::gdo_table_name(set_vid);
        let gdo_vid = gateway.with_tables(|tables| {
            let table = schema::get_table(tables, &name)?;
            let widths = Widths::new(&table)?;
            if probs.nrows() != 2 {
                return Err(KBError::Invariant(format!("GDO probabilities must have 2 rows, got {}", probs.nrows())));
            }
            let probs = pack(probs.iter());
            let confs = pack(confs.iter());
            if probs.len() != widths.probs || confs.len() != widths.confs || probs.len() != 2 * confs.len() {
                return Err(KBError::Invariant(format!(
                    "GDO arrays of {} and {} bytes do not match columns of {} and {} bytes in {}",
                    probs.len(), confs.len(), widths.probs, widths.confs, name
                )));
            }
            let gdo_vid = vid::make_vid();
            let row = vec![Cell::str(&gdo_vid), Cell::str(op_vid), Cell::Bytes(probs), Cell::Bytes(confs)];
            tables.append(&table, &[row])?;
            Ok(gdo_vid)
        })?;
        self.invalidate(&name);
        Ok(gdo_vid)
    }

    fn build_index(tables: &mut TableService, table: &Table) -> Result<HashMap<String, usize>> {
        let nrows = tables.nrows(table)?;
        let mut result = HashMap::with_capacity(nrows);
        for (row, cell) in tables.read_column(table, "vid", 0, nrows)?.into_iter().enumerate() {
            result.insert(cell.into_string()?, row);
        }
        debug!("Indexed {} GDOs in {}", result.len(), table.name());
        Ok(result)
    }

    /// Returns the GDO with the given VID from the repository of the markers set.
    pub fn get(&self, gateway: &Gateway, set_vid: &str, gdo_vid: &str) -> Result<Gdo> {
        let name = schema::gdo_table_name(set_vid);
        gateway.with_tables(|tables| {
            let table = schema::get_table(tables, &name)?;
            let widths = Widths::new(&table)?;
            let cached = self.index.borrow().get(&name).and_then(|x| x.get(gdo_vid).copied());
            let row_id = match cached {
                Some(row_id) => row_id,
                None => {
                    let index = Self::build_index(tables, &table)?;
                    let row_id = index.get(gdo_vid).copied();
                    self.index.borrow_mut().insert(name.clone(), index);
                    row_id.ok_or_else(|| KBError::NotFound(format!("GDO {} is not in {}", gdo_vid, name)))?
                },
            };
            let cells = tables.read_row(&table, row_id)?.ok_or_else(|| {
                KBError::NotFound(format!("row {} of {} does not exist", row_id, name))
            })?;
            decode_row(set_vid, &table, &widths, row_id, cells)
        })
    }

    /// Returns an iterator over the GDOs of the markers set in append order.
    ///
    /// The iterator reads `batch_size` rows at a time within one session.
    /// The session is closed when the iterator is exhausted, fails, or is dropped.
    pub fn stream(&self, gateway: &Gateway, set_vid: &str, batch_size: usize) -> Result<GdoStream> {
        if batch_size == 0 {
            return Err(KBError::Invariant(String::from("batch size must be positive")));
        }
        let mut session = gateway.open_session()?;
        let (table, nrows) = {
            let mut tables = session.tables();
            let table = schema::get_table(&mut tables, &schema::gdo_table_name(set_vid))?;
            let nrows = tables.nrows(&table)?;
            (table, nrows)
        };
        let widths = Widths::new(&table)?;
        debug!("Streaming {} GDOs from {} in session {}", nrows, table.name(), session.id());
        Ok(GdoStream {
            session: Some(session),
            set_vid: set_vid.to_string(),
            table, widths, nrows, batch_size,
            next_row: 0,
            buffer: VecDeque::new(),
        })
    }

    /// Returns the number of GDOs in the repository of the markers set.
    pub fn count(&self, gateway: &Gateway, set_vid: &str) -> Result<usize> {
        gateway.with_tables(|tables| {
            let table = schema::get_table(tables, &schema::gdo_table_name(set_vid))?;
            tables.nrows(&table)
        })
    }

    /// Returns `true` if the markers set has a repository.
    pub fn exists(&self, gateway: &Gateway, set_vid: &str) -> Result<bool> {
        gateway.with_tables(|tables| schema::table_exists(tables, &schema::gdo_table_name(set_vid)))
    }

    /// Removes the repository of the markers set from the catalog.
    ///
    /// Returns `true` if the repository existed.
    pub fn drop_repository(&self, gateway: &Gateway, set_vid: &str) -> Result<bool> {
        let name = schema::gdo_table_name(set_vid);
        let removed = gateway.with_tables(|tables| schema::delete(tables, &name))?;
        self.invalidate(&name);
        if removed > 0 {
            info!("Dropped the GDO repository of markers set {}", set_vid);
        }
        Ok(removed > 0)
    }
}

//-----------------------------------------------------------------------------

/// Iterator over the GDOs of a markers set.
///
/// See [`GdoRepository::stream`].
#[derive(Debug)]
pub struct GdoStream {
    session: Option<Session>,
    set_vid: String,
    table: Table,
    widths: Widths,
    nrows: usize,
    batch_size: usize,
    next_row: usize,
    buffer: VecDeque<Gdo>,
}

impl GdoStream {
    /// Returns `true` if the stream still holds a session.
    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    fn close(&mut self) {
        if let Some(session) = self.session.take() {
            debug!("Finished streaming {} in session {}", self.table.name(), session.id());
        }
    }

    fn fill(&mut self) -> Result<()> {
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return Ok(()),
        };
        let stop = (self.next_row + self.batch_size).min(self.nrows);
        let rows = session.tables().read(&self.table, self.next_row, stop)?;
        if rows.len() != stop - self.next_row {
            return Err(KBError::Invariant(format!(
                "expected {} rows from {}, got {}", stop - self.next_row, self.table.name(), rows.len()
            )));
        }
        for (offset, cells) in rows.into_iter().enumerate() {
            let gdo = decode_row(&self.set_vid, &self.table, &self.widths, self.next_row + offset, cells)?;
            self.buffer.push_back(gdo);
        }
        self.next_row = stop;
        Ok(())
    }
}

impl Iterator for GdoStream {
    type Item = Result<Gdo>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && self.next_row < self.nrows && self.session.is_some() {
            if let Err(err) = self.fill() {
                self.buffer.clear();
                self.close();
                return Some(Err(err));
            }
        }
        match self.buffer.pop_front() {
            Some(gdo) => {
                if self.buffer.is_empty() && self.next_row >= self.nrows {
                    self.close();
                }
                Some(Ok(gdo))
            },
            None => {
                self.close();
                None
            },
        }
    }
}

//-----------------------------------------------------------------------------
