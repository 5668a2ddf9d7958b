//! Marker-table service: batched ingest into the four marker tables and selector-based reads.
//!
//! Records are pulled from the input in batches of `batch_size`.
//! Each batch is converted to rows, given per-row VIDs if the table needs them and the operation VID, and appended.
//! One session covers the whole ingest into one table.
//!
//! Reads walk the table in windows of `batch_size` rows.
//! With a [`Selector`], only the matching rows of each window are read.

use crate::backend::{Cell, Gateway, Selector, Table, TableService};
use crate::schema::{self, MarkerTable};
use crate::{vid, KBError, Result};

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::str::FromStr;
use std::vec;

use tracing::{debug, info};


//-----------------------------------------------------------------------------

/// Input record for a SNP marker definition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnpDefinition {
    pub source: String,
    pub context: String,
    pub label: String,
    pub rs_label: String,
    /// SNP mask `LEFT[A/B]RIGHT`.
    pub mask: String,
}

/// A stored SNP marker definition.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnpMarker {
    pub vid: String,
    pub source: String,
    pub context: String,
    pub label: String,
    pub rs_label: String,
    pub mask: String,
    pub op_vid: String,
}

/// Strand of an alignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Strand {
    Forward,
    Reverse,
}

impl Strand {
    fn is_forward(self) -> bool {
        self == Strand::Forward
    }

    fn from_forward(forward: bool) -> Self {
        if forward { Strand::Forward } else { Strand::Reverse }
    }
}

/// Allele of a marker seen on the reference genome.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Allele {
    A,
    B,
}

impl Allele {
    fn as_str(self) -> &'static str {
        match self {
            Allele::A => "A",
            Allele::B => "B",
        }
    }
}

impl FromStr for Allele {
    type Err = KBError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "A" => Ok(Allele::A),
            "B" => Ok(Allele::B),
            _ => Err(KBError::Validation(format!("invalid allele {:?}", value))),
        }
    }
}

impl Display for Allele {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Input record for an alignment of a marker to a reference genome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnpAlignment {
    pub marker_vid: String,
    pub ref_genome: String,
    /// Chromosome in `1..=24`; X is 23 and Y is 24.
    pub chromosome: i64,
    pub pos: i64,
    /// Always `chromosome * 10^10 + pos`.
    pub global_pos: i64,
    pub strand: Strand,
    pub allele: Allele,
    /// Number of hits of the mask on the reference.
    pub copies: i64,
}

impl SnpAlignment {
    /// Multiplier of the chromosome in global positions.
    pub const CHROMOSOME_OFFSET: i64 = 10_000_000_000;

    /// Largest chromosome number.
    pub const MAX_CHROMOSOME: i64 = 24;

    /// Creates a new alignment and computes the global position.
    pub fn new(marker_vid: &str, ref_genome: &str, chromosome: i64, pos: i64, strand: Strand, allele: Allele, copies: i64) -> Result<Self> {
        let global_pos = Self::global_pos(chromosome, pos)?;
        Ok(SnpAlignment {
            marker_vid: marker_vid.to_string(),
            ref_genome: ref_genome.to_string(),
            chromosome, pos, global_pos, strand, allele, copies,
        })
    }

    /// Returns the global position for the chromosome and the position.
    pub fn global_pos(chromosome: i64, pos: i64) -> Result<i64> {
        if !(1..=Self::MAX_CHROMOSOME).contains(&chromosome) {
            return Err(KBError::Validation(format!("chromosome {} is not in 1..={}", chromosome, Self::MAX_CHROMOSOME)));
        }
        if pos < 0 || pos >= Self::CHROMOSOME_OFFSET {
            return Err(KBError::Validation(format!("position {} is out of range", pos)));
        }
        Ok(chromosome * Self::CHROMOSOME_OFFSET + pos)
    }

    fn validate(&self) -> Result<()> {
        let expected = Self::global_pos(self.chromosome, self.pos)?;
        if self.global_pos != expected {
            return Err(KBError::Validation(format!(
                "marker {}: global position {} does not match chromosome {} position {}",
                self.marker_vid, self.global_pos, self.chromosome, self.pos
            )));
        }
        Ok(())
    }
}

/// A stored alignment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnpAlignmentRow {
    pub alignment: SnpAlignment,
    pub op_vid: String,
}

/// A stored markers set descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnpMarkersSet {
    pub vid: String,
    pub maker: String,
    pub model: String,
    pub op_vid: String,
}

/// Input record for a markers set member.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetMember {
    pub marker_vid: String,
    /// Position of the marker in the canonical order of the set.
    pub marker_indx: usize,
    /// The technology reports the alleles of the marker swapped.
    pub allele_flip: bool,
}

/// A stored markers set member.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetMemberRow {
    pub set_vid: String,
    pub member: SetMember,
    pub op_vid: String,
}

//-----------------------------------------------------------------------------

/// A record that can be appended to a marker table.
pub trait MarkerRecord {
    /// The target table.
    const TABLE: MarkerTable;

    /// Converts the record to a row with the given row VID and operation VID.
    fn to_cells(&self, vid: Option<&str>, op_vid: &str) -> Result<Vec<Cell>>;
}

/// A row read from a marker table.
pub trait MarkerRow: Sized {
    /// The source table.
    const TABLE: MarkerTable;

    /// Converts a row in column order to a record.
    fn from_cells(cells: Vec<Cell>) -> Result<Self>;
}

fn row_vid(vid: Option<&str>, table: MarkerTable) -> Result<&str> {
    vid.ok_or_else(|| KBError::Invariant(format!("rows of table {} need a VID", table.name())))
}

impl MarkerRecord for SnpDefinition {
    const TABLE: MarkerTable = MarkerTable::Definition;

    fn to_cells(&self, vid: Option<&str>, op_vid: &str) -> Result<Vec<Cell>> {
        Ok(vec![
            Cell::str(row_vid(vid, Self::TABLE)?),
            Cell::str(&self.source), Cell::str(&self.context),
            Cell::str(&self.label), Cell::str(&self.rs_label),
            Cell::str(&self.mask), Cell::str(op_vid),
        ])
    }
}

impl MarkerRecord for SnpAlignment {
    const TABLE: MarkerTable = MarkerTable::Alignment;

    fn to_cells(&self, _: Option<&str>, op_vid: &str) -> Result<Vec<Cell>> {
        self.validate()?;
        Ok(vec![
            Cell::str(&self.marker_vid), Cell::str(&self.ref_genome),
            Cell::Long(self.chromosome), Cell::Long(self.pos), Cell::Long(self.global_pos),
            Cell::Bool(self.strand.is_forward()), Cell::str(self.allele.as_str()),
            Cell::Long(self.copies), Cell::str(op_vid),
        ])
    }
}

// The set descriptor row takes the maker and the model as a pair.
impl MarkerRecord for (String, String) {
    const TABLE: MarkerTable = MarkerTable::SetDefinition;

    fn to_cells(&self, vid: Option<&str>, op_vid: &str) -> Result<Vec<Cell>> {
        Ok(vec![
            Cell::str(row_vid(vid, Self::TABLE)?),
            Cell::str(&self.0), Cell::str(&self.1), Cell::str(op_vid),
        ])
    }
}

impl MarkerRecord for SetMember {
    const TABLE: MarkerTable = MarkerTable::SetMember;

    fn to_cells(&self, vid: Option<&str>, op_vid: &str) -> Result<Vec<Cell>> {
        Ok(vec![
            Cell::str(row_vid(vid, Self::TABLE)?),
            Cell::str(&self.marker_vid), Cell::Long(self.marker_indx as i64),
            Cell::Bool(self.allele_flip), Cell::str(op_vid),
        ])
    }
}

//-----------------------------------------------------------------------------

// Consumes the cells of a row in column order.
struct RowReader {
    cells: vec::IntoIter<Cell>,
    table: MarkerTable,
}

impl RowReader {
    fn new(cells: Vec<Cell>, table: MarkerTable) -> Self {
        RowReader { cells: cells.into_iter(), table }
    }

    fn next(&mut self) -> Result<Cell> {
        self.cells.next().ok_or_else(|| KBError::Invariant(format!("truncated row in table {}", self.table.name())))
    }

    fn string(&mut self) -> Result<String> {
        self.next()?.into_string()
    }

    fn long(&mut self) -> Result<i64> {
        let cell = self.next()?;
        cell.as_long().ok_or_else(|| KBError::Invariant(format!("expected a long in table {}, got {:?}", self.table.name(), cell)))
    }

    fn bool(&mut self) -> Result<bool> {
        let cell = self.next()?;
        cell.as_bool().ok_or_else(|| KBError::Invariant(format!("expected a bool in table {}, got {:?}", self.table.name(), cell)))
    }
}

impl MarkerRow for SnpMarker {
    const TABLE: MarkerTable = MarkerTable::Definition;

    fn from_cells(cells: Vec<Cell>) -> Result<Self> {
        let mut row = RowReader::new(cells, Self::TABLE);
        Ok(SnpMarker {
            vid: row.string()?,
            source: row.string()?,
            context: row.string()?,
            label: row.string()?,
            rs_label: row.string()?,
            mask: row.string()?,
            op_vid: row.string()?,
        })
    }
}

impl MarkerRow for SnpAlignmentRow {
    const TABLE: MarkerTable = MarkerTable::Alignment;

    fn from_cells(cells: Vec<Cell>) -> Result<Self> {
        let mut row = RowReader::new(cells, Self::TABLE);
        let alignment = SnpAlignment {
            marker_vid: row.string()?,
            ref_genome: row.string()?,
            chromosome: row.long()?,
            pos: row.long()?,
            global_pos: row.long()?,
            strand: Strand::from_forward(row.bool()?),
            allele: row.string()?.parse()?,
            copies: row.long()?,
        };
        Ok(SnpAlignmentRow { alignment, op_vid: row.string()? })
    }
}

impl MarkerRow for SnpMarkersSet {
    const TABLE: MarkerTable = MarkerTable::SetDefinition;

    fn from_cells(cells: Vec<Cell>) -> Result<Self> {
        let mut row = RowReader::new(cells, Self::TABLE);
        Ok(SnpMarkersSet {
            vid: row.string()?,
            maker: row.string()?,
            model: row.string()?,
            op_vid: row.string()?,
        })
    }
}

impl MarkerRow for SetMemberRow {
    const TABLE: MarkerTable = MarkerTable::SetMember;

    fn from_cells(cells: Vec<Cell>) -> Result<Self> {
        let mut row = RowReader::new(cells, Self::TABLE);
        let set_vid = row.string()?;
        let marker_vid = row.string()?;
        let marker_indx = row.long()?;
        let marker_indx = usize::try_from(marker_indx).map_err(|_| {
            KBError::Invariant(format!("negative marker index {} in set {}", marker_indx, set_vid))
        })?;
        let member = SetMember { marker_vid, marker_indx, allele_flip: row.bool()? };
        Ok(SetMemberRow { set_vid, member, op_vid: row.string()? })
    }
}

//-----------------------------------------------------------------------------

/// How rows get their VIDs during an ingest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VidPolicy<'a> {
    /// Each row gets a fresh VID.
    Fresh,
    /// Every row gets the same VID.
    Fixed(&'a str),
    /// The rows have no VID column.
    None,
}

/// Outcome of an ingest.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Fresh VIDs in input order.
    pub vids: Vec<String>,
    /// Number of appended rows.
    pub rows: usize,
}

fn check_batch_size(batch_size: usize) -> Result<()> {
    if batch_size == 0 {
        return Err(KBError::Invariant(String::from("batch size must be positive")));
    }
    Ok(())
}

/// Appends the records to their marker table.
///
/// Records are pulled in batches of `batch_size` and each batch is appended before the next one is pulled.
/// The ingest stops after the first batch shorter than `batch_size`.
/// An empty input leaves the table unchanged.
/// If a batch fails, the batches before it stay in the table.
pub fn extend<R, I>(gateway: &Gateway, records: I, policy: VidPolicy, op_vid: &str, batch_size: usize) -> Result<IngestReport>
where
    R: MarkerRecord,
    I: IntoIterator<Item = R>,
{
    check_batch_size(batch_size)?;
    gateway.with_tables(|tables| {
        let table = schema::get_table(tables, R::TABLE.name())?;
        let mut records = records.into_iter();
        let mut report = IngestReport::default();
        loop {
            let batch: Vec<R> = records.by_ref().take(batch_size).collect();
            let mut rows = Vec::with_capacity(batch.len());
            for record in batch.iter() {
                let cells = match policy {
                    VidPolicy::Fresh => {
                        let vid = vid::make_vid();
                        let cells = record.to_cells(Some(&vid), op_vid)?;
                        report.vids.push(vid);
                        cells
                    },
                    VidPolicy::Fixed(vid) => record.to_cells(Some(vid), op_vid)?,
                    VidPolicy::None => record.to_cells(None, op_vid)?,
                };
                rows.push(cells);
            }
            if !rows.is_empty() {
                tables.append(&table, &rows)?;
                report.rows += rows.len();
                debug!("Appended {} rows to {} ({} in total)", rows.len(), table.name(), report.rows);
            }
            if batch.len() < batch_size {
                break;
            }
        }
        info!("Ingested {} rows into {} for operation {}", report.rows, table.name(), op_vid);
        Ok(report)
    })
}

//-----------------------------------------------------------------------------

fn read_windows<R: MarkerRow>(tables: &mut TableService, table: &Table, selector: Option<&Selector>, batch_size: usize) -> Result<Vec<R>> {
    let nrows = tables.nrows(table)?;
    let mut result = Vec::new();
    let mut start = 0;
    while start < nrows {
        let stop = (start + batch_size).min(nrows);
        let rows = match selector {
            Some(selector) => {
                let coordinates = tables.read_where(table, selector, start, stop)?;
                tables.read_coordinates(table, &coordinates)?
            },
            None => tables.read(table, start, stop)?,
        };
        for cells in rows {
            result.push(R::from_cells(cells)?);
        }
        start = stop;
    }
    debug!("Read {} of {} rows from {}", result.len(), nrows, table.name());
    Ok(result)
}

/// Reads the rows of a marker table, optionally filtered by a selector.
///
/// The table is read in windows of `batch_size` rows.
/// A selector that matches no rows yields an empty result.
pub fn read<R: MarkerRow>(gateway: &Gateway, selector: Option<&Selector>, batch_size: usize) -> Result<Vec<R>> {
    check_batch_size(batch_size)?;
    gateway.with_tables(|tables| {
        let table = schema::get_table(tables, R::TABLE.name())?;
        read_windows(tables, &table, selector, batch_size)
    })
}

fn vid_rows(tables: &mut TableService, table: &Table, batch_size: usize) -> Result<HashMap<String, usize>> {
    let nrows = tables.nrows(table)?;
    let mut result = HashMap::with_capacity(nrows);
    let mut start = 0;
    while start < nrows {
        let stop = (start + batch_size).min(nrows);
        for (offset, cell) in tables.read_column(table, "vid", start, stop)?.into_iter().enumerate() {
            result.insert(cell.into_string()?, start + offset);
        }
        start = stop;
    }
    Ok(result)
}

/// Returns the marker definitions with the given VIDs in the given order.
///
/// Fails if a VID is not a stored marker.
pub fn read_markers(gateway: &Gateway, vids: &[String], batch_size: usize) -> Result<Vec<SnpMarker>> {
    check_batch_size(batch_size)?;
    gateway.with_tables(|tables| {
        let table = schema::get_table(tables, MarkerTable::Definition.name())?;
        let rows = vid_rows(tables, &table, batch_size)?;
        let mut coordinates = Vec::with_capacity(vids.len());
        for vid in vids.iter() {
            let row = rows.get(vid).ok_or_else(|| KBError::NotFound(format!("unknown marker {}", vid)))?;
            coordinates.push(*row);
        }
        let mut result = Vec::with_capacity(vids.len());
        for chunk in coordinates.chunks(batch_size) {
            for cells in tables.read_coordinates(&table, chunk)? {
                result.push(SnpMarker::from_cells(cells)?);
            }
        }
        Ok(result)
    })
}

/// Returns the VIDs of all stored marker definitions.
pub fn marker_vids(gateway: &Gateway, batch_size: usize) -> Result<HashSet<String>> {
    check_batch_size(batch_size)?;
    gateway.with_tables(|tables| {
        let table = schema::get_table(tables, MarkerTable::Definition.name())?;
        Ok(vid_rows(tables, &table, batch_size)?.into_keys().collect())
    })
}

//-----------------------------------------------------------------------------
