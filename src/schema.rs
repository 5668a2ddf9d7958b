//! Table schemas for SNP markers and genotype data objects.
//!
//! There are four marker tables shared by the whole knowledge base and one GDO repository table per markers set.
//! String column widths are part of the persisted format; changing them is a breaking change.

use crate::backend::{Column, Table, TableSchema, TableService};
use crate::vid::VID_LENGTH;
use crate::Result;

use tracing::info;


//-----------------------------------------------------------------------------

/// Width of the short string columns of marker definitions.
pub const LABEL_WIDTH: usize = 16;

/// Width of the mask column.
pub const MASK_WIDTH: usize = 69;

/// Width of the maker and model columns.
pub const MAKER_WIDTH: usize = 32;

/// Number of bytes in a serialized probability or confidence value.
pub const FLOAT_BYTES: usize = std::mem::size_of::<f32>();

/// The shared marker tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MarkerTable {
    /// SNP marker definitions.
    Definition,
    /// Alignments of markers to reference genomes.
    Alignment,
    /// Markers set descriptors.
    SetDefinition,
    /// Markers set members.
    SetMember,
}

impl MarkerTable {
    /// All marker tables.
    pub const ALL: [MarkerTable; 4] = [
        MarkerTable::Definition, MarkerTable::Alignment, MarkerTable::SetDefinition, MarkerTable::SetMember,
    ];

    /// Returns the catalog name of the table.
    pub fn name(&self) -> &'static str {
        match self {
            MarkerTable::Definition => "snp_definition.h5",
            MarkerTable::Alignment => "snp_alignment.h5",
            MarkerTable::SetDefinition => "snp_set_def.h5",
            MarkerTable::SetMember => "snp_set.h5",
        }
    }

    /// Returns the schema of the table.
    pub fn schema(&self) -> TableSchema {
        let columns = match self {
            MarkerTable::Definition => vec![
                Column::string("vid", VID_LENGTH, "marker VID"),
                Column::string("source", LABEL_WIDTH, "origin of the marker definition"),
                Column::string("context", LABEL_WIDTH, "context of the definition"),
                Column::string("label", LABEL_WIDTH, "marker label within the context"),
                Column::string("rs_label", LABEL_WIDTH, "dbSNP label, if known"),
                Column::string("mask", MASK_WIDTH, "SNP mask in the form LEFT[A/B]RIGHT"),
                Column::string("op_vid", VID_LENGTH, "last operation that modified the row"),
            ],
            MarkerTable::Alignment => vec![
                Column::string("marker_vid", VID_LENGTH, "aligned marker VID"),
                Column::string("ref_genome", LABEL_WIDTH, "reference genome"),
                Column::long("chromosome", "chromosome in 1..24, X = 23, Y = 24"),
                Column::long("pos", "1-based position of the SNP within the chromosome"),
                Column::long("global_pos", "chromosome * 10^10 + pos"),
                Column::bool("strand", "true for the forward strand"),
                Column::string("allele", 1, "allele on the reference genome"),
                Column::long("copies", "number of hits of the mask on the genome"),
                Column::string("op_vid", VID_LENGTH, "last operation that modified the row"),
            ],
            MarkerTable::SetDefinition => vec![
                Column::string("vid", VID_LENGTH, "markers set VID"),
                Column::string("maker", MAKER_WIDTH, "technology maker"),
                Column::string("model", MAKER_WIDTH, "technology model"),
                Column::string("op_vid", VID_LENGTH, "last operation that modified the row"),
            ],
            MarkerTable::SetMember => vec![
                Column::string("vid", VID_LENGTH, "markers set VID"),
                Column::string("marker_vid", VID_LENGTH, "member marker VID"),
                Column::long("marker_indx", "position of the marker within the set"),
                Column::bool("allele_flip", "true if the technology swaps the A and B alleles"),
                Column::string("op_vid", VID_LENGTH, "last operation that modified the row"),
            ],
        };
        TableSchema::new(columns)
    }
}

//-----------------------------------------------------------------------------

/// Returns the name of the GDO repository table for the markers set.
pub fn gdo_table_name(set_vid: &str) -> String {
    format!("{}.h5", set_vid)
}

/// Returns the schema of a GDO repository for a markers set with `n` markers.
///
/// Probabilities take `2 * n` and confidences `n` little-endian `f32` values.
pub fn gdo_schema(n: usize) -> TableSchema {
    TableSchema::new(vec![
        Column::string("vid", VID_LENGTH, "GDO VID"),
        Column::string("op_vid", VID_LENGTH, "last operation that modified the row"),
        Column::string("probs", 2 * n * FLOAT_BYTES, "packed probabilities of the AA and BB genotypes"),
        Column::string("confidence", n * FLOAT_BYTES, "packed confidence values"),
    ])
}

//-----------------------------------------------------------------------------

/// Creates the table unless a table with the same name exists.
///
/// Returns `true` if the table was created.
pub fn create_if_missing(tables: &mut TableService, name: &str, schema: &TableSchema) -> Result<bool> {
    let created = tables.create_if_missing(name, schema)?;
    if created {
        info!("Created table {}", name);
    }
    Ok(created)
}

/// Returns `true` if the table exists.
pub fn table_exists(tables: &mut TableService, name: &str) -> Result<bool> {
    tables.table_exists(name)
}

/// Removes every catalog entry with the given name.
pub fn delete(tables: &mut TableService, name: &str) -> Result<usize> {
    let removed = tables.delete_table(name)?;
    if removed > 0 {
        info!("Deleted table {}", name);
    }
    Ok(removed)
}

/// Resolves the table with the given name.
pub fn get_table(tables: &mut TableService, name: &str) -> Result<Table> {
    tables.get_table(name)
}

/// Creates all missing marker tables and returns the number of created tables.
pub fn create_marker_tables(tables: &mut TableService) -> Result<usize> {
    let mut created = 0;
    for table in MarkerTable::ALL.iter() {
        if create_if_missing(tables, table.name(), &table.schema())? {
            created += 1;
        }
    }
    Ok(created)
}

//-----------------------------------------------------------------------------
