//! # GenoKB: a knowledge base for SNP genotyping data.
//!
//! This crate stores the data of a genotyping laboratory in a single SQLite database.
//! The database plays the role of a remote backend that is accessed through short-lived authenticated sessions.
//! See [`Gateway`] for the backend and [`KnowledgeBase`] for the main interface.
//!
//! ### Basic concepts
//!
//! Every stored object is identified by a VID, a 34-character string generated by [`vid::make_vid`].
//!
//! Metadata objects such as studies, individuals, and samples are typed [`Entity`] values.
//! Their classes form a static tree in [`objects::model`].
//! Enumerated fields travel to the backend as integer identifiers, which are translated by an [`EnumCache`].
//!
//! SNP markers live in four fixed tables:
//!
//! * `snp_definition.h5`: marker definitions with a SNP mask (see [`snp`]).
//! * `snp_alignment.h5`: alignments of the markers to reference genomes.
//! * `snp_set_def.h5`: markers set descriptors, one for each (maker, model) pair.
//! * `snp_set.h5`: ordered members of each markers set.
//!
//! Rows are appended in batches and read back in windows, optionally filtered by a [`backend::Selector`].
//! See [`markers`] and [`schema`] for the details.
//!
//! A genotype data object ([`Gdo`]) stores the genotype probabilities and confidences of one sample over the markers of one set.
//! The GDOs of a set are stored in a per-set table that is managed by [`GdoRepository`].
//! Probabilities are packed as little-endian `f32` values, and trailing zero bytes are trimmed by the backend.
//!
//! [`pedigree`] contains tools for analysing family structure and splitting large families into subfamilies.

pub mod backend;
pub mod config;
pub mod error;
pub mod gdo;
pub mod kb;
pub mod markers;
pub mod objects;
pub mod pedigree;
pub mod schema;
pub mod snp;
pub mod utils;
pub mod vid;

#[cfg(test)]
mod internal;

pub use backend::Gateway;
pub use config::{KBConfig, KBParams};
pub use error::{KBError, Result};
pub use gdo::{Gdo, GdoRepository};
pub use kb::KnowledgeBase;
pub use objects::{Entity, EnumCache, Value};
