//! SNP masks.
//!
//! A mask describes a SNP in its sequence context as `LEFT_FLANK[A/B]RIGHT_FLANK`,
//! where `A` and `B` are the two alleles.
//!
//! # Examples
//!
//! ```
//! use genokb::snp;
//!
//! let mask = "GGATAC[A/G]CTTGCA";
//! let (left, alleles, right) = snp::split_mask(mask).unwrap();
//! assert_eq!(left, "GGATAC");
//! assert_eq!(alleles, (String::from("A"), String::from("G")));
//! assert_eq!(right, "CTTGCA");
//! assert_eq!(snp::join_mask(&left, (&alleles.0, &alleles.1), &right), mask);
//! assert_eq!(snp::rc_mask(mask).unwrap(), "TGCAAG[T/C]GTATCC");
//! ```

use crate::{KBError, Result};

//-----------------------------------------------------------------------------

/// Splits a mask into the left flank, the two alleles, and the right flank.
pub fn split_mask(mask: &str) -> Result<(String, (String, String), String)> {
    let invalid = || KBError::Validation(format!("invalid SNP mask {:?}", mask));
    let open = mask.find('[').ok_or_else(invalid)?;
    let close = mask.find(']').ok_or_else(invalid)?;
    if close < open || mask.matches('[').count() != 1 || mask.matches(']').count() != 1 {
        return Err(invalid());
    }
    let (a, b) = mask[open + 1..close].split_once('/').ok_or_else(invalid)?;
    if a.is_empty() || b.is_empty() || b.contains('/') {
        return Err(invalid());
    }
    Ok((mask[..open].to_string(), (a.to_string(), b.to_string()), mask[close + 1..].to_string()))
}

/// Builds a mask from the flanks and the alleles.
pub fn join_mask(left: &str, alleles: (&str, &str), right: &str) -> String {
    format!("{}[{}/{}]{}", left, alleles.0, alleles.1, right)
}

fn complement(base: char) -> Option<char> {
    let result = match base {
        'A' => 'T', 'C' => 'G', 'G' => 'C', 'T' => 'A', 'N' => 'N',
        'a' => 't', 'c' => 'g', 'g' => 'c', 't' => 'a', 'n' => 'n',
        '-' => '-',
        _ => return None,
    };
    Some(result)
}

/// Returns the reverse complement of a sequence.
pub fn reverse_complement(sequence: &str) -> Result<String> {
    sequence.chars().rev().map(|c| {
        complement(c).ok_or_else(|| KBError::Validation(format!("invalid base {:?} in sequence {}", c, sequence)))
    }).collect()
}

/// Returns the mask of the same SNP on the opposite strand.
///
/// The flanks are reverse complemented and swapped, and the alleles are complemented in place.
pub fn rc_mask(mask: &str) -> Result<String> {
    let (left, (a, b), right) = split_mask(mask)?;
    let left = reverse_complement(&left)?;
    let right = reverse_complement(&right)?;
    let a = reverse_complement(&a)?;
    let b = reverse_complement(&b)?;
    Ok(join_mask(&right, (&a, &b), &left))
}

//-----------------------------------------------------------------------------


//-----------------------------------------------------------------------------
