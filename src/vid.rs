//! Domain identifiers (VIDs) and unique keys.

use std::fmt::Display;

//-----------------------------------------------------------------------------

/// Prefix shared by all VIDs.
pub const VID_PREFIX: &str = "V0";

/// Visible length of a VID.
pub const VID_LENGTH: usize = 34;

/// Separator used in unique keys.
///
/// The character is not allowed inside any field that takes part in a unique key.
pub const KEY_SEPARATOR: char = '\u{1f}';

/// Returns a fresh VID.
///
/// A VID is [`VID_PREFIX`] followed by 128 random bits as uppercase hexadecimal digits.
///
/// # Examples
///
/// ```
/// use genokb::vid;
///
/// let a = vid::make_vid();
/// let b = vid::make_vid();
/// assert_eq!(a.len(), vid::VID_LENGTH);
/// assert!(vid::is_vid(&a));
/// assert_ne!(a, b);
/// ```
pub fn make_vid() -> String {
    let bits: u128 = rand::random();
    format!("{}{:032X}", VID_PREFIX, bits)
}

/// Returns `true` if the string looks like a VID.
pub fn is_vid(value: &str) -> bool {
    value.len() == VID_LENGTH
        && value.starts_with(VID_PREFIX)
        && value[VID_PREFIX.len()..].bytes().all(|x| x.is_ascii_digit() || (b'A'..=b'F').contains(&x))
}

/// Builds a unique key from the given parts.
///
/// The key is the concatenation of the string representations of the parts, separated by [`KEY_SEPARATOR`].
/// The same ordered parts always yield the same key.
pub fn make_unique_key<T: Display>(parts: &[T]) -> String {
    let mut key = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(KEY_SEPARATOR);
        }
        key.push_str(&part.to_string());
    }
    key
}

//-----------------------------------------------------------------------------


//-----------------------------------------------------------------------------
