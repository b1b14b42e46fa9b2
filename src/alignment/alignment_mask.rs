//! # Alignment degree-of-freedom mask
//!
//! An [`AlignmentMask`] says which of the six rigid-body parameters of a surface are free to
//! move in a given iteration, e.g. translations only during the first iterations and the
//! full set afterwards. The same mask applies to every alignable surface.
//!
//! The textual form is six `0`/`1` characters, character *i* being DOF *i* in the order
//! `(c0, c1, c2, r0, r1, r2)`:
//!
//! ```rust
//! use trackalign::alignment::AlignmentMask;
//!
//! let mask: AlignmentMask = "111000".parse().unwrap();
//! assert_eq!(mask, AlignmentMask::TRANSLATIONS);
//! assert_eq!(mask.to_string(), "111000");
//! ```

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{alignment_errors::AlignmentError, constants::ALIGNMENT_PARAMETERS_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AlignmentMask([bool; ALIGNMENT_PARAMETERS_SIZE]);

impl AlignmentMask {
    /// Every degree of freedom free.
    pub const ALL: AlignmentMask = AlignmentMask([true; ALIGNMENT_PARAMETERS_SIZE]);
    /// Every degree of freedom fixed.
    pub const NONE: AlignmentMask = AlignmentMask([false; ALIGNMENT_PARAMETERS_SIZE]);
    /// Only the three translations free.
    pub const TRANSLATIONS: AlignmentMask =
        AlignmentMask([true, true, true, false, false, false]);
    /// Only the three rotations free.
    pub const ROTATIONS: AlignmentMask = AlignmentMask([false, false, false, true, true, true]);

    pub fn new(free: [bool; ALIGNMENT_PARAMETERS_SIZE]) -> Self {
        AlignmentMask(free)
    }

    /// `true` if alignment parameter `dof` may move.
    pub fn is_free(&self, dof: usize) -> bool {
        self.0.get(dof).copied().unwrap_or(false)
    }

    /// Number of free parameters per surface.
    pub fn free_count(&self) -> usize {
        self.0.iter().filter(|free| **free).count()
    }

    /// Indices of the fixed parameters.
    pub fn fixed_dofs(&self) -> impl Iterator<Item = usize> + '_ {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, free)| !**free)
            .map(|(dof, _)| dof)
    }
}

impl Default for AlignmentMask {
    fn default() -> Self {
        AlignmentMask::ALL
    }
}

impl FromStr for AlignmentMask {
    type Err = AlignmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let chars: Vec<char> = s.trim().chars().collect();
        if chars.len() != ALIGNMENT_PARAMETERS_SIZE {
            return Err(AlignmentError::InvalidAlignmentConfig(format!(
                "alignment mask '{s}' must have {ALIGNMENT_PARAMETERS_SIZE} characters"
            )));
        }
        let mut free = [false; ALIGNMENT_PARAMETERS_SIZE];
        for (slot, c) in free.iter_mut().zip(chars) {
            *slot = match c {
                '1' => true,
                '0' => false,
                other => {
                    return Err(AlignmentError::InvalidAlignmentConfig(format!(
                        "invalid character '{other}' in alignment mask '{s}'"
                    )))
                }
            };
        }
        Ok(AlignmentMask(free))
    }
}

impl TryFrom<String> for AlignmentMask {
    type Error = AlignmentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AlignmentMask> for String {
    fn from(mask: AlignmentMask) -> Self {
        mask.to_string()
    }
}

impl fmt::Display for AlignmentMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for free in self.0 {
            write!(f, "{}", if free { '1' } else { '0' })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod alignment_mask_test {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let mask: AlignmentMask = "011001".parse().unwrap();
        assert!(!mask.is_free(0));
        assert!(mask.is_free(1));
        assert!(mask.is_free(2));
        assert!(!mask.is_free(3));
        assert!(mask.is_free(5));
        assert!(!mask.is_free(6));
        assert_eq!(mask.free_count(), 3);
        assert_eq!(mask.fixed_dofs().collect::<Vec<_>>(), vec![0, 3, 4]);
        assert_eq!(mask.to_string(), "011001");
    }

    #[test]
    fn test_parse_errors() {
        assert!("01100".parse::<AlignmentMask>().is_err());
        assert!("0110012".parse::<AlignmentMask>().is_err());
        assert!("01x001".parse::<AlignmentMask>().is_err());
    }

    #[test]
    fn test_default_is_all_free() {
        assert_eq!(AlignmentMask::default(), AlignmentMask::ALL);
        assert_eq!(AlignmentMask::ALL.free_count(), 6);
        assert_eq!(AlignmentMask::NONE.free_count(), 0);
    }

    #[test]
    fn test_serde_string_form() {
        let mask: AlignmentMask = serde_json::from_str("\"000111\"").unwrap();
        assert_eq!(mask, AlignmentMask::ROTATIONS);
        assert_eq!(serde_json::to_string(&mask).unwrap(), "\"000111\"");
        assert!(serde_json::from_str::<AlignmentMask>("\"0001\"").is_err());
    }
}
