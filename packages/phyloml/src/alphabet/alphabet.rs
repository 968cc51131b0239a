use crate::{make_error, make_internal_error};
use eyre::Report;
use itertools::Itertools;

/// Index into the code table of an [`Alphabet`]. Codes `0..n_states` are the
/// canonical states; higher codes are ambiguity sets; the last code is the
/// "unknown" sentinel whose set contains every canonical state.
pub type StateCode = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlphabetName {
  Binary,
  Nuc,
  Custom,
}

/// Finite state alphabet with ambiguity codes. Each code resolves to a bitmask
/// over canonical states; canonical code `i` resolves to `1 << i`.
#[derive(Clone, Debug)]
pub struct Alphabet {
  name: AlphabetName,
  n_states: usize,
  chars: Vec<char>,
  masks: Vec<u32>,
  unknown: StateCode,
}

impl Alphabet {
  pub fn new(name: AlphabetName, n_states: usize, chars: Vec<char>, masks: Vec<u32>) -> Result<Self, Report> {
    if n_states < 2 || n_states > 32 {
      return make_error!("Alphabet must have between 2 and 32 canonical states, got {n_states}");
    }
    if chars.len() != masks.len() {
      return make_internal_error!(
        "Alphabet character table ({}) and mask table ({}) differ in length",
        chars.len(),
        masks.len()
      );
    }
    let full = Self::full_mask(n_states);
    for (code, &mask) in masks.iter().enumerate() {
      if code < n_states && mask != 1 << code {
        return make_internal_error!("Canonical state {code} must resolve to itself");
      }
      if mask == 0 || mask & !full != 0 {
        return make_internal_error!("Ambiguity mask {mask:#b} of code {code} is outside the canonical state space");
      }
    }
    let unknown = match masks.iter().position(|&mask| mask == full) {
      Some(pos) if pos >= n_states => pos as StateCode,
      _ => return make_error!("Alphabet must contain exactly one unknown code resolving to all canonical states"),
    };
    Ok(Self {
      name,
      n_states,
      chars,
      masks,
      unknown,
    })
  }

  /// Nucleotide alphabet: A C G T, IUPAC ambiguity codes, N/-/? as unknown
  pub fn dna() -> Self {
    #[rustfmt::skip]
    let table: &[(char, u32)] = &[
      ('A', 0b0001), ('C', 0b0010), ('G', 0b0100), ('T', 0b1000),
      ('R', 0b0101), ('Y', 0b1010), ('S', 0b0110), ('W', 0b1001),
      ('K', 0b1100), ('M', 0b0011),
      ('B', 0b1110), ('D', 0b1101), ('H', 0b1011), ('V', 0b0111),
      ('N', 0b1111),
    ];
    let (chars, masks) = table.iter().copied().unzip();
    Self::new(AlphabetName::Nuc, 4, chars, masks).expect("Built-in nucleotide alphabet is valid")
  }

  /// Two-state (presence/absence) alphabet
  pub fn binary() -> Self {
    Self::new(AlphabetName::Binary, 2, vec!['0', '1', '?'], vec![0b01, 0b10, 0b11])
      .expect("Built-in binary alphabet is valid")
  }

  const fn full_mask(n_states: usize) -> u32 {
    if n_states == 32 {
      u32::MAX
    } else {
      (1 << n_states) - 1
    }
  }

  #[inline]
  pub const fn name(&self) -> AlphabetName {
    self.name
  }

  #[inline]
  pub const fn n_states(&self) -> usize {
    self.n_states
  }

  /// Total number of codes, including ambiguity codes and the unknown sentinel
  #[inline]
  pub fn n_codes(&self) -> usize {
    self.masks.len()
  }

  #[inline]
  pub const fn unknown(&self) -> StateCode {
    self.unknown
  }

  #[inline]
  pub fn is_canonical(&self, code: StateCode) -> bool {
    (code as usize) < self.n_states
  }

  #[inline]
  pub fn mask(&self, code: StateCode) -> u32 {
    self.masks[code as usize]
  }

  /// Canonical states contained in the resolved set of `code`
  pub fn resolve(&self, code: StateCode) -> impl Iterator<Item = usize> + '_ {
    let mask = self.mask(code);
    (0..self.n_states).filter(move |&i| mask & (1 << i) != 0)
  }

  pub fn char(&self, code: StateCode) -> char {
    self.chars[code as usize]
  }

  pub fn code_of_char(&self, c: char) -> Result<StateCode, Report> {
    // Gap and '?' are treated as unknown for any alphabet
    if c == '-' || c == '?' || c == '.' {
      return Ok(self.unknown);
    }
    let c = c.to_ascii_uppercase();
    self
      .chars
      .iter()
      .position(|&x| x == c)
      .map(|pos| pos as StateCode)
      .ok_or_else(|| {
        let valid = self.chars.iter().join(", ");
        crate::make_report!("Character '{c}' is not in the alphabet. Valid characters are: {valid}")
      })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use eyre::Report;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  #[test]
  fn test_dna_alphabet_shape() {
    let alphabet = Alphabet::dna();
    assert_eq!(alphabet.n_states(), 4);
    assert_eq!(alphabet.n_codes(), 15);
    assert_eq!(alphabet.unknown(), 14);
    assert_eq!(alphabet.mask(alphabet.unknown()), 0b1111);
  }

  #[rstest]
  #[case('A', vec![0])]
  #[case('t', vec![3])]
  #[case('R', vec![0, 2])]
  #[case('B', vec![1, 2, 3])]
  #[case('-', vec![0, 1, 2, 3])]
  fn test_dna_resolution(#[case] c: char, #[case] expected: Vec<usize>) -> Result<(), Report> {
    let alphabet = Alphabet::dna();
    let code = alphabet.code_of_char(c)?;
    assert_eq!(alphabet.resolve(code).collect::<Vec<usize>>(), expected);
    Ok(())
  }

  #[test]
  fn test_rejects_missing_unknown() {
    assert!(Alphabet::new(AlphabetName::Custom, 2, vec!['a', 'b'], vec![0b01, 0b10]).is_err());
  }

  #[test]
  fn test_rejects_unknown_char() {
    let alphabet = Alphabet::binary();
    assert!(alphabet.code_of_char('X').is_err());
  }
}
