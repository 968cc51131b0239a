use crate::alphabet::alphabet::{Alphabet, StateCode};
use crate::{make_error, make_internal_report};
use eyre::Report;
use std::collections::HashMap;

/// A deduplicated alignment column: one state code per taxon, plus the number
/// of alignment sites showing this column. Immutable after construction.
#[derive(Clone, Debug)]
pub struct Pattern {
  states: Vec<StateCode>,
  frequency: f64,
  /// Intersection of the resolved state sets of all taxa. Nonzero iff the
  /// column is compatible with an invariant site.
  intersection: u32,
  /// Set when the intersection is a single canonical state
  const_state: Option<usize>,
  /// Synthetic pattern appended for ascertainment-bias correction
  is_unobserved: bool,
}

impl Pattern {
  fn new(alphabet: &Alphabet, states: Vec<StateCode>, frequency: f64, is_unobserved: bool) -> Self {
    let intersection = states.iter().fold(alphabet.mask(alphabet.unknown()), |acc, &code| {
      acc & alphabet.mask(code)
    });
    let const_state = (intersection.count_ones() == 1).then(|| intersection.trailing_zeros() as usize);
    Self {
      states,
      frequency,
      intersection,
      const_state,
      is_unobserved,
    }
  }

  #[inline]
  pub fn state(&self, taxon: usize) -> StateCode {
    self.states[taxon]
  }

  #[inline]
  pub fn frequency(&self) -> f64 {
    self.frequency
  }

  #[inline]
  pub const fn intersection(&self) -> u32 {
    self.intersection
  }

  #[inline]
  pub const fn const_state(&self) -> Option<usize> {
    self.const_state
  }

  #[inline]
  pub const fn is_unobserved(&self) -> bool {
    self.is_unobserved
  }

  /// Whether an invariant site could have produced this column
  #[inline]
  pub const fn is_invariant_capable(&self) -> bool {
    self.intersection != 0
  }
}

/// Deduplicated site patterns of an alignment, observed patterns first,
/// optionally followed by the synthetic unobserved constant patterns used for
/// ascertainment-bias correction.
#[derive(Clone, Debug)]
pub struct PatternStore {
  alphabet: Alphabet,
  patterns: Vec<Pattern>,
  n_observed: usize,
  n_taxa: usize,
  n_sites: usize,
}

impl PatternStore {
  /// Deduplicates raw alignment columns (one `Vec<StateCode>` per site)
  pub fn from_columns(alphabet: Alphabet, n_taxa: usize, columns: &[Vec<StateCode>]) -> Result<Self, Report> {
    if columns.is_empty() {
      return make_error!("Alignment must contain at least one site");
    }
    let mut index: HashMap<&[StateCode], usize> = HashMap::new();
    let mut patterns: Vec<Pattern> = Vec::new();
    for column in columns {
      if column.len() != n_taxa {
        return make_error!(
          "Alignment column has {} entries but the alignment has {n_taxa} taxa",
          column.len()
        );
      }
      for &code in column {
        if code as usize >= alphabet.n_codes() {
          return make_error!("State code {code} is outside the alphabet's code table");
        }
      }
      match index.get(column.as_slice()) {
        Some(&ptn) => patterns[ptn].frequency += 1.0,
        None => {
          patterns.push(Pattern::new(&alphabet, column.clone(), 1.0, false));
          index.insert(column.as_slice(), patterns.len() - 1);
        }
      }
    }
    let n_observed = patterns.len();
    Ok(Self {
      alphabet,
      patterns,
      n_observed,
      n_taxa,
      n_sites: columns.len(),
    })
  }

  /// Builds the store from one aligned sequence string per taxon
  pub fn from_sequences<S: AsRef<str>>(alphabet: Alphabet, seqs: &[S]) -> Result<Self, Report> {
    let n_taxa = seqs.len();
    if n_taxa < 2 {
      return make_error!("Alignment must contain at least 2 sequences, got {n_taxa}");
    }
    let rows: Vec<Vec<StateCode>> = seqs
      .iter()
      .map(|seq| seq.as_ref().chars().map(|c| alphabet.code_of_char(c)).collect())
      .collect::<Result<_, Report>>()?;
    let n_sites = rows[0].len();
    if rows.iter().any(|row| row.len() != n_sites) {
      return make_error!("All sequences must have the same length");
    }
    let columns: Vec<Vec<StateCode>> = (0..n_sites)
      .map(|site| rows.iter().map(|row| row[site]).collect())
      .collect();
    Self::from_columns(alphabet, n_taxa, &columns)
  }

  /// Appends one synthetic constant pattern per canonical state, with zero
  /// frequency. Their likelihood mass is subtracted from the tree
  /// log-likelihood to correct for the ascertainment constraint that constant
  /// sites cannot appear in the alignment.
  #[must_use]
  pub fn with_ascertainment_correction(mut self) -> Self {
    self.patterns.truncate(self.n_observed);
    for state in 0..self.alphabet.n_states() {
      let states = vec![state as StateCode; self.n_taxa];
      self.patterns.push(Pattern::new(&self.alphabet, states, 0.0, true));
    }
    self
  }

  #[inline]
  pub const fn alphabet(&self) -> &Alphabet {
    &self.alphabet
  }

  /// Observed plus unobserved pattern count; buffers are sized to this
  #[inline]
  pub fn len(&self) -> usize {
    self.patterns.len()
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.patterns.is_empty()
  }

  #[inline]
  pub const fn n_observed(&self) -> usize {
    self.n_observed
  }

  #[inline]
  pub fn n_unobserved(&self) -> usize {
    self.patterns.len() - self.n_observed
  }

  #[inline]
  pub const fn n_taxa(&self) -> usize {
    self.n_taxa
  }

  #[inline]
  pub const fn n_sites(&self) -> usize {
    self.n_sites
  }

  #[inline]
  pub fn pattern(&self, ptn: usize) -> &Pattern {
    &self.patterns[ptn]
  }

  pub fn patterns(&self) -> &[Pattern] {
    &self.patterns
  }

  pub fn taxon_codes(&self, taxon: usize) -> Result<Vec<StateCode>, Report> {
    if taxon >= self.n_taxa {
      return Err(make_internal_report!(
        "Taxon index {taxon} is out of bounds for an alignment of {} taxa",
        self.n_taxa
      ));
    }
    Ok(self.patterns.iter().map(|ptn| ptn.state(taxon)).collect())
  }
}
