//! # Word Error Rate
//!
//! Word-level Levenshtein alignment and the aggregate WER used by every
//! experiment.
//!
//! ## Definition:
//! `WER = 100 · Σ edit_distance(ref_i, hyp_i) / Σ |ref_i|`
//!
//! Sentences are split on whitespace; no case or punctuation normalization
//! is applied. A corpus with zero reference words scores 0 when there are no
//! errors and 100 otherwise.

use crate::error::{HarnessError, HarnessResult};
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

/// Edit operations of one alignment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditOps {
    pub insertions: usize,
    pub deletions: usize,
    pub substitutions: usize,
}

impl EditOps {
    pub fn total(&self) -> usize {
        self.insertions + self.deletions + self.substitutions
    }
}

impl AddAssign for EditOps {
    fn add_assign(&mut self, other: Self) {
        self.insertions += other.insertions;
        self.deletions += other.deletions;
        self.substitutions += other.substitutions;
    }
}

/// Minimum number of token insertions, deletions and substitutions turning
/// `reference` into `hypothesis`.
pub fn edit_distance<T: PartialEq>(reference: &[T], hypothesis: &[T]) -> usize {
    align(reference, hypothesis).total()
}

/// Levenshtein alignment with two rolling rows, keeping the operation mix of
/// the best path in every cell.
pub fn align<T: PartialEq>(reference: &[T], hypothesis: &[T]) -> EditOps {
    let n = hypothesis.len();

    // Row 0: hypothesis prefix against an empty reference is all insertions
    let mut prev: Vec<EditOps> = (0..=n)
        .map(|j| EditOps {
            insertions: j,
            ..Default::default()
        })
        .collect();
    let mut curr = vec![EditOps::default(); n + 1];

    for (i, ref_token) in reference.iter().enumerate() {
        curr[0] = EditOps {
            deletions: i + 1,
            ..Default::default()
        };
        for (j, hyp_token) in hypothesis.iter().enumerate() {
            let mut diagonal = prev[j];
            if ref_token != hyp_token {
                diagonal.substitutions += 1;
            }
            let mut deletion = prev[j + 1];
            deletion.deletions += 1;
            let mut insertion = curr[j];
            insertion.insertions += 1;

            // Ties prefer substitution, then deletion
            curr[j + 1] = [diagonal, deletion, insertion]
                .into_iter()
                .min_by_key(EditOps::total)
                .unwrap_or(diagonal);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[n]
}

/// Accumulated WER statistics over a corpus.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WerStats {
    pub ops: EditOps,
    pub reference_words: usize,
    pub scored_sentences: usize,
    pub erroneous_sentences: usize,
}

impl WerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Score one reference/hypothesis pair.
    pub fn add(&mut self, reference: &str, hypothesis: &str) {
        let ref_words: Vec<&str> = reference.split_whitespace().collect();
        let hyp_words: Vec<&str> = hypothesis.split_whitespace().collect();
        let ops = align(&ref_words, &hyp_words);

        self.reference_words += ref_words.len();
        self.scored_sentences += 1;
        if ops.total() > 0 {
            self.erroneous_sentences += 1;
        }
        self.ops += ops;
    }

    pub fn wer(&self) -> f64 {
        let errors = self.ops.total();
        if self.reference_words == 0 {
            return if errors == 0 { 0.0 } else { 100.0 };
        }
        100.0 * errors as f64 / self.reference_words as f64
    }

    /// Sentence error rate in percent.
    pub fn ser(&self) -> f64 {
        if self.scored_sentences == 0 {
            return 0.0;
        }
        100.0 * self.erroneous_sentences as f64 / self.scored_sentences as f64
    }
}

/// Aggregate WER (%) of `hypotheses` against `references`.
///
/// ## Returns:
/// - **Ok(wer)**: total edit distance over total reference words, times 100
/// - **Err(HarnessError::Metric)**: the two lists differ in length
pub fn compute_wer<R, H>(references: &[R], hypotheses: &[H]) -> HarnessResult<f64>
where
    R: AsRef<str>,
    H: AsRef<str>,
{
    Ok(compute_wer_stats(references, hypotheses)?.wer())
}

/// Like [`compute_wer`] but returns the full statistics.
pub fn compute_wer_stats<R, H>(references: &[R], hypotheses: &[H]) -> HarnessResult<WerStats>
where
    R: AsRef<str>,
    H: AsRef<str>,
{
    if references.len() != hypotheses.len() {
        return Err(HarnessError::Metric(
            "Number of references is not equal to the number of hypotheses".to_string(),
        ));
    }
    let mut stats = WerStats::new();
    for (reference, hypothesis) in references.iter().zip(hypotheses) {
        stats.add(reference.as_ref(), hypothesis.as_ref());
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raises_on_mismatched_lengths() {
        let err = compute_wer(&["a", "b"], &["a"]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Number of references is not equal to the number of hypotheses"
        );
    }

    #[test]
    fn test_single_substitution() {
        let wer = compute_wer(&["reference string"], &["hypothesis string"]).unwrap();
        assert!((wer - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_two_of_five_words_wrong() {
        let wer = compute_wer(&["this reference is a list"], &["this hypothesis is a string"]).unwrap();
        assert!((wer - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_completely_wrong() {
        let wer = compute_wer(&["both of these are lists"], &["this is a list too"]).unwrap();
        assert!((wer - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_aggregates_over_corpus_not_sentences() {
        // 1 error over 1 word and 0 errors over 3 words → 25%, not 50%
        let wer = compute_wer(&["a", "b c d"], &["x", "b c d"]).unwrap();
        assert!((wer - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_references() {
        assert_eq!(compute_wer(&[""], &[""]).unwrap(), 0.0);
        assert_eq!(compute_wer(&[""], &["extra"]).unwrap(), 100.0);
        assert_eq!(compute_wer::<&str, &str>(&[], &[]).unwrap(), 0.0);
    }

    #[test]
    fn test_edit_distance_classic_cases() {
        let kitten: Vec<char> = "kitten".chars().collect();
        let sitting: Vec<char> = "sitting".chars().collect();
        assert_eq!(edit_distance(&kitten, &sitting), 3);
        assert_eq!(edit_distance::<char>(&[], &['a', 'b']), 2);
        assert_eq!(edit_distance(&['a', 'b'], &[]), 2);
    }

    #[test]
    fn test_alignment_breakdown() {
        let ops = align(&["a", "b", "c"], &["a", "x", "c", "d"]);
        assert_eq!(
            ops,
            EditOps {
                insertions: 1,
                deletions: 0,
                substitutions: 1
            }
        );
    }

    #[test]
    fn test_stats_count_sentences() {
        let stats = compute_wer_stats(&["a b", "c"], &["a b", "d"]).unwrap();
        assert_eq!(stats.scored_sentences, 2);
        assert_eq!(stats.erroneous_sentences, 1);
        assert_eq!(stats.reference_words, 3);
        assert!((stats.ser() - 50.0).abs() < 1e-9);
    }
}
