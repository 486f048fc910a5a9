//! Token id → text decoding for CTC output.
//!
//! Character models ship a `vocab.json` (token → id map, `|` as the word
//! delimiter); subword models ship a `tokenizer.json` handled by `tokenizers`.

use crate::error::{HarnessError, HarnessResult};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tokenizers::Tokenizer;

/// Turns a collapsed CTC id sequence into text.
pub trait TokenDecoder: fmt::Debug + Send + Sync {
    fn decode(&self, ids: &[u32]) -> HarnessResult<String>;

    fn vocab_size(&self) -> usize;
}

const WORD_DELIMITER: &str = "|";
const SPECIAL_TOKENS: [&str; 4] = ["<pad>", "<s>", "</s>", "<unk>"];

/// Character-level vocabulary.
#[derive(Debug, Clone)]
pub struct CharVocabulary {
    tokens: Vec<String>,
}

impl CharVocabulary {
    /// Tokens ordered by id.
    pub fn new(tokens: Vec<String>) -> Self {
        Self { tokens }
    }

    /// Read `vocab.json`: either `{"token": id, ...}` or `["token", ...]`.
    pub fn from_file(path: &Path) -> HarnessResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> HarnessResult<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        match value {
            serde_json::Value::Array(_) => Ok(Self::new(serde_json::from_value(value)?)),
            serde_json::Value::Object(_) => {
                let map: HashMap<String, usize> = serde_json::from_value(value)?;
                let size = map.values().max().map_or(0, |max| max + 1);
                let mut tokens = vec![String::new(); size];
                for (token, id) in map {
                    tokens[id] = token;
                }
                Ok(Self::new(tokens))
            }
            _ => Err(HarnessError::Model(
                "vocab.json must be an object or an array".to_string(),
            )),
        }
    }
}

impl TokenDecoder for CharVocabulary {
    fn decode(&self, ids: &[u32]) -> HarnessResult<String> {
        let mut text = String::new();
        for &id in ids {
            let token = self.tokens.get(id as usize).ok_or_else(|| {
                HarnessError::Model(format!("token id {} outside vocabulary of {}", id, self.tokens.len()))
            })?;
            if SPECIAL_TOKENS.contains(&token.as_str()) {
                continue;
            }
            if token == WORD_DELIMITER {
                text.push(' ');
            } else {
                text.push_str(token);
            }
        }
        Ok(text.split_whitespace().collect::<Vec<_>>().join(" "))
    }

    fn vocab_size(&self) -> usize {
        self.tokens.len()
    }
}

/// Subword decoding through a Hugging Face tokenizer.
#[derive(Clone)]
pub struct HfTokenizer {
    tokenizer: Tokenizer,
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> HarnessResult<Self> {
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| HarnessError::Model(format!("Failed to load tokenizer: {}", e)))?;
        Ok(Self { tokenizer })
    }
}

impl fmt::Debug for HfTokenizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HfTokenizer")
            .field("vocab_size", &self.vocab_size())
            .finish()
    }
}

impl TokenDecoder for HfTokenizer {
    fn decode(&self, ids: &[u32]) -> HarnessResult<String> {
        self.tokenizer
            .decode(ids, true)
            .map_err(|e| HarnessError::Model(format!("Failed to decode tokens: {}", e)))
    }

    fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOCAB: &str = r#"{"<pad>": 0, "<s>": 1, "</s>": 2, "<unk>": 3, "|": 4, "A": 5, "B": 6, "C": 7}"#;

    #[test]
    fn test_map_vocab_orders_by_id() {
        let vocab = CharVocabulary::from_json(VOCAB).unwrap();
        assert_eq!(vocab.vocab_size(), 8);
        assert_eq!(vocab.decode(&[5, 6, 7]).unwrap(), "ABC");
    }

    #[test]
    fn test_delimiter_and_specials() {
        let vocab = CharVocabulary::from_json(VOCAB).unwrap();
        // "<s> A B | | C </s>"
        assert_eq!(vocab.decode(&[1, 5, 6, 4, 4, 7, 2]).unwrap(), "AB C");
        assert_eq!(vocab.decode(&[4, 5, 4]).unwrap(), "A");
    }

    #[test]
    fn test_array_vocab() {
        let vocab = CharVocabulary::from_json(r#"["<pad>", "|", "X"]"#).unwrap();
        assert_eq!(vocab.decode(&[2, 1, 2]).unwrap(), "X X");
    }

    #[test]
    fn test_out_of_range_id_is_an_error() {
        let vocab = CharVocabulary::from_json(VOCAB).unwrap();
        assert!(vocab.decode(&[42]).is_err());
    }

    #[test]
    fn test_rejects_scalar_json() {
        assert!(CharVocabulary::from_json("7").is_err());
    }
}
