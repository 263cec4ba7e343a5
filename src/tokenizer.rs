use std::collections::{BTreeSet, HashMap};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::constants::{EOS_CHAR, EOS_TOKEN};

/// Character-level tokenizer. Every distinct character of the corpus is one
/// token; `'\0'` is always token 0 and marks the end of a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vocabulary", into = "Vocabulary")]
pub struct Tokenizer {
    characters: Vec<char>,
    ids: HashMap<char, i64>,
}

/// On-disk form of a [`Tokenizer`]: just the characters, in id order.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Vocabulary {
    characters: Vec<char>,
}

impl From<Vocabulary> for Tokenizer {
    fn from(vocabulary: Vocabulary) -> Self {
        Tokenizer::from_characters(vocabulary.characters)
    }
}

impl From<Tokenizer> for Vocabulary {
    fn from(tokenizer: Tokenizer) -> Self {
        Vocabulary {
            characters: tokenizer.characters,
        }
    }
}

impl Tokenizer {
    /// Builds the vocabulary from every character in `texts`.
    pub fn from_corpus<'a>(texts: impl IntoIterator<Item = &'a str>) -> Self {
        let mut characters: BTreeSet<char> = texts.into_iter().flat_map(str::chars).collect();
        characters.remove(&EOS_CHAR);
        Tokenizer::from_characters(std::iter::once(EOS_CHAR).chain(characters).collect())
    }

    fn from_characters(characters: Vec<char>) -> Self {
        let ids = characters
            .iter()
            .enumerate()
            .map(|(id, &c)| (c, id as i64))
            .collect();
        Tokenizer { characters, ids }
    }

    pub fn vocab_size(&self) -> i64 {
        self.characters.len() as i64
    }

    pub fn encode(&self, text: &str) -> Result<Vec<i64>> {
        text.chars()
            .map(|c| {
                self.ids
                    .get(&c)
                    .copied()
                    .ok_or_else(|| anyhow!("character not in vocabulary: {:?}", c))
            })
            .collect()
    }

    /// Decodes up to (not including) the first end-of-sequence token.
    pub fn decode(&self, tokens: &[i64]) -> Result<String> {
        let mut text = String::with_capacity(tokens.len());
        for &token in tokens {
            if token == EOS_TOKEN {
                break;
            }
            let c = usize::try_from(token)
                .ok()
                .and_then(|index| self.characters.get(index))
                .ok_or_else(|| anyhow!("Invalid token found: {}", token))?;
            text.push(*c);
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenizer() -> Result<()> {
        let tokenizer = Tokenizer::from_corpus(["Hello, World!"]);
        let text = "Hello, World!";
        let tokens = tokenizer.encode(text)?;
        let decoded_text = tokenizer.decode(&tokens)?;
        assert_eq!(text, decoded_text);
        Ok(())
    }

    #[test]
    fn test_end_of_sequence_is_token_zero() -> Result<()> {
        let tokenizer = Tokenizer::from_corpus(["床前明月光", "a\0b"]);
        assert_eq!(tokenizer.encode("\0")?, vec![EOS_TOKEN]);
        // '\0' is counted once even though the corpus contains it.
        assert_eq!(tokenizer.vocab_size(), 1 + 5 + 2);
        Ok(())
    }

    #[test]
    fn test_decode_stops_at_end_of_sequence() -> Result<()> {
        let tokenizer = Tokenizer::from_corpus(["def foo():"]);
        let mut tokens = tokenizer.encode("def foo():")?;
        tokens.push(EOS_TOKEN);
        tokens.extend(tokenizer.encode("foo")?);
        assert_eq!(tokenizer.decode(&tokens)?, "def foo():");
        Ok(())
    }

    #[test]
    fn test_unknown_input_is_an_error() {
        let tokenizer = Tokenizer::from_corpus(["abc"]);
        assert!(tokenizer.encode("abd").is_err());
        assert!(tokenizer.decode(&[1, 99]).is_err());
        assert!(tokenizer.decode(&[-1]).is_err());
    }

    #[test]
    fn test_serde_keeps_ids() -> Result<()> {
        let tokenizer = Tokenizer::from_corpus(["zyx", "abc"]);
        let json = serde_json::to_string(&tokenizer)?;
        let restored: Tokenizer = serde_json::from_str(&json)?;
        assert_eq!(restored, tokenizer);
        assert_eq!(restored.encode("xa")?, tokenizer.encode("xa")?);
        Ok(())
    }
}
