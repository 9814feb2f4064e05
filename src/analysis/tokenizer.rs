use regex::Regex;
use unicode_segmentation::UnicodeSegmentation;

use crate::analysis::token::Token;

pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> Vec<Token>;

    fn name(&self) -> &str;
}

/// Standard Unicode word tokenizer.
#[derive(Debug, Clone)]
pub struct StandardTokenizer {
    pub max_token_length: usize,
}

impl Default for StandardTokenizer {
    fn default() -> Self {
        StandardTokenizer {
            max_token_length: 255,
        }
    }
}

impl Tokenizer for StandardTokenizer {
    fn tokenize(&self, text: &str) -> Vec<Token> {
        let mut tokens = Vec::new();
        let mut position = 1u32;

        for (offset, word) in text.unicode_word_indices() {
            if word.len() > self.max_token_length {
                continue;
            }
            tokens.push(Token::new(word, position, offset as u32));
            position += 1;
        }

        tokens
    }

    fn name(&self) -> &str {
        "standard"
    }
}

/// Splits on every match of a delimiter pattern.
pub struct PatternTokenizer {
    pattern: Regex,
}

impl PatternTokenizer {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(PatternTokenizer {
            pattern: Regex::new(pattern)?,
        })
    }
}

impl Tokenizer for PatternTokenizer {
    fn tokenize(&self, text: &str) -> Vec<Token> {
        let mut tokens = Vec::new();
        let mut position = 1u32;
        let mut start = 0usize;

        for m in self.pattern.find_iter(text) {
            if m.start() > start {
                tokens.push(Token::new(&text[start..m.start()], position, start as u32));
                position += 1;
            }
            start = m.end();
        }
        if start < text.len() {
            tokens.push(Token::new(&text[start..], position, start as u32));
        }

        tokens
    }

    fn name(&self) -> &str {
        "pattern"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_tokenizer_positions() {
        let tokenizer = StandardTokenizer::default();
        let tokens = tokenizer.tokenize("quick brown fox");
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[0].text, "quick");
        assert_eq!(tokens[0].position, 1);
        assert_eq!(tokens[2].position, 3);
        assert_eq!(tokens[1].char_offset, 6);
    }

    #[test]
    fn pattern_tokenizer_splits_on_delimiter() {
        let tokenizer = PatternTokenizer::new(r",\s*").unwrap();
        let tokens = tokenizer.tokenize("red, green,blue");
        let texts: Vec<_> = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["red", "green", "blue"]);
    }
}
