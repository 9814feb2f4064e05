use rust_stemmers::Algorithm;

use crate::analysis::filter::{LowercaseFilter, StemmerFilter, StopWordFilter, TokenFilter};
use crate::analysis::token::Token;
use crate::analysis::tokenizer::{StandardTokenizer, Tokenizer};

/// Text analysis pipeline: one tokenizer followed by a filter chain. The
/// engine only depends on `analyze` returning an ordered
/// (token, position, char-offset) sequence.
pub struct Analyzer {
    pub tokenizer: Box<dyn Tokenizer>,
    pub filters: Vec<Box<dyn TokenFilter>>,
    pub name: String,
}

impl Analyzer {
    pub fn new(name: impl Into<String>, tokenizer: Box<dyn Tokenizer>) -> Self {
        Analyzer {
            tokenizer,
            filters: Vec::new(),
            name: name.into(),
        }
    }

    pub fn add_filter(mut self, filter: Box<dyn TokenFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn analyze(&self, text: &str) -> Vec<Token> {
        let mut tokens = self.tokenizer.tokenize(text);
        for filter in &self.filters {
            tokens = filter.filter(tokens);
        }
        tokens
    }

    /// Tokenizer + lowercase only; used for query strings so that stemming
    /// choices stay symmetric with the index side.
    pub fn standard() -> Self {
        Analyzer::new("standard", Box::new(StandardTokenizer::default()))
            .add_filter(Box::new(LowercaseFilter))
    }

    pub fn standard_english() -> Self {
        Analyzer::new("standard_english", Box::new(StandardTokenizer::default()))
            .add_filter(Box::new(LowercaseFilter))
            .add_filter(Box::new(StopWordFilter::english()))
            .add_filter(Box::new(StemmerFilter::new(Algorithm::English)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_analyzer_lowercases() {
        let analyzer = Analyzer::standard();
        let tokens = analyzer.analyze("Coffee HOUSE");
        assert_eq!(tokens[0].text, "coffee");
        assert_eq!(tokens[1].text, "house");
    }

    #[test]
    fn english_analyzer_stems_and_drops_stopwords() {
        let analyzer = Analyzer::standard_english();
        let tokens = analyzer.analyze("the running dogs");
        let texts: Vec<_> = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["run", "dog"]);
    }
}
