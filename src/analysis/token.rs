#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    /// Ordinal position in the token stream, starting at 1 so that position 0
    /// can mean "no position information".
    pub position: u32,
    /// Byte offset of the token start in the original attribute value.
    pub char_offset: u32,
}

impl Token {
    pub fn new(text: impl Into<String>, position: u32, char_offset: u32) -> Self {
        Token {
            text: text.into(),
            position,
            char_offset,
        }
    }
}
