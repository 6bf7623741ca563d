//! Hash tag extraction.

/// Delimiters that mark the hashed part of a key.
///
/// Keys sharing the same tag always land on the same shard: with the default
/// `{` / `}` pair, `{user:1}:name` and `{user:1}:email` both hash `user:1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagPattern {
    pub open: u8,
    pub close: u8,
}

impl Default for TagPattern {
    fn default() -> Self {
        Self {
            open: b'{',
            close: b'}',
        }
    }
}

impl TagPattern {
    pub fn new(open: u8, close: u8) -> Self {
        Self { open, close }
    }

    /// Return the portion of `key` that should be hashed.
    ///
    /// That is the content between the first `open` and the first `close`
    /// after it, when non-empty. Otherwise the whole key.
    pub fn extract<'a>(&self, key: &'a [u8]) -> &'a [u8] {
        if let Some(open) = key.iter().position(|&b| b == self.open) {
            if let Some(close_offset) = key[open + 1..].iter().position(|&b| b == self.close) {
                if close_offset > 0 {
                    return &key[open + 1..open + 1 + close_offset];
                }
            }
        }
        key
    }
}
