use bytes::Bytes;

/// A decoded reply.
///
/// Nil is always explicit: `Bulk(None)` is `$-1`, `MultiBulk(None)` is `*-1`,
/// and neither is the same as an empty string or an empty collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// +OK\r\n
    Status(String),
    /// :1000\r\n
    Integer(i64),
    /// $6\r\nfoobar\r\n  or  $-1\r\n
    Bulk(Option<Bytes>),
    /// *2\r\n…  or  *-1\r\n
    MultiBulk(Option<Vec<Reply>>),
    /// -ERR message\r\n nested inside a multi-bulk (EXEC and pipeline results).
    ///
    /// A top-level error reply is never decoded into this variant.
    Error(String),
}

// ── Convenience accessors ──────────────────────────────────────────

impl Reply {
    /// Build a non-nil bulk reply.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Self::Bulk(Some(data.into()))
    }

    /// Build a status reply.
    pub fn status(s: impl Into<String>) -> Self {
        Self::Status(s.into())
    }

    /// Try to interpret this value as a UTF-8 string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Status(s) => Some(s),
            Self::Bulk(Some(b)) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Try to interpret this value as bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bulk(Some(b)) => Some(b),
            Self::Status(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Try to interpret this value as i64.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Integer replies of 0/1 used as booleans (`EXISTS`, `SETNX`, ...).
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Integer(i) => Some(*i != 0),
            _ => None,
        }
    }

    /// Take the elements of a non-nil multi-bulk.
    pub fn into_array(self) -> Option<Vec<Reply>> {
        match self {
            Self::MultiBulk(Some(a)) => Some(a),
            _ => None,
        }
    }

    /// Pair up a flattened `[k1, v1, k2, v2, …]` multi-bulk (`HGETALL`, ...).
    ///
    /// Returns `None` for non-arrays and for arrays of odd length.
    pub fn into_pairs(self) -> Option<Vec<(Reply, Reply)>> {
        let items = self.into_array()?;
        if items.len() % 2 != 0 {
            return None;
        }
        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
            pairs.push((k, v));
        }
        Some(pairs)
    }

    /// True for `$-1` and `*-1`.
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Bulk(None) | Self::MultiBulk(None))
    }

    /// True for a nested error element.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Returns the type name as a static string (useful for error messages).
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Integer(_) => "integer",
            Self::Bulk(Some(_)) => "bulk",
            Self::Bulk(None) => "nil_bulk",
            Self::MultiBulk(Some(_)) => "multi_bulk",
            Self::MultiBulk(None) => "nil_multi_bulk",
            Self::Error(_) => "error",
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
