//! The RESP reply model.

use bytes::Bytes;

use crate::error::{RedisError, RedisResult};

/// A decoded server reply.
///
/// The first six variants map one-to-one onto the RESP2 wire types; `Map`
/// never appears on the wire and is only produced by reply transforms
/// (`HGETALL`, `INFO`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+OK\r\n`
    Simple(String),
    /// `-ERR message\r\n`
    Error(String),
    /// `:1000\r\n`
    Integer(i64),
    /// `$6\r\nfoobar\r\n`
    Bulk(Bytes),
    /// `$-1\r\n` or `*-1\r\n`
    Null,
    /// `*2\r\n...`
    Array(Vec<Reply>),
    /// Client-side mapping produced by reply transforms.
    Map(Vec<(Reply, Reply)>),
}

impl Reply {
    /// Bulk string from anything byte-like.
    #[must_use]
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Self::Bulk(data.into())
    }

    /// True for `Null`.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// True for `Error`.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// View the textual content of a simple or bulk string.
    pub fn as_str(&self) -> RedisResult<&str> {
        match self {
            Self::Simple(s) => Ok(s),
            Self::Bulk(b) => std::str::from_utf8(b)
                .map_err(|e| RedisError::Type(format!("invalid utf-8 in bulk string: {e}"))),
            other => Err(RedisError::Type(format!("not a string reply: {other:?}"))),
        }
    }

    /// Owned string content.
    pub fn into_string(self) -> RedisResult<String> {
        match self {
            Self::Simple(s) => Ok(s),
            Self::Bulk(b) => String::from_utf8(b.to_vec())
                .map_err(|e| RedisError::Type(format!("invalid utf-8 in bulk string: {e}"))),
            other => Err(RedisError::Type(format!("not a string reply: {other:?}"))),
        }
    }

    /// Raw bytes of a bulk or simple string.
    pub fn into_bytes(self) -> RedisResult<Bytes> {
        match self {
            Self::Bulk(b) => Ok(b),
            Self::Simple(s) => Ok(Bytes::from(s.into_bytes())),
            other => Err(RedisError::Type(format!("not a byte reply: {other:?}"))),
        }
    }

    /// Integer content, parsing numeric bulk strings as the server does.
    pub fn as_int(&self) -> RedisResult<i64> {
        match self {
            Self::Integer(i) => Ok(*i),
            Self::Bulk(_) | Self::Simple(_) => {
                let s = self.as_str()?;
                s.parse()
                    .map_err(|e| RedisError::Type(format!("not an integer reply: {e}")))
            }
            other => Err(RedisError::Type(format!("not an integer reply: {other:?}"))),
        }
    }

    /// The elements of an array reply.
    pub fn into_array(self) -> RedisResult<Vec<Self>> {
        match self {
            Self::Array(items) => Ok(items),
            other => Err(RedisError::Type(format!("not an array reply: {other:?}"))),
        }
    }

    /// The entries of a transformed map reply.
    pub fn into_map(self) -> RedisResult<Vec<(Self, Self)>> {
        match self {
            Self::Map(entries) => Ok(entries),
            other => Err(RedisError::Type(format!("not a map reply: {other:?}"))),
        }
    }
}

impl From<&str> for Reply {
    fn from(s: &str) -> Self {
        Self::Bulk(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Reply {
    fn from(s: String) -> Self {
        Self::Bulk(Bytes::from(s.into_bytes()))
    }
}

impl From<i64> for Reply {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<Bytes> for Reply {
    fn from(b: Bytes) -> Self {
        Self::Bulk(b)
    }
}

impl From<Vec<u8>> for Reply {
    fn from(b: Vec<u8>) -> Self {
        Self::Bulk(Bytes::from(b))
    }
}

impl TryFrom<Reply> for String {
    type Error = RedisError;

    fn try_from(reply: Reply) -> RedisResult<Self> {
        reply.into_string()
    }
}

impl TryFrom<Reply> for i64 {
    type Error = RedisError;

    fn try_from(reply: Reply) -> RedisResult<Self> {
        reply.as_int()
    }
}

impl TryFrom<Reply> for Bytes {
    type Error = RedisError;

    fn try_from(reply: Reply) -> RedisResult<Self> {
        reply.into_bytes()
    }
}

impl TryFrom<Reply> for bool {
    type Error = RedisError;

    fn try_from(reply: Reply) -> RedisResult<Self> {
        match reply {
            Reply::Integer(1) => Ok(true),
            Reply::Integer(0) => Ok(false),
            Reply::Simple(ref s) if s == "OK" => Ok(true),
            other => Err(RedisError::Type(format!("not a boolean reply: {other:?}"))),
        }
    }
}

impl TryFrom<Reply> for Option<String> {
    type Error = RedisError;

    fn try_from(reply: Reply) -> RedisResult<Self> {
        match reply {
            Reply::Null => Ok(None),
            other => other.into_string().map(Some),
        }
    }
}
