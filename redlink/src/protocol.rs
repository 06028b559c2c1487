//! RESP2 wire codec.
//!
//! Requests are always arrays of bulk strings; replies are decoded
//! incrementally so the connection task can feed whatever bytes the socket
//! produced and drain zero or more whole replies.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use redlink_core::{RedisError, RedisResult, Reply};

const CRLF: &[u8] = b"\r\n";

/// Serialise one command as `*<n>` followed by bulk strings.
///
/// `name` may contain spaces (`CLUSTER SLOTS`); each word becomes its own
/// bulk string, matching how servers parse subcommands.
pub fn encode_command(name: &str, args: &[Bytes], buf: &mut BytesMut) {
    let words: Vec<&str> = name.split(' ').filter(|w| !w.is_empty()).collect();
    buf.put_u8(b'*');
    buf.put_slice((words.len() + args.len()).to_string().as_bytes());
    buf.put_slice(CRLF);
    for word in words {
        put_bulk(buf, word.as_bytes());
    }
    for arg in args {
        put_bulk(buf, arg);
    }
}

fn put_bulk(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u8(b'$');
    buf.put_slice(data.len().to_string().as_bytes());
    buf.put_slice(CRLF);
    buf.put_slice(data);
    buf.put_slice(CRLF);
}

/// Serialise a reply. Used by tests and by the scripted mock servers; the
/// client itself only ever encodes commands.
pub fn encode_reply(reply: &Reply, buf: &mut BytesMut) -> RedisResult<()> {
    match reply {
        Reply::Simple(s) => {
            buf.put_u8(b'+');
            buf.put_slice(s.as_bytes());
            buf.put_slice(CRLF);
        }
        Reply::Error(e) => {
            buf.put_u8(b'-');
            buf.put_slice(e.as_bytes());
            buf.put_slice(CRLF);
        }
        Reply::Integer(i) => {
            buf.put_u8(b':');
            buf.put_slice(i.to_string().as_bytes());
            buf.put_slice(CRLF);
        }
        Reply::Bulk(data) => put_bulk(buf, data),
        Reply::Null => buf.put_slice(b"$-1\r\n"),
        Reply::Array(items) => {
            buf.put_u8(b'*');
            buf.put_slice(items.len().to_string().as_bytes());
            buf.put_slice(CRLF);
            for item in items {
                encode_reply(item, buf)?;
            }
        }
        Reply::Map(_) => {
            return Err(RedisError::Protocol(
                "map replies are a client-side transform and have no wire form".to_string(),
            ))
        }
    }
    Ok(())
}

/// Incremental RESP decoder.
///
/// `feed` appends raw socket bytes; `next_reply` pops one whole reply or
/// returns `None` until more bytes arrive. A malformed stream yields
/// `RedisError::Protocol`, after which the connection must be torn down.
#[derive(Debug, Default)]
pub struct RespDecoder {
    buf: BytesMut,
}

impl RespDecoder {
    /// Fresh decoder with an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Buffer to read into directly, avoiding a copy.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Decode the next whole reply, if the buffer holds one.
    pub fn next_reply(&mut self) -> RedisResult<Option<Reply>> {
        let mut pos = 0usize;
        match parse(&self.buf, &mut pos)? {
            Some(reply) => {
                self.buf.advance(pos);
                Ok(Some(reply))
            }
            None => Ok(None),
        }
    }
}

fn parse(buf: &[u8], pos: &mut usize) -> RedisResult<Option<Reply>> {
    let Some(&tag) = buf.get(*pos) else {
        return Ok(None);
    };
    *pos += 1;
    match tag {
        b'+' => Ok(read_line(buf, pos)?.map(|line| Reply::Simple(lossless_utf8(line)))),
        b'-' => Ok(read_line(buf, pos)?.map(|line| Reply::Error(lossless_utf8(line)))),
        b':' => match read_line(buf, pos)? {
            Some(line) => {
                let text = std::str::from_utf8(line)
                    .map_err(|_| RedisError::Protocol("non-ascii integer reply".to_string()))?;
                let value = text
                    .parse::<i64>()
                    .map_err(|e| RedisError::Protocol(format!("bad integer reply: {e}")))?;
                Ok(Some(Reply::Integer(value)))
            }
            None => Ok(None),
        },
        b'$' => parse_bulk(buf, pos),
        b'*' => parse_array(buf, pos),
        other => Err(RedisError::Protocol(format!(
            "unknown reply tag {:?}",
            other as char
        ))),
    }
}

fn parse_bulk(buf: &[u8], pos: &mut usize) -> RedisResult<Option<Reply>> {
    let Some(len) = read_length(buf, pos)? else {
        return Ok(None);
    };
    if len < 0 {
        return Ok(Some(Reply::Null));
    }
    let len = len as usize;
    if buf.len() < *pos + len + 2 {
        return Ok(None);
    }
    let data = Bytes::copy_from_slice(&buf[*pos..*pos + len]);
    if &buf[*pos + len..*pos + len + 2] != CRLF {
        return Err(RedisError::Protocol(
            "bulk string not terminated by CRLF".to_string(),
        ));
    }
    *pos += len + 2;
    Ok(Some(Reply::Bulk(data)))
}

fn parse_array(buf: &[u8], pos: &mut usize) -> RedisResult<Option<Reply>> {
    let Some(len) = read_length(buf, pos)? else {
        return Ok(None);
    };
    if len < 0 {
        return Ok(Some(Reply::Null));
    }
    let mut items = Vec::with_capacity(len as usize);
    for _ in 0..len {
        match parse(buf, pos)? {
            Some(item) => items.push(item),
            None => return Ok(None),
        }
    }
    Ok(Some(Reply::Array(items)))
}

fn read_length(buf: &[u8], pos: &mut usize) -> RedisResult<Option<i64>> {
    match read_line(buf, pos)? {
        Some(line) => {
            let text = std::str::from_utf8(line)
                .map_err(|_| RedisError::Protocol("non-ascii length prefix".to_string()))?;
            let len = text
                .parse::<i64>()
                .map_err(|e| RedisError::Protocol(format!("bad length prefix: {e}")))?;
            Ok(Some(len))
        }
        None => Ok(None),
    }
}

fn read_line<'a>(buf: &'a [u8], pos: &mut usize) -> RedisResult<Option<&'a [u8]>> {
    let start = *pos;
    let mut i = start;
    while i + 1 < buf.len() {
        if buf[i] == b'\r' {
            if buf[i + 1] != b'\n' {
                return Err(RedisError::Protocol("bare CR inside line".to_string()));
            }
            *pos = i + 2;
            return Ok(Some(&buf[start..i]));
        }
        i += 1;
    }
    Ok(None)
}

fn lossless_utf8(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Reply> {
        let mut decoder = RespDecoder::new();
        decoder.feed(bytes);
        let mut out = Vec::new();
        while let Some(reply) = decoder.next_reply().unwrap() {
            out.push(reply);
        }
        out
    }

    #[test]
    fn encodes_get() {
        let mut buf = BytesMut::new();
        encode_command("get", &[Bytes::from_static(b"mykey")], &mut buf);
        assert_eq!(&buf[..], b"*2\r\n$3\r\nget\r\n$5\r\nmykey\r\n");
    }

    #[test]
    fn encodes_subcommand_names_as_separate_words() {
        let mut buf = BytesMut::new();
        encode_command("cluster slots", &[], &mut buf);
        assert_eq!(&buf[..], b"*2\r\n$7\r\ncluster\r\n$5\r\nslots\r\n");
    }

    #[test]
    fn decodes_each_type() {
        assert_eq!(
            decode_all(b"+OK\r\n"),
            vec![Reply::Simple("OK".to_string())]
        );
        assert_eq!(
            decode_all(b"-ERR boom\r\n"),
            vec![Reply::Error("ERR boom".to_string())]
        );
        assert_eq!(decode_all(b":42\r\n"), vec![Reply::Integer(42)]);
        assert_eq!(decode_all(b"$3\r\nfoo\r\n"), vec![Reply::bulk("foo")]);
        assert_eq!(decode_all(b"$-1\r\n"), vec![Reply::Null]);
        assert_eq!(decode_all(b"*-1\r\n"), vec![Reply::Null]);
    }

    #[test]
    fn decodes_nested_arrays() {
        let replies = decode_all(b"*2\r\n*2\r\n:1\r\n$1\r\na\r\n*1\r\n+x\r\n");
        assert_eq!(
            replies,
            vec![Reply::Array(vec![
                Reply::Array(vec![Reply::Integer(1), Reply::bulk("a")]),
                Reply::Array(vec![Reply::Simple("x".to_string())]),
            ])]
        );
    }

    #[test]
    fn partial_input_yields_none_until_complete() {
        let mut decoder = RespDecoder::new();
        decoder.feed(b"$6\r\nfoo");
        assert!(decoder.next_reply().unwrap().is_none());
        decoder.feed(b"bar\r\n:7\r");
        assert_eq!(decoder.next_reply().unwrap(), Some(Reply::bulk("foobar")));
        assert!(decoder.next_reply().unwrap().is_none());
        decoder.feed(b"\n");
        assert_eq!(decoder.next_reply().unwrap(), Some(Reply::Integer(7)));
    }

    #[test]
    fn multiple_replies_drain_in_order() {
        let replies = decode_all(b"+A\r\n+B\r\n:3\r\n");
        assert_eq!(
            replies,
            vec![
                Reply::Simple("A".to_string()),
                Reply::Simple("B".to_string()),
                Reply::Integer(3)
            ]
        );
    }

    #[test]
    fn unknown_tag_is_a_protocol_error() {
        let mut decoder = RespDecoder::new();
        decoder.feed(b"%2\r\n");
        assert!(matches!(
            decoder.next_reply(),
            Err(RedisError::Protocol(_))
        ));
    }

    #[test]
    fn reply_roundtrip() {
        let original = Reply::Array(vec![
            Reply::Simple("OK".to_string()),
            Reply::Integer(-12),
            Reply::bulk("payload"),
            Reply::Null,
            Reply::Array(vec![Reply::Error("ERR nested".to_string())]),
        ]);
        let mut buf = BytesMut::new();
        encode_reply(&original, &mut buf).unwrap();
        let mut decoder = RespDecoder::new();
        decoder.feed(&buf);
        assert_eq!(decoder.next_reply().unwrap(), Some(original));
        assert!(decoder.next_reply().unwrap().is_none());
    }

    #[test]
    fn command_roundtrip_through_reply_decoder() {
        let mut buf = BytesMut::new();
        encode_command(
            "set",
            &[Bytes::from_static(b"k"), Bytes::from_static(b"\x00\x01\x02")],
            &mut buf,
        );
        let mut decoder = RespDecoder::new();
        decoder.feed(&buf);
        let Reply::Array(items) = decoder.next_reply().unwrap().unwrap() else {
            panic!("commands decode as arrays");
        };
        assert_eq!(items[0], Reply::bulk("set"));
        assert_eq!(items[2], Reply::Bulk(Bytes::from_static(b"\x00\x01\x02")));
    }
}
