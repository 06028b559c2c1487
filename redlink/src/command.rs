//! The command object and the static command table.
//!
//! A [`Command`] carries everything the connection and the cluster router
//! need to know about one request: the lowercased name, the raw byte
//! arguments, classification flags, where its keys sit in the argument
//! list, and a one-shot completion handle that fires exactly once with the
//! reply or an error.

use std::collections::HashMap;

use bytes::Bytes;
use once_cell::sync::Lazy;
use redlink_core::{RedisError, RedisResult, Reply};
use tokio::sync::oneshot;

/// How replies should be decoded for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyEncoding {
    /// Bulk payloads are expected to be UTF-8 text.
    #[default]
    Text,
    /// Bulk payloads are raw bytes.
    Binary,
}

/// Classification flags from the static command table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandFlags {
    /// Never writes; may be served by a replica.
    pub is_readonly: bool,
    /// Mutates the dataset.
    pub is_write: bool,
    /// Puts the connection into subscriber mode.
    pub enters_subscriber_mode: bool,
    /// May leave subscriber mode (when the active count drops to zero).
    pub exits_subscriber_mode: bool,
    /// The server will close the connection after replying.
    pub will_disconnect: bool,
    /// Allowed while the connection is monitoring.
    pub valid_in_monitor_mode: bool,
    /// Allowed while the connection is subscribed.
    pub valid_in_subscriber_mode: bool,
    /// Registered at runtime rather than drawn from the static table.
    pub is_custom: bool,
}

/// Where a command's keys sit in its argument list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyExtractor {
    /// No key arguments.
    #[default]
    None,
    /// The first argument is the only key.
    First,
    /// Every argument is a key (`DEL`, `MGET`, `WATCH`).
    All,
    /// Keys at positions 0, n, 2n, ... (`MSET` has n = 2).
    Step(usize),
    /// The first `n` arguments are keys (custom commands with a declared
    /// key count).
    Leading(usize),
    /// A numeric key count sits at position `at`; the following N
    /// arguments are the keys. `EVAL script numkeys k...` has `at = 1`;
    /// custom commands without a declared count pass it first (`at = 0`).
    KeyCount {
        /// Position of the count argument.
        at: usize,
    },
}

impl KeyExtractor {
    /// Indices of the key positions within `args`.
    pub(crate) fn positions(self, args: &[Bytes]) -> Vec<usize> {
        match self {
            Self::None => Vec::new(),
            Self::First => {
                if args.is_empty() {
                    Vec::new()
                } else {
                    vec![0]
                }
            }
            Self::All => (0..args.len()).collect(),
            Self::Step(step) => (0..args.len()).step_by(step.max(1)).collect(),
            Self::Leading(n) => (0..n.min(args.len())).collect(),
            Self::KeyCount { at } => {
                let Some(count) = args
                    .get(at)
                    .and_then(|c| std::str::from_utf8(c).ok())
                    .and_then(|c| c.parse::<usize>().ok())
                else {
                    return Vec::new();
                };
                let first = at + 1;
                let last = (first + count).min(args.len());
                (first..last).collect()
            }
        }
    }
}

/// One row of the static command table.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    /// Classification flags.
    pub flags: CommandFlags,
    /// Key-position extractor.
    pub keys: KeyExtractor,
}

const fn read(keys: KeyExtractor) -> CommandSpec {
    CommandSpec {
        flags: CommandFlags {
            is_readonly: true,
            ..BLANK
        },
        keys,
    }
}

const fn write(keys: KeyExtractor) -> CommandSpec {
    CommandSpec {
        flags: CommandFlags {
            is_write: true,
            ..BLANK
        },
        keys,
    }
}

const fn control() -> CommandSpec {
    CommandSpec {
        flags: BLANK,
        keys: KeyExtractor::None,
    }
}

const BLANK: CommandFlags = CommandFlags {
    is_readonly: false,
    is_write: false,
    enters_subscriber_mode: false,
    exits_subscriber_mode: false,
    will_disconnect: false,
    valid_in_monitor_mode: false,
    valid_in_subscriber_mode: false,
    is_custom: false,
};

/// The static command table. Unknown names fall back to
/// [`CommandSpec::unknown`], which has no flags and no keys.
static COMMAND_TABLE: Lazy<HashMap<&'static str, CommandSpec>> = Lazy::new(|| {
    use KeyExtractor::{All, First, KeyCount, Step};
    let mut t = HashMap::new();

    // Strings.
    for name in ["get", "getrange", "strlen", "getbit", "bitcount", "ttl", "pttl", "type", "dump"] {
        t.insert(name, read(First));
    }
    for name in [
        "set", "setnx", "setex", "psetex", "append", "getset", "getdel", "incr", "decr", "incrby",
        "decrby", "incrbyfloat", "setrange", "setbit", "expire", "pexpire", "expireat",
        "pexpireat", "persist", "restore",
    ] {
        t.insert(name, write(First));
    }
    t.insert("mget", read(All));
    t.insert("exists", read(All));
    t.insert("touch", write(All));
    t.insert("del", write(All));
    t.insert("unlink", write(All));
    t.insert("mset", write(Step(2)));
    t.insert("msetnx", write(Step(2)));

    // Hashes, lists, sets, sorted sets.
    for name in ["hget", "hgetall", "hmget", "hlen", "hexists", "hkeys", "hvals", "hstrlen"] {
        t.insert(name, read(First));
    }
    for name in ["hset", "hmset", "hsetnx", "hdel", "hincrby", "hincrbyfloat"] {
        t.insert(name, write(First));
    }
    for name in ["lrange", "llen", "lindex", "lpos"] {
        t.insert(name, read(First));
    }
    for name in ["lpush", "rpush", "lpushx", "rpushx", "lpop", "rpop", "lset", "ltrim", "lrem", "linsert"] {
        t.insert(name, write(First));
    }
    for name in ["smembers", "sismember", "scard", "srandmember", "sscan"] {
        t.insert(name, read(First));
    }
    for name in ["sadd", "srem", "spop", "smove"] {
        t.insert(name, write(First));
    }
    for name in ["zscore", "zrange", "zrevrange", "zrangebyscore", "zcard", "zrank", "zrevrank", "zcount", "zscan"] {
        t.insert(name, read(First));
    }
    for name in ["zadd", "zrem", "zincrby", "zpopmin", "zpopmax", "zremrangebyscore", "zremrangebyrank"] {
        t.insert(name, write(First));
    }
    t.insert("rename", write(All));
    t.insert("renamenx", write(All));

    // Scripts: the wire layout is `script numkeys key...`.
    t.insert("eval", write(KeyCount { at: 1 }));
    t.insert("evalsha", write(KeyCount { at: 1 }));
    t.insert("fcall", write(KeyCount { at: 1 }));
    t.insert("fcall_ro", read(KeyCount { at: 1 }));

    // Keyless reads.
    for name in ["keys", "scan", "randomkey", "dbsize", "info", "time", "memory", "lastsave"] {
        t.insert(name, read(KeyExtractor::None));
    }
    for name in ["flushdb", "flushall"] {
        t.insert(name, write(KeyExtractor::None));
    }

    // Connection control and cluster plumbing.
    for name in [
        "auth", "select", "echo", "client", "config", "command", "cluster", "sentinel",
        "readonly", "readwrite", "wait", "script", "multi", "exec", "discard",
        "unwatch", "monitor", "publish", "pubsub", "reset",
    ] {
        t.insert(name, control());
    }
    t.insert("watch", CommandSpec { flags: BLANK, keys: All });

    t.insert(
        "ping",
        CommandSpec {
            flags: CommandFlags {
                is_readonly: true,
                valid_in_subscriber_mode: true,
                ..BLANK
            },
            keys: KeyExtractor::None,
        },
    );
    t.insert(
        "quit",
        CommandSpec {
            flags: CommandFlags {
                will_disconnect: true,
                valid_in_subscriber_mode: true,
                valid_in_monitor_mode: true,
                ..BLANK
            },
            keys: KeyExtractor::None,
        },
    );
    t.insert(
        "shutdown",
        CommandSpec {
            flags: CommandFlags {
                will_disconnect: true,
                ..BLANK
            },
            keys: KeyExtractor::None,
        },
    );
    t.insert(
        "asking",
        CommandSpec {
            flags: BLANK,
            keys: KeyExtractor::None,
        },
    );

    // Pub/sub.
    for name in ["subscribe", "psubscribe"] {
        t.insert(
            name,
            CommandSpec {
                flags: CommandFlags {
                    enters_subscriber_mode: true,
                    valid_in_subscriber_mode: true,
                    ..BLANK
                },
                keys: KeyExtractor::None,
            },
        );
    }
    for name in ["unsubscribe", "punsubscribe"] {
        t.insert(
            name,
            CommandSpec {
                flags: CommandFlags {
                    exits_subscriber_mode: true,
                    valid_in_subscriber_mode: true,
                    ..BLANK
                },
                keys: KeyExtractor::None,
            },
        );
    }

    t
});

impl CommandSpec {
    /// Table lookup by lowercased name.
    #[must_use]
    pub fn lookup(name: &str) -> Option<&'static Self> {
        COMMAND_TABLE.get(name)
    }

    /// Spec for names absent from the table.
    #[must_use]
    pub const fn unknown() -> Self {
        CommandSpec {
            flags: BLANK,
            keys: KeyExtractor::None,
        }
    }
}

/// Receiving half of a command's completion handle.
pub type ReplyReceiver = oneshot::Receiver<RedisResult<Reply>>;

/// Render a command argument as raw bytes.
#[must_use]
pub fn arg(data: impl AsRef<[u8]>) -> Bytes {
    Bytes::copy_from_slice(data.as_ref())
}

/// A single request travelling through a connection or the cluster router.
#[derive(Debug)]
pub struct Command {
    /// Lowercased command name; may contain a space for subcommands.
    pub name: String,
    /// Raw arguments. Numbers are rendered in base 10 by the caller.
    pub args: Vec<Bytes>,
    /// Reply decoding preference.
    pub encoding: ReplyEncoding,
    /// Flags copied from the table (or supplied for custom commands).
    pub flags: CommandFlags,
    /// Key positions.
    pub keys: KeyExtractor,
    /// Synthetic command whose reply must not reach batch results.
    pub ignore: bool,
    /// Logical database in effect when the command was submitted.
    pub db: u32,
    /// Caller backtrace captured at submission.
    pub trace: Option<String>,
    responder: Option<oneshot::Sender<RedisResult<Reply>>>,
}

impl Command {
    /// Build a command and its completion receiver.
    #[must_use]
    pub fn new(name: &str, args: Vec<Bytes>) -> (Self, ReplyReceiver) {
        let name = name.to_ascii_lowercase();
        let spec = CommandSpec::lookup(&name)
            .copied()
            .unwrap_or_else(CommandSpec::unknown);
        let (tx, rx) = oneshot::channel();
        (
            Self {
                name,
                args,
                encoding: ReplyEncoding::Text,
                flags: spec.flags,
                keys: spec.keys,
                ignore: false,
                db: 0,
                trace: None,
                responder: Some(tx),
            },
            rx,
        )
    }

    /// A runtime-registered command: flags carry `is_custom`. With a
    /// declared key count the first `n` arguments are keys; without one
    /// the caller passes the key count as the first argument.
    #[must_use]
    pub fn custom(name: &str, args: Vec<Bytes>, num_keys: Option<usize>) -> (Self, ReplyReceiver) {
        let (mut cmd, rx) = Self::new(name, args);
        cmd.flags = CommandFlags {
            is_custom: true,
            ..BLANK
        };
        cmd.keys = match num_keys {
            Some(0) => KeyExtractor::None,
            Some(n) => KeyExtractor::Leading(n),
            None => KeyExtractor::KeyCount { at: 0 },
        };
        (cmd, rx)
    }

    /// A synthetic command with no caller: its reply is dropped.
    #[must_use]
    pub fn internal(name: &str, args: Vec<Bytes>) -> Self {
        let (mut cmd, _rx) = Self::new(name, args);
        cmd.ignore = true;
        cmd.responder = None;
        cmd
    }

    /// Request binary replies.
    #[must_use]
    pub fn binary(mut self) -> Self {
        self.encoding = ReplyEncoding::Binary;
        self
    }

    /// The byte strings this command routes by.
    #[must_use]
    pub fn command_keys(&self) -> Vec<&[u8]> {
        self.keys
            .positions(&self.args)
            .into_iter()
            .filter_map(|i| self.args.get(i).map(|b| b.as_ref()))
            .collect()
    }

    /// Prepend `prefix` to every key argument.
    pub fn apply_key_prefix(&mut self, prefix: &str) {
        if prefix.is_empty() {
            return;
        }
        let positions = self.keys.positions(&self.args);
        for i in positions {
            if let Some(arg) = self.args.get_mut(i) {
                let mut prefixed = Vec::with_capacity(prefix.len() + arg.len());
                prefixed.extend_from_slice(prefix.as_bytes());
                prefixed.extend_from_slice(arg);
                *arg = Bytes::from(prefixed);
            }
        }
    }

    /// Whether the completion handle is still pending.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.responder.is_some()
    }

    /// Fire the completion handle. Subsequent calls are no-ops, upholding
    /// the fire-exactly-once invariant.
    pub fn complete(&mut self, result: RedisResult<Reply>) {
        if let Some(tx) = self.responder.take() {
            let result = match result {
                Err(RedisError::Reply(mut reply_err)) if self.trace.is_some() => {
                    if let Some(trace) = &self.trace {
                        reply_err.message = format!("{}\n{trace}", reply_err.message);
                    }
                    Err(RedisError::Reply(reply_err))
                }
                other => other,
            };
            let _ = tx.send(result);
        }
    }
}

/// Post-process a raw reply for commands whose natural shape is a mapping:
/// `HGETALL`, `CONFIG GET` and `INFO`.
///
/// `MULTI`/`EXEC` and everything unlisted pass through unchanged.
#[must_use]
pub fn transform_reply(name: &str, args: &[Bytes], reply: Reply) -> Reply {
    match name {
        "hgetall" => pairs_to_map(reply),
        "info" => info_to_map(reply),
        "config" if is_subcommand(args, "get") => pairs_to_map(reply),
        "config get" => pairs_to_map(reply),
        _ => reply,
    }
}

fn is_subcommand(args: &[Bytes], sub: &str) -> bool {
    args.first()
        .is_some_and(|a| a.eq_ignore_ascii_case(sub.as_bytes()))
}

fn pairs_to_map(reply: Reply) -> Reply {
    let Reply::Array(items) = reply else {
        return reply;
    };
    if items.len() % 2 != 0 {
        return Reply::Array(items);
    }
    let mut entries = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
        entries.push((field, value));
    }
    Reply::Map(entries)
}

fn info_to_map(reply: Reply) -> Reply {
    let Ok(text) = reply.as_str() else {
        return reply;
    };
    let mut entries = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((field, value)) = line.split_once(':') {
            entries.push((Reply::from(field), Reply::from(value)));
        }
    }
    Reply::Map(entries)
}

/// Clamp integers beyond the 2^53 safe range to strings, when the caller
/// asked for `stringify_numbers`.
#[must_use]
pub fn stringify_large_numbers(reply: Reply) -> Reply {
    const SAFE: i64 = 1 << 53;
    match reply {
        Reply::Integer(i) if !(-SAFE..=SAFE).contains(&i) => Reply::from(i.to_string()),
        Reply::Array(items) => {
            Reply::Array(items.into_iter().map(stringify_large_numbers).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> Vec<Bytes> {
        parts
            .iter()
            .map(|p| Bytes::copy_from_slice(p.as_bytes()))
            .collect()
    }

    #[test]
    fn lowercases_and_classifies() {
        let (cmd, _rx) = Command::new("SET", args(&["k", "v"]));
        assert_eq!(cmd.name, "set");
        assert!(cmd.flags.is_write);
        assert!(!cmd.flags.is_readonly);

        let (cmd, _rx) = Command::new("GET", args(&["k"]));
        assert!(cmd.flags.is_readonly);
    }

    #[test]
    fn key_extraction_by_class() {
        let (cmd, _rx) = Command::new("get", args(&["a"]));
        assert_eq!(cmd.command_keys(), vec![b"a".as_ref()]);

        let (cmd, _rx) = Command::new("mget", args(&["a", "b", "c"]));
        assert_eq!(cmd.command_keys().len(), 3);

        let (cmd, _rx) = Command::new("mset", args(&["a", "1", "b", "2"]));
        assert_eq!(cmd.command_keys(), vec![b"a".as_ref(), b"b".as_ref()]);

        let (cmd, _rx) = Command::new("ping", Vec::new());
        assert!(cmd.command_keys().is_empty());
    }

    #[test]
    fn eval_skips_key_count_then_reads_n_keys() {
        let (cmd, _rx) = Command::new(
            "eval",
            args(&["return 1", "2", "k1", "k2", "not-a-key"]),
        );
        assert_eq!(cmd.command_keys(), vec![b"k1".as_ref(), b"k2".as_ref()]);

        // Declared count out of range is clamped to the argument list.
        let (cmd, _rx) = Command::new("evalsha", args(&["sha", "9", "k1"]));
        assert_eq!(cmd.command_keys(), vec![b"k1".as_ref()]);
    }

    #[test]
    fn custom_commands_extract_keys_by_declared_count() {
        let (cmd, _rx) = Command::custom("myecho", args(&["k1", "k2", "payload"]), Some(2));
        assert!(cmd.flags.is_custom);
        assert_eq!(cmd.command_keys(), vec![b"k1".as_ref(), b"k2".as_ref()]);

        let (cmd, _rx) = Command::custom("mysum", args(&["1", "k1", "3"]), None);
        assert_eq!(cmd.command_keys(), vec![b"k1".as_ref()]);
    }

    #[test]
    fn subscriber_flags() {
        let (sub, _rx) = Command::new("subscribe", args(&["ch"]));
        assert!(sub.flags.enters_subscriber_mode);
        assert!(sub.flags.valid_in_subscriber_mode);

        let (unsub, _rx) = Command::new("punsubscribe", args(&[]));
        assert!(unsub.flags.exits_subscriber_mode);

        let (get, _rx) = Command::new("get", args(&["k"]));
        assert!(!get.flags.valid_in_subscriber_mode);

        let (ping, _rx) = Command::new("ping", args(&[]));
        assert!(ping.flags.valid_in_subscriber_mode);
    }

    #[test]
    fn completion_fires_exactly_once() {
        let (mut cmd, mut rx) = Command::new("get", args(&["k"]));
        cmd.complete(Ok(Reply::Null));
        cmd.complete(Ok(Reply::Integer(2)));
        assert_eq!(rx.try_recv().unwrap().unwrap(), Reply::Null);
        assert!(!cmd.is_pending());
    }

    #[test]
    fn key_prefix_touches_keys_only() {
        let (mut cmd, _rx) = Command::new("mset", args(&["a", "1", "b", "2"]));
        cmd.apply_key_prefix("app:");
        assert_eq!(cmd.args[0].as_ref(), b"app:a");
        assert_eq!(cmd.args[1].as_ref(), b"1");
        assert_eq!(cmd.args[2].as_ref(), b"app:b");
        assert_eq!(cmd.args[3].as_ref(), b"2");
    }

    #[test]
    fn hgetall_transforms_to_map() {
        let raw = Reply::Array(vec![
            Reply::bulk("f1"),
            Reply::bulk("v1"),
            Reply::bulk("f2"),
            Reply::bulk("v2"),
        ]);
        let Reply::Map(entries) = transform_reply("hgetall", &[], raw) else {
            panic!("expected a map");
        };
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, Reply::bulk("f1"));
        assert_eq!(entries[1].1, Reply::bulk("v2"));
    }

    #[test]
    fn config_get_transforms_but_config_set_does_not() {
        let raw = Reply::Array(vec![Reply::bulk("maxmemory"), Reply::bulk("0")]);

        let got = transform_reply("config", &args(&["GET", "maxmemory"]), raw.clone());
        let Reply::Map(entries) = got else {
            panic!("expected a map");
        };
        assert_eq!(entries[0], (Reply::bulk("maxmemory"), Reply::bulk("0")));

        // Other subcommands keep their raw shape.
        let set_reply = Reply::Simple("OK".to_string());
        assert_eq!(
            transform_reply("config", &args(&["set", "maxmemory", "0"]), set_reply.clone()),
            set_reply
        );
        assert_eq!(
            transform_reply("config", &args(&["rewrite"]), raw.clone()),
            raw
        );
    }

    #[test]
    fn info_transforms_to_map() {
        let raw = Reply::bulk("# Server\r\nredis_version:7.2.4\r\nloading:0\r\n");
        let Reply::Map(entries) = transform_reply("info", &[], raw) else {
            panic!("expected a map");
        };
        assert!(entries
            .iter()
            .any(|(f, v)| f == &Reply::from("loading") && v == &Reply::from("0")));
    }

    #[test]
    fn exec_reply_passes_through() {
        let raw = Reply::Array(vec![Reply::Simple("OK".to_string())]);
        assert_eq!(transform_reply("exec", &[], raw.clone()), raw);
    }

    #[test]
    fn stringify_numbers_beyond_2_pow_53() {
        let reply = stringify_large_numbers(Reply::Integer(9_007_199_254_740_993));
        assert_eq!(reply, Reply::from("9007199254740993"));
        // In range stays numeric.
        assert_eq!(
            stringify_large_numbers(Reply::Integer(9_007_199_254_740_992)),
            Reply::Integer(9_007_199_254_740_992)
        );
        // Recurses into arrays.
        let nested = stringify_large_numbers(Reply::Array(vec![Reply::Integer(-9_007_199_254_740_993)]));
        assert_eq!(nested, Reply::Array(vec![Reply::from("-9007199254740993")]));
    }
}
