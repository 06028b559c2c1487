//! Batching and transactions.
//!
//! A [`Pipeline`] collects commands, hands them to a [`BatchExecutor`]
//! (single connection or cluster) in one submission, and returns the
//! replies positionally. With `atomic` set the batch is wrapped in
//! `MULTI`/`EXEC` and the `EXEC` array is post-processed with each queued
//! command's reply transform.

use async_trait::async_trait;
use bytes::Bytes;
use redlink_core::{RedisError, RedisResult, Reply, ReplyErrorKind};

use crate::command::{
    arg, transform_reply, Command, CommandFlags, CommandSpec, KeyExtractor, ReplyReceiver,
};

/// One command inside a batch: everything a [`Command`] knows, minus the
/// completion handle, so the executor can re-issue it on cluster retries.
#[derive(Debug, Clone)]
pub struct BatchCommand {
    /// Lowercased name.
    pub name: String,
    /// Raw arguments.
    pub args: Vec<Bytes>,
    /// Classification flags.
    pub flags: CommandFlags,
    /// Key positions.
    pub keys: KeyExtractor,
}

impl BatchCommand {
    /// Classify `name` through the static table.
    #[must_use]
    pub fn new(name: &str, args: Vec<Bytes>) -> Self {
        let name = name.to_ascii_lowercase();
        let spec = CommandSpec::lookup(&name)
            .copied()
            .unwrap_or_else(CommandSpec::unknown);
        Self {
            name,
            args,
            flags: spec.flags,
            keys: spec.keys,
        }
    }

    /// Descriptor for a runtime-registered command.
    #[must_use]
    pub fn custom(name: &str, args: Vec<Bytes>, num_keys: Option<usize>) -> Self {
        let (cmd, _rx) = Command::custom(name, args, num_keys);
        Self {
            name: cmd.name,
            args: cmd.args,
            flags: cmd.flags,
            keys: cmd.keys,
        }
    }

    /// Materialise a submittable command with a fresh completion handle.
    #[must_use]
    pub fn to_command(&self) -> (Command, ReplyReceiver) {
        let (mut cmd, rx) = Command::new(&self.name, self.args.clone());
        cmd.flags = self.flags;
        cmd.keys = self.keys;
        (cmd, rx)
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
            if let Some(a) = self.args.get_mut(i) {
                let mut prefixed = Vec::with_capacity(prefix.len() + a.len());
                prefixed.extend_from_slice(prefix.as_bytes());
                prefixed.extend_from_slice(a);
                *a = Bytes::from(prefixed);
            }
        }
    }
}

/// Executes one positional batch against a backend.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    /// Submit the whole batch in order and collect one result per
    /// position.
    async fn execute(&self, batch: Vec<BatchCommand>) -> RedisResult<Vec<RedisResult<Reply>>>;

    /// Whether this executor routes across a cluster.
    fn cluster_mode(&self) -> bool {
        false
    }
}

/// An ordered batch of commands with positional results.
pub struct Pipeline {
    executor: std::sync::Arc<dyn BatchExecutor>,
    commands: Vec<BatchCommand>,
    atomic: bool,
    nesting: u32,
    key_prefix: Option<String>,
}

impl Pipeline {
    pub(crate) fn new(executor: std::sync::Arc<dyn BatchExecutor>, atomic: bool) -> Self {
        Self {
            executor,
            commands: Vec::new(),
            atomic,
            nesting: 0,
            key_prefix: None,
        }
    }

    /// Apply a key prefix to every queued command. Set before queueing so
    /// slots are computed on the prefixed keys.
    #[must_use]
    pub(crate) fn with_key_prefix(mut self, prefix: Option<String>) -> Self {
        self.key_prefix = prefix;
        self
    }

    fn push(&mut self, mut command: BatchCommand) -> &mut Self {
        if let Some(prefix) = &self.key_prefix {
            command.apply_key_prefix(prefix);
        }
        self.commands.push(command);
        self
    }

    /// Queue an arbitrary command.
    pub fn cmd(&mut self, name: &str, args: Vec<Bytes>) -> &mut Self {
        self.push(BatchCommand::new(name, args))
    }

    /// Queue a registered custom command.
    pub fn custom(&mut self, name: &str, args: Vec<Bytes>, num_keys: Option<usize>) -> &mut Self {
        self.push(BatchCommand::custom(name, args, num_keys))
    }

    /// Open a nested transaction block explicitly.
    pub fn multi(&mut self) -> &mut Self {
        self.nesting += 1;
        self.cmd("multi", Vec::new())
    }

    /// Close a nested transaction block explicitly.
    pub fn exec_block(&mut self) -> &mut Self {
        self.nesting = self.nesting.saturating_sub(1);
        self.cmd("exec", Vec::new())
    }

    /// Queue `SET key value`.
    pub fn set(&mut self, key: &str, value: impl AsRef<[u8]>) -> &mut Self {
        self.cmd("set", vec![arg(key), arg(value)])
    }

    /// Queue `GET key`.
    pub fn get(&mut self, key: &str) -> &mut Self {
        self.cmd("get", vec![arg(key)])
    }

    /// Queue `INCR key`.
    pub fn incr(&mut self, key: &str) -> &mut Self {
        self.cmd("incr", vec![arg(key)])
    }

    /// Queue `DEL key...`.
    pub fn del(&mut self, keys: &[&str]) -> &mut Self {
        self.cmd("del", keys.iter().map(|k| arg(k)).collect())
    }

    /// Queue `HSET key field value`.
    pub fn hset(&mut self, key: &str, field: &str, value: impl AsRef<[u8]>) -> &mut Self {
        self.cmd("hset", vec![arg(key), arg(field), arg(value)])
    }

    /// Queue `HGETALL key`.
    pub fn hgetall(&mut self, key: &str) -> &mut Self {
        self.cmd("hgetall", vec![arg(key)])
    }

    /// Number of queued commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Submit the batch and collect one result per queued command.
    ///
    /// In atomic mode the batch is wrapped in `MULTI`/`EXEC`; the result
    /// vector then holds the `MULTI` reply, one `QUEUED` per command, and
    /// the transformed `EXEC` array.
    pub async fn exec(&mut self) -> RedisResult<Vec<RedisResult<Reply>>> {
        if self.nesting != 0 {
            return Err(RedisError::Abort(
                "unbalanced multi/exec blocks in pipeline".to_string(),
            ));
        }
        let queued = std::mem::take(&mut self.commands);
        if queued.is_empty() {
            return Ok(Vec::new());
        }
        if self.executor.cluster_mode() && queued.iter().any(|c| c.flags.is_custom) {
            return Err(RedisError::CustomInPipeline);
        }
        let batch = if self.atomic {
            let mut wrapped = Vec::with_capacity(queued.len() + 2);
            wrapped.push(BatchCommand::new("multi", Vec::new()));
            wrapped.extend(queued.iter().cloned());
            wrapped.push(BatchCommand::new("exec", Vec::new()));
            wrapped
        } else {
            queued.clone()
        };
        let mut results = self.executor.execute(batch).await?;
        if self.atomic {
            if let Some(last) = results.last_mut() {
                if let Ok(Reply::Array(subs)) = last {
                    let transformed: Vec<Reply> = std::mem::take(subs)
                        .into_iter()
                        .enumerate()
                        .map(|(i, sub)| match queued.get(i) {
                            Some(cmd) => transform_reply(&cmd.name, &cmd.args, sub),
                            None => sub,
                        })
                        .collect();
                    *last = Ok(Reply::Array(transformed));
                }
            }
        }
        Ok(results)
    }
}

/// Decide whether a finished batch may be transparently re-dispatched.
///
/// Retriable iff every error position carries the same failure, that
/// failure is a cluster-retriable kind, and no position that succeeded is
/// a write issued outside a transaction. An `EXECABORT` on the `EXEC`
/// position does not participate: the queueing errors that caused it are
/// already visible at their own positions.
pub(crate) fn batch_retry_error<'a>(
    batch: &[BatchCommand],
    results: &'a [RedisResult<Reply>],
    in_transaction: bool,
) -> Option<&'a RedisError> {
    let mut representative: Option<&RedisError> = None;
    for (i, result) in results.iter().enumerate() {
        match result {
            Err(err) => {
                let is_exec = batch.get(i).is_some_and(|c| c.name == "exec");
                if is_exec
                    && matches!(err.reply_kind(), Some(ReplyErrorKind::ExecAbort))
                {
                    continue;
                }
                match representative {
                    None => representative = Some(err),
                    Some(first) if first.same_failure(err) => {}
                    Some(_) => return None,
                }
            }
            Ok(_) => {
                let write_outside_tx = batch
                    .get(i)
                    .is_some_and(|c| c.flags.is_write && !in_transaction);
                if write_outside_tx {
                    return None;
                }
            }
        }
    }
    representative.filter(|err| err.is_cluster_retriable())
}
