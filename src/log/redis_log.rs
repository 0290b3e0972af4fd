// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;

use bytes::Bytes;
use redis::aio::{ConnectionLike, MultiplexedConnection};
use redis::cluster::{ClusterClient, ClusterClientBuilder};
use redis::cluster_async::ClusterConnection;
use redis::streams::{StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, ConnectionInfo, IntoConnectionInfo, RedisError, Value};
use tracing::{debug, info};

use super::{
    Block, ClaimBatch, Entry, EntryId, LogClient, LogError, LogResult, PendingEntry, ReadCursor,
    StartPosition,
};

/// Longest single `BLOCK` a forever-blocking read issues before asking again.
/// Keeps driver and proxy response timeouts out of the picture.
const BLOCK_SLICE_MS: usize = 5_000;

/// [`LogClient`] over Redis Streams.
///
/// Holds two handles of the same connection type: blocking group reads go to
/// `blocking`, everything else to `commands`, so a consumer parked on
/// `XREADGROUP ... BLOCK` never delays the publisher's appends or the
/// reclaimer's claims.
#[derive(Clone)]
pub struct RedisLog<C> {
    commands: C,
    blocking: C,
}

impl<C> RedisLog<C> {
    pub fn from_connections(commands: C, blocking: C) -> Self {
        Self { commands, blocking }
    }
}

impl RedisLog<MultiplexedConnection> {
    /// Connect to a single Redis node.
    pub async fn connect_standalone(node: &str, password: Option<&str>) -> LogResult<Self> {
        let info = connection_info(node, password)?;
        info!(addr = %info.addr, "connecting to redis");
        let client = redis::Client::open(info)?;
        let commands = client.get_multiplexed_tokio_connection().await?;
        let blocking = client.get_multiplexed_tokio_connection().await?;
        Ok(Self::from_connections(commands, blocking))
    }
}

impl RedisLog<ClusterConnection> {
    /// Connect to a Redis Cluster through any subset of its nodes.
    pub async fn connect_cluster(nodes: &[String], password: Option<&str>) -> LogResult<Self> {
        info!(nodes = ?nodes, "connecting to redis cluster");
        let client = cluster_client(nodes, password)?;
        let commands = client.get_async_connection().await?;
        let blocking = client.get_async_connection().await?;
        Ok(Self::from_connections(commands, blocking))
    }
}

/// Cluster client that surfaces the first failure of a request.
///
/// The driver's own retries (16, with exponential backoff) are turned off,
/// the workers' retry budgets are the only retry layer.
fn cluster_client(nodes: &[String], password: Option<&str>) -> LogResult<ClusterClient> {
    let infos = nodes
        .iter()
        .map(|node| connection_info(node, password))
        .collect::<LogResult<Vec<_>>>()?;
    let mut builder = ClusterClientBuilder::new(infos).retries(0);
    if let Some(password) = password {
        builder = builder.password(password.to_string());
    }
    Ok(builder.build()?)
}

/// Accepts `redis://` / `rediss://` urls, `host:port` and the bare `:port`
/// shorthand (localhost).
fn connection_info(node: &str, password: Option<&str>) -> LogResult<ConnectionInfo> {
    let url = if node.contains("://") {
        node.to_string()
    } else if let Some(port) = node.strip_prefix(':') {
        format!("redis://127.0.0.1:{}", port)
    } else {
        format!("redis://{}", node)
    };
    let mut info = url
        .as_str()
        .into_connection_info()
        .map_err(|err| LogError::Connection(format!("invalid node address {}: {}", node, err)))?;
    if let Some(password) = password {
        info.redis.password = Some(password.to_string());
    }
    Ok(info)
}

fn classify(err: RedisError, stream: &str, group: &str) -> LogError {
    match err.code() {
        Some("BUSYGROUP") => LogError::GroupExists {
            stream: stream.to_string(),
            group: group.to_string(),
        },
        Some("NOGROUP") => LogError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        },
        _ if err.is_timeout() => LogError::Timeout(err.to_string()),
        _ if err.is_connection_dropped() || err.is_connection_refusal() => {
            LogError::Connection(err.to_string())
        }
        _ => LogError::Redis(err),
    }
}

fn into_entry(stream_id: StreamId) -> LogResult<Entry> {
    let StreamId { id, map } = stream_id;
    let mut fields = map
        .into_iter()
        .map(|(key, value)| {
            let raw: Vec<u8> = redis::from_redis_value(&value)?;
            Ok((key, Bytes::from(raw)))
        })
        .collect::<Result<Vec<_>, RedisError>>()?;
    // the driver hands fields back as a hash map
    fields.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(Entry::new(id.parse()?, fields))
}

/// Decode an XAUTOCLAIM reply.
///
/// Redis 7 replies `[next cursor, entries, deleted ids]` and never lists a
/// deleted entry among the claimed ones. Redis 6.2 has no third element and
/// puts a deleted entry inline, as a bare nil or as an id without fields.
fn claim_batch(reply: &Value) -> LogResult<ClaimBatch> {
    let unexpected = |what: String| LogError::UnexpectedReply(format!("XAUTOCLAIM {what}"));
    let (cursor, claimed, deleted) = match reply {
        Value::Bulk(parts) => match parts.as_slice() {
            [cursor, claimed] => (cursor, claimed, None),
            [cursor, claimed, deleted] => (cursor, claimed, Some(deleted)),
            other => return Err(unexpected(format!("reply has {} elements", other.len()))),
        },
        other => return Err(unexpected(format!("reply {:?}", other))),
    };

    let next_cursor: String = redis::from_redis_value(cursor)?;
    let mut batch = ClaimBatch {
        next_cursor: next_cursor.parse()?,
        ..ClaimBatch::default()
    };

    let Value::Bulk(claimed) = claimed else {
        return Err(unexpected(format!("entries {:?}", claimed)));
    };
    for item in claimed {
        match item {
            Value::Nil => batch.missing += 1,
            Value::Bulk(pair) => match pair.as_slice() {
                [id, Value::Nil] => {
                    let id: String = redis::from_redis_value(id)?;
                    batch.deleted.push(id.parse()?);
                }
                [id, fields] => batch.entries.push(entry_from_reply(id, fields)?),
                _ => return Err(unexpected(format!("entry {:?}", item))),
            },
            other => return Err(unexpected(format!("entry {:?}", other))),
        }
    }

    if let Some(deleted) = deleted {
        let ids: Vec<String> = redis::from_redis_value(deleted)?;
        for id in ids {
            batch.deleted.push(id.parse()?);
        }
    }
    Ok(batch)
}

/// An `[id, [field, value, ...]]` pair, fields kept in server order.
fn entry_from_reply(id: &Value, fields: &Value) -> LogResult<Entry> {
    let id: String = redis::from_redis_value(id)?;
    let pairs: Vec<(String, Vec<u8>)> = redis::from_redis_value(fields)?;
    let fields = pairs
        .into_iter()
        .map(|(key, value)| (key, Bytes::from(value)))
        .collect();
    Ok(Entry::new(id.parse()?, fields))
}

impl<C> LogClient for RedisLog<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    async fn ping(&self) -> LogResult<()> {
        let mut conn = self.commands.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(reply = %pong, "redis ping");
        Ok(())
    }

    async fn append(&self, stream: &str, fields: &[(String, Bytes)]) -> LogResult<EntryId> {
        let mut conn = self.commands.clone();
        let items: Vec<(&str, &[u8])> = fields
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_ref()))
            .collect();
        let id: String = conn.xadd(stream, "*", &items).await?;
        id.parse()
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> LogResult<()> {
        let mut conn = self.commands.clone();
        let created: Result<(), RedisError> = conn
            .xgroup_create_mkstream(stream, group, start.as_arg())
            .await;
        created.map_err(|err| classify(err, stream, group))
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        block: Block,
        count: usize,
    ) -> LogResult<Vec<Entry>> {
        let mut conn = match block {
            Block::NoWait => self.commands.clone(),
            Block::For(_) | Block::Forever => self.blocking.clone(),
        };
        let block_ms = match block {
            Block::NoWait => None,
            Block::For(duration) => Some(duration.as_millis().max(1) as usize),
            Block::Forever => Some(BLOCK_SLICE_MS),
        };
        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count.max(1));
        if let Some(block_ms) = block_ms {
            options = options.block(block_ms);
        }
        let ids = [cursor.as_arg()];

        loop {
            let reply: Option<StreamReadReply> = conn
                .xread_options(&[stream], &ids, &options)
                .await
                .map_err(|err| classify(err, stream, group))?;
            let entries = reply
                .map(|reply| reply.keys)
                .unwrap_or_default()
                .into_iter()
                .flat_map(|key| key.ids)
                .map(into_entry)
                .collect::<LogResult<Vec<_>>>()?;

            // history reads answer immediately, even when empty
            let keep_waiting = block == Block::Forever
                && cursor == ReadCursor::Undelivered
                && entries.is_empty();
            if !keep_waiting {
                return Ok(entries);
            }
        }
    }

    async fn acknowledge(&self, stream: &str, group: &str, id: &EntryId) -> LogResult<bool> {
        let mut conn = self.commands.clone();
        let removed: usize = conn
            .xack(stream, group, &[id.to_string()])
            .await
            .map_err(|err| classify(err, stream, group))?;
        Ok(removed > 0)
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        start: &EntryId,
        count: usize,
    ) -> LogResult<ClaimBatch> {
        let mut conn = self.commands.clone();
        let mut cmd = redis::cmd("XAUTOCLAIM");
        cmd.arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg(start.to_string())
            .arg("COUNT")
            .arg(count.max(1));
        let reply: Value = cmd
            .query_async(&mut conn)
            .await
            .map_err(|err| classify(err, stream, group))?;
        claim_batch(&reply)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        start: &EntryId,
        count: usize,
    ) -> LogResult<Vec<PendingEntry>> {
        let mut conn = self.commands.clone();
        let reply: StreamPendingCountReply = conn
            .xpending_count(stream, group, start.to_string(), "+", count)
            .await
            .map_err(|err| classify(err, stream, group))?;
        reply
            .ids
            .into_iter()
            .map(|pending| {
                Ok(PendingEntry {
                    id: pending.id.parse()?,
                    consumer: pending.consumer,
                    idle: Duration::from_millis(pending.last_delivered_ms as u64),
                    delivery_count: pending.times_delivered as u64,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use redis::{Cmd, Pipeline, RedisFuture};

    use super::*;

    /// Answers every command with the same reply.
    #[derive(Clone)]
    struct Canned(Value);

    impl ConnectionLike for Canned {
        fn req_packed_command<'a>(&'a mut self, _cmd: &'a Cmd) -> RedisFuture<'a, Value> {
            let reply = self.0.clone();
            Box::pin(async move { Ok(reply) })
        }

        fn req_packed_commands<'a>(
            &'a mut self,
            _cmd: &'a Pipeline,
            _offset: usize,
            _count: usize,
        ) -> RedisFuture<'a, Vec<Value>> {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn get_db(&self) -> i64 {
            0
        }
    }

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    fn raw_entry(id: &str, message: &str) -> Value {
        Value::Bulk(vec![
            data(id),
            Value::Bulk(vec![data("message"), data(message), data("seq"), data("1")]),
        ])
    }

    async fn claim_with_reply(reply: Value) -> LogResult<ClaimBatch> {
        let log = RedisLog::from_connections(Canned(reply.clone()), Canned(reply));
        log.claim_stale(
            "mystream",
            "mygroup",
            "testConsumer",
            Duration::from_secs(300),
            &EntryId::MIN,
            10,
        )
        .await
    }

    #[tokio::test]
    async fn two_element_claim_reply_is_accepted() {
        let reply = Value::Bulk(vec![
            data("0-0"),
            Value::Bulk(vec![raw_entry("1-0", "Message ID: 1")]),
        ]);

        let batch = claim_with_reply(reply).await.unwrap();
        assert!(batch.next_cursor.is_min());
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].id, EntryId::new(1, 0));
        assert_eq!(batch.entries[0].field_str("message"), Some("Message ID: 1"));
        assert_eq!(batch.entries[0].fields[1].0, "seq");
        assert!(batch.deleted.is_empty());
        assert_eq!(batch.missing, 0);
    }

    #[tokio::test]
    async fn three_element_claim_reply_reports_deleted_ids() {
        let reply = Value::Bulk(vec![
            data("1700000000000-3"),
            Value::Bulk(vec![raw_entry("1700000000000-1", "Message ID: 1")]),
            Value::Bulk(vec![data("1700000000000-2")]),
        ]);

        let batch = claim_with_reply(reply).await.unwrap();
        assert_eq!(batch.next_cursor, EntryId::new(1_700_000_000_000, 3));
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.deleted, vec![EntryId::new(1_700_000_000_000, 2)]);
    }

    #[tokio::test]
    async fn nil_claimed_entries_count_as_deleted() {
        let reply = Value::Bulk(vec![
            data("0-0"),
            Value::Bulk(vec![
                Value::Nil,
                Value::Bulk(vec![data("5-0"), Value::Nil]),
                raw_entry("6-0", "Message ID: 6"),
            ]),
        ]);

        let batch = claim_with_reply(reply).await.unwrap();
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].id, EntryId::new(6, 0));
        assert_eq!(batch.deleted, vec![EntryId::new(5, 0)]);
        assert_eq!(batch.missing, 1);
    }

    #[tokio::test]
    async fn malformed_claim_replies_are_rejected() {
        for reply in [
            Value::Bulk(vec![data("0-0")]),
            Value::Status("OK".to_string()),
            Value::Bulk(vec![data("0-0"), data("not-a-list")]),
            Value::Bulk(vec![data("0-0"), Value::Bulk(vec![Value::Int(1)])]),
        ] {
            let err = claim_with_reply(reply).await.unwrap_err();
            assert!(matches!(err, LogError::UnexpectedReply(_)), "{err:?}");
        }
    }

    #[test]
    fn cluster_client_builds_with_password() {
        let nodes = vec![":7000".to_string(), ":7001".to_string()];
        assert!(cluster_client(&nodes, Some("s3cret")).is_ok());
        assert!(cluster_client(&nodes, None).is_ok());
        assert!(cluster_client(&[], None).is_err());
    }

    #[test]
    fn port_shorthand_means_localhost() {
        let info = connection_info(":7000", None).unwrap();
        assert_eq!(info.addr.to_string(), "127.0.0.1:7000");
        assert_eq!(info.redis.password, None);
    }

    #[test]
    fn password_is_applied_to_every_form() {
        for node in ["redis://10.0.0.1:6379", "10.0.0.1:6379", ":6379"] {
            let info = connection_info(node, Some("s3cret")).unwrap();
            assert_eq!(info.redis.password.as_deref(), Some("s3cret"));
        }
    }

    #[test]
    fn invalid_address_is_a_connection_error() {
        let err = connection_info("redis://", None).unwrap_err();
        assert!(matches!(err, LogError::Connection(_)));
    }

    #[test]
    fn stream_id_fields_are_sorted_bytes() {
        let mut map = std::collections::HashMap::new();
        map.insert(
            "seq".to_string(),
            redis::Value::Data(b"3".to_vec()),
        );
        map.insert(
            "message".to_string(),
            redis::Value::Data(b"Message ID: 3".to_vec()),
        );
        let entry = into_entry(StreamId {
            id: "1700000000000-0".to_string(),
            map,
        })
        .unwrap();
        assert_eq!(entry.id, EntryId::new(1_700_000_000_000, 0));
        assert_eq!(entry.fields[0].0, "message");
        assert_eq!(entry.field_str("seq"), Some("3"));
    }
}
