//! Redis-backed store.
//!
//! Procedures run as Lua scripts, which Redis executes atomically. Script
//! handles are process-wide; each is hashed once and invoked by SHA, falling
//! back to loading the source when the server does not know it yet.

use std::sync::OnceLock;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{RedisWrite, Script, ToRedisArgs, Value};
use tracing::{debug, info};

use super::{Arg, AtomicStore, Procedure, Reply, StoreResult};

/// Shared script handle for `procedure`.
fn script(procedure: Procedure) -> &'static Script {
    static GCRA: OnceLock<Script> = OnceLock::new();
    static SLIDING_WINDOW: OnceLock<Script> = OnceLock::new();

    let cell = match procedure {
        Procedure::Gcra => &GCRA,
        Procedure::SlidingWindow => &SLIDING_WINDOW,
    };
    cell.get_or_init(|| Script::new(procedure.lua_source()))
}

impl ToRedisArgs for Arg {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + RedisWrite,
    {
        match self {
            Arg::Int(value) => value.write_redis_args(out),
            // plain decimal notation, which Lua's tonumber always accepts
            Arg::Float(value) => out.write_arg(value.to_string().as_bytes()),
        }
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        match value {
            Value::Int(i) => Reply::Int(i),
            Value::BulkString(bytes) => Reply::Text(String::from_utf8_lossy(&bytes).into_owned()),
            Value::SimpleString(s) => Reply::Text(s),
            Value::Nil => Reply::Nil,
            other => Reply::Other(format!("{:?}", other)),
        }
    }
}

/// A [`AtomicStore`] talking to a Redis server.
///
/// Cloning is cheap and shares the underlying multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to the server at `url` (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(url = %url, "Connected to redis");
        Ok(Self { conn })
    }

    /// Register both procedures with the server up front.
    ///
    /// Optional: invocation loads a missing script on demand.
    pub async fn preload(&self) -> StoreResult<()> {
        for procedure in [Procedure::Gcra, Procedure::SlidingWindow] {
            let mut conn = self.conn.clone();
            let sha: String = script(procedure).prepare_invoke().load_async(&mut conn).await?;
            debug!(procedure = procedure.name(), sha = %sha, "Loaded procedure");
        }
        Ok(())
    }
}

#[async_trait]
impl AtomicStore for RedisStore {
    async fn run(&self, procedure: Procedure, key: &str, args: &[Arg]) -> StoreResult<Vec<Reply>> {
        let mut invocation = script(procedure).prepare_invoke();
        invocation.key(key);
        for arg in args {
            invocation.arg(arg);
        }

        let mut conn = self.conn.clone();
        let values: Vec<Value> = invocation.invoke_async(&mut conn).await?;
        Ok(values.into_iter().map(Reply::from).collect())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }
}
