use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, info};

use crate::error::Result;
use crate::store::CoordinationStore;

/// GET, compare, then SET/DEL in one server-side step.
///
/// ARGV: has_expected, expected, has_new, new, ttl_ms (0 = no expiry)
const COMPARE_AND_SWAP: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then return 0 end
elseif current then
  return 0
end
if ARGV[3] == '1' then
  if tonumber(ARGV[5]) > 0 then
    redis.call('SET', KEYS[1], ARGV[4], 'PX', ARGV[5])
  else
    redis.call('SET', KEYS[1], ARGV[4])
  end
else
  redis.call('DEL', KEYS[1])
end
return 1
"#;

/// Redis-backed coordination store.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    cas: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        info!(url = %redis_url, "Connecting to coordination store");

        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;

        info!("Connected to coordination store");
        Ok(Self {
            conn,
            cas: Script::new(COMPARE_AND_SWAP),
        })
    }
}

fn ttl_millis(ttl: Option<Duration>) -> u64 {
    ttl.map(|t| t.as_millis().max(1) as u64).unwrap_or(0)
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        debug!(key, "Store GET");
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        debug!(key, ttl = ?ttl, "Store SET");
        let mut conn = self.conn.clone();
        match ttl {
            Some(_) => {
                conn.pset_ex::<_, _, ()>(key, value, ttl_millis(ttl))
                    .await?
            }
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        debug!(key, "Store DEL");
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        debug!(key, ?expected, ?new, "Store CAS");
        let mut conn = self.conn.clone();
        let swapped: i32 = self
            .cas
            .key(key)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or(""))
            .arg(if new.is_some() { "1" } else { "0" })
            .arg(new.unwrap_or(""))
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }
}
