//! Server-side Lua scripts for atomic state transitions.
//!
//! The two multi-key transitions of the queue run as Redis scripts so
//! that no two workers can observe a job id in more than one collection:
//!
//! - `move_to_active`: waiting -> active, claiming one id for dispatch
//! - `promote_delayed`: delayed -> waiting, for every id that is due
//!
//! Every mutated key is passed through KEYS so a cluster slot router can
//! route the invocation; the job hash prefix rides along as a KEYS entry
//! because the popped id is only known server-side.

use redis::aio::ConnectionManager;
use redis::Script;
use tracing::warn;
use uuid::Uuid;

use crate::keys::QueueKeys;

/// Pops the tail of waiting, pushes it to the head of active and stamps
/// `startedAt` on the job hash. Returns the claimed id, or nil when the
/// waiting list is empty.
const MOVE_TO_ACTIVE_LUA: &str = r#"
local id = redis.call('RPOP', KEYS[1])
if id then
    redis.call('LPUSH', KEYS[2], id)
    redis.call('HSET', KEYS[3] .. id, 'startedAt', ARGV[1])
    return id
end
return false
"#;

/// Moves every delayed id with score <= now into the waiting list and
/// returns the promoted ids. Each id is moved at most once even when the
/// script runs concurrently on several workers.
const PROMOTE_DELAYED_LUA: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for i, id in ipairs(ids) do
    redis.call('ZREM', KEYS[1], id)
    redis.call('LPUSH', KEYS[2], id)
end
return ids
"#;

/// The queue's server-side scripts, hashed once at construction.
#[derive(Clone)]
pub struct Scripts {
    move_to_active: Script,
    promote_delayed: Script,
}

impl Default for Scripts {
    fn default() -> Self {
        Self::new()
    }
}

impl Scripts {
    pub fn new() -> Self {
        Self {
            move_to_active: Script::new(MOVE_TO_ACTIVE_LUA),
            promote_delayed: Script::new(PROMOTE_DELAYED_LUA),
        }
    }

    /// Loads both scripts into the server's script cache.
    ///
    /// Invocations fall back to EVAL on a cold cache, so this is a
    /// warm-up rather than a requirement.
    pub async fn load(&self, conn: &mut ConnectionManager) -> Result<(), redis::RedisError> {
        for code in [MOVE_TO_ACTIVE_LUA, PROMOTE_DELAYED_LUA] {
            redis::cmd("SCRIPT")
                .arg("LOAD")
                .arg(code)
                .query_async::<_, String>(conn)
                .await?;
        }
        Ok(())
    }

    /// Atomically claims one waiting id for execution.
    pub async fn move_to_active(
        &self,
        conn: &mut ConnectionManager,
        keys: &QueueKeys,
        now_ms: i64,
    ) -> Result<Option<Uuid>, redis::RedisError> {
        let raw: Option<String> = self
            .move_to_active
            .key(keys.waiting())
            .key(keys.active())
            .key(keys.job_prefix())
            .arg(now_ms)
            .invoke_async(conn)
            .await?;

        Ok(raw.and_then(|id| parse_id(&id)))
    }

    /// Atomically promotes every due delayed id into waiting.
    pub async fn promote_delayed(
        &self,
        conn: &mut ConnectionManager,
        keys: &QueueKeys,
        now_ms: i64,
    ) -> Result<Vec<Uuid>, redis::RedisError> {
        let raw: Vec<String> = self
            .promote_delayed
            .key(keys.delayed())
            .key(keys.waiting())
            .arg(now_ms)
            .invoke_async(conn)
            .await?;

        Ok(raw.iter().filter_map(|id| parse_id(id)).collect())
    }
}

fn parse_id(raw: &str) -> Option<Uuid> {
    match Uuid::parse_str(raw) {
        Ok(id) => Some(id),
        Err(_) => {
            warn!(id = %raw, "Ignoring non-UUID entry in queue collection");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripts_have_distinct_hashes() {
        let scripts = Scripts::new();
        assert_ne!(
            scripts.move_to_active.get_hash(),
            scripts.promote_delayed.get_hash()
        );
    }

    #[test]
    fn test_parse_id() {
        let id = Uuid::new_v4();
        assert_eq!(parse_id(&id.to_string()), Some(id));
        assert_eq!(parse_id("not-a-uuid"), None);
    }
}
