//! Atomic server-side scripts.
//!
//! Every script receives the full canonical key vector as KEYS and a
//! token (plus TTL where relevant) as ARGV, and observes the whole
//! vector atomically on that server: either every key is touched or
//! none is. Partial per-server state is never exposed.

/// Set every key to the token with a millisecond expiry, but only if
/// none of them exists. Returns 1 on success, 0 without changes
/// otherwise. The single-key form degenerates to `SET key token NX PX`.
pub(crate) const ACQUIRE_SCRIPT: &str = r#"
for _, key in ipairs(KEYS) do
  if redis.call("EXISTS", key) == 1 then
    return 0
  end
end
for _, key in ipairs(KEYS) do
  redis.call("SET", key, ARGV[1], "PX", ARGV[2])
end
return 1
"#;

/// Delete every key whose value still equals the token. Returns the
/// number of deletions, 0 if nothing matched.
pub(crate) const RELEASE_SCRIPT: &str = r#"
local removed = 0
for _, key in ipairs(KEYS) do
  if redis.call("GET", key) == ARGV[1] then
    removed = removed + redis.call("DEL", key)
  end
end
return removed
"#;

/// Re-arm the expiry of every key, but only if all of them still
/// carry the token. Returns 1 on success, 0 without changes otherwise.
pub(crate) const EXTEND_SCRIPT: &str = r#"
for _, key in ipairs(KEYS) do
  if redis.call("GET", key) ~= ARGV[1] then
    return 0
  end
end
for _, key in ipairs(KEYS) do
  redis.call("PEXPIRE", key, ARGV[2])
end
return 1
"#;
