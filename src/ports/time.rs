/// Wall-clock source, in milliseconds since the Unix epoch.
///
/// Everything persisted (rate windows, cooldowns, diagnostic marks) is
/// stamped through this port so tests can drive time explicitly.
pub trait TimePort: Send + Sync {
    fn now_millis(&self) -> u64;
}
