use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Flat key-value persistence shared by every component.
///
/// Keys are independent: writes are last-writer-wins per key and no
/// operation spans several keys atomically. An absent key means "use the
/// default".
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    fn get_u64(&self, key: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.get(key)?.and_then(|v| v.as_u64()))
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, StoreError> {
        Ok(self.get(key)?.and_then(|v| v.as_bool()))
    }

    fn contains(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }
}
