use crate::ports::{env::EnvError, EnvironmentPort, TimePort};
use std::time::{SystemTime, UNIX_EPOCH};

pub struct StdTimeAdapter;

impl TimePort for StdTimeAdapter {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

pub struct StdEnvAdapter;

impl EnvironmentPort for StdEnvAdapter {
    fn get_var(&self, key: &str) -> Result<String, EnvError> {
        std::env::var(key).map_err(|_| EnvError::NotFound(key.to_string()))
    }

    fn vars(&self) -> Vec<(String, String)> {
        // vars_os + lossy conversion: std::env::vars panics on non-UTF-8
        std::env::vars_os()
            .map(|(k, v)| {
                (
                    k.to_string_lossy().into_owned(),
                    v.to_string_lossy().into_owned(),
                )
            })
            .collect()
    }
}
