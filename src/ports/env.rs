use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnvError {
    #[error("Environment variable not found: {0}")]
    NotFound(String),
}

/// Read-only view of the parent process environment.
pub trait EnvironmentPort: Send + Sync {
    fn get_var(&self, key: &str) -> Result<String, EnvError>;
    fn vars(&self) -> Vec<(String, String)>;
}
