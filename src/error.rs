use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Buffer closed")]
    BufferClosed,

    #[error("Consumer error: {0}")]
    Consumer(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
