use thiserror::Error;

/// Errors that can occur in the stellwerk scheduling layer.
#[derive(Debug, Error)]
pub enum StellwerkError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("ledger inconsistency: {0}")]
    Ledger(String),

    #[error("zeromq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("pid file error: {0}")]
    PidFile(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
