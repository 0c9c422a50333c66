#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("config error: {0}")]
    Config(String),

    #[error("worker pool error: {0}")]
    Pool(#[from] prefork::PoolError),

    #[error("signal setup error: {0}")]
    Signal(#[from] prefork::SignalError),

    #[error("failed to listen on port {port}: {source}")]
    Listen {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("event loop error: {0}")]
    EventLoop(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;
