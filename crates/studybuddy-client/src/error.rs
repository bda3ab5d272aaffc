#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with an error body.
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("realtime connection failed: {0}")]
    Realtime(String),

    #[error("attachment is {size} bytes, the limit is {limit}")]
    AttachmentTooLarge { size: usize, limit: usize },

    #[error("a message needs text or an attachment")]
    EmptyMessage,

    #[error("a send is already in flight")]
    SendInFlight,

    #[error("only your own messages can be deleted")]
    NotAuthor,

    #[error("could not decode server payload: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;
