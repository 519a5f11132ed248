use graphwire_protocol::CloseCode;

/// A protocol-level failure. Always fatal to the connection, which is
/// closed with the matching code; the `Display` text is the close reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("Invalid message")]
    InvalidMessage,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Connection initialisation timeout")]
    InitTimeout,

    #[error("Subscriber for {0} already exists")]
    SubscriberAlreadyExists(String),

    #[error("Too many initialisation requests")]
    TooManyInitRequests,
}

impl ProtocolViolation {
    /// Close code sent for this violation.
    pub const fn close_code(&self) -> CloseCode {
        match self {
            Self::InvalidMessage => CloseCode::InvalidMessage,
            Self::Unauthorized => CloseCode::Unauthorized,
            Self::InitTimeout => CloseCode::ConnectionInitTimeout,
            Self::SubscriberAlreadyExists(_) => CloseCode::SubscriberAlreadyExists,
            Self::TooManyInitRequests => CloseCode::TooManyInitRequests,
        }
    }
}
