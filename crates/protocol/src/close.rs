//! Application close codes of the `graphql-transport-ws` protocol.

use std::fmt;

/// Close codes the server uses for protocol-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    InvalidMessage,
    Unauthorized,
    ConnectionInitTimeout,
    SubscriberAlreadyExists,
    TooManyInitRequests,
}

impl CloseCode {
    /// Numeric close code sent in the close frame.
    pub const fn code(self) -> u16 {
        match self {
            Self::InvalidMessage => 4400,
            Self::Unauthorized => 4401,
            Self::ConnectionInitTimeout => 4408,
            Self::SubscriberAlreadyExists => 4409,
            Self::TooManyInitRequests => 4429,
        }
    }

    /// Maps a numeric code back to a protocol close code.
    pub const fn from_code(code: u16) -> Option<Self> {
        match code {
            4400 => Some(Self::InvalidMessage),
            4401 => Some(Self::Unauthorized),
            4408 => Some(Self::ConnectionInitTimeout),
            4409 => Some(Self::SubscriberAlreadyExists),
            4429 => Some(Self::TooManyInitRequests),
            _ => None,
        }
    }

    /// Standard reason text. 4409 carries the operation id, so its reason
    /// is built by the caller.
    pub const fn reason(self) -> &'static str {
        match self {
            Self::InvalidMessage => "Invalid message",
            Self::Unauthorized => "Unauthorized",
            Self::ConnectionInitTimeout => "Connection initialisation timeout",
            Self::SubscriberAlreadyExists => "Subscriber already exists",
            Self::TooManyInitRequests => "Too many initialisation requests",
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_protocol() {
        assert_eq!(CloseCode::InvalidMessage.code(), 4400);
        assert_eq!(CloseCode::Unauthorized.code(), 4401);
        assert_eq!(CloseCode::ConnectionInitTimeout.code(), 4408);
        assert_eq!(CloseCode::SubscriberAlreadyExists.code(), 4409);
        assert_eq!(CloseCode::TooManyInitRequests.code(), 4429);
    }

    #[test]
    fn from_code_roundtrip() {
        for code in [4400, 4401, 4408, 4409, 4429] {
            assert_eq!(CloseCode::from_code(code).map(u16::from), Some(code));
        }
        assert_eq!(CloseCode::from_code(1000), None);
    }

    #[test]
    fn reasons() {
        assert_eq!(CloseCode::Unauthorized.reason(), "Unauthorized");
        assert_eq!(
            CloseCode::TooManyInitRequests.reason(),
            "Too many initialisation requests"
        );
        assert_eq!(CloseCode::InvalidMessage.to_string(), "4400 Invalid message");
    }
}
