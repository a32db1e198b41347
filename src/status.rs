use std::fmt;

/// Final (or in-flight) state of an asynchronous operation.
///
/// Every status other than [`Status::Pending`] is terminal: once an
/// operation reaches it the finish callback runs exactly once and the
/// operation is recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Not yet determined; never delivered to a callback.
    Unknown = 0,
    Success,
    /// Still waiting on readiness or a timer.
    Pending,
    Timeout,
    /// The peer closed the connection (or reset it) while a transfer was
    /// outstanding.
    Disconnected,
    Canceled,
    /// A datagram did not fit the supplied buffer.
    BufferTooSmall,
    UnknownError,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::Pending | Status::Unknown)
    }

    pub(crate) fn from_u8(value: u8) -> Status {
        match value {
            1 => Status::Success,
            2 => Status::Pending,
            3 => Status::Timeout,
            4 => Status::Disconnected,
            5 => Status::Canceled,
            6 => Status::BufferTooSmall,
            7 => Status::UnknownError,
            _ => Status::Unknown,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Unknown => "unknown",
            Status::Success => "success",
            Status::Pending => "pending",
            Status::Timeout => "timeout",
            Status::Disconnected => "disconnected",
            Status::Canceled => "canceled",
            Status::BufferTooSmall => "buffer too small",
            Status::UnknownError => "unknown error",
        };
        f.write_str(name)
    }
}
