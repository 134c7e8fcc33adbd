use std::io;

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding protocol data. All of these are
/// fatal for the message they occur in; the transport above decides whether
/// the operation as a whole is worth repeating.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ProtocolError {
    /// The message head disagrees with the body, or the body structure is
    /// inconsistent with the chaining bits.
    MalformedMessage,
    /// A declared parameter type asks for more bytes than remain.
    TruncatedValue,
    /// The type bits do not match the parameter they were resolved against.
    UnknownType,
    /// The command byte is not one this side knows how to handle.
    UnknownCommand(u8),
    /// The value cannot be represented on the wire (oversized string or body).
    ValueTooLarge,
    /// A chained request was built from descriptors without a node address.
    MissingNode,
    Io(io::ErrorKind),
}

impl From<io::Error> for ProtocolError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        ProtocolError::Io(io_error.kind())
    }
}

/// Augmented `io::Write` that is aware of the amount of remaining free capacity
/// in the destination.
pub trait SizedWrite: io::Write {
    /// Remaining free capacity in the destination.
    fn free_capacity(&self) -> usize;
}

/// Augmented `io::Read` that is aware of the amount of remaining data in the
/// source.
pub trait SizedRead: io::Read {
    /// Remaining data in the source.
    fn remaining_data(&self) -> usize;
}

impl SizedWrite for io::Cursor<&mut [u8]> {
    #[inline]
    fn free_capacity(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

impl SizedRead for io::Cursor<&[u8]> {
    #[inline]
    fn remaining_data(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}
