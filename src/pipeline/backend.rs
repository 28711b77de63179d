use crate::pipeline::error::Result;
use crate::pipeline::types::{PortFormat, PortId};

/// One buffer handed to an output callback.
///
/// The bytes belong to the hardware layer and are recycled as soon as the
/// callback returns, so anything a sink needs must be copied out.
#[derive(Debug, Clone, Copy)]
pub struct BufferChunk<'a> {
    pub data: &'a [u8],
    pub end_of_frame: bool,
}

impl<'a> BufferChunk<'a> {
    pub fn new(data: &'a [u8], end_of_frame: bool) -> Self {
        Self { data, end_of_frame }
    }
}

/// Delivery callback installed on an output port.
///
/// Runs on a hardware worker thread. Returning `true` tells the hardware
/// layer the output is finished for this round.
pub type BufferCallback = Box<dyn FnMut(PortId, &BufferChunk<'_>) -> bool + Send>;

/// Hardware abstraction the pipeline is built on.
///
/// Connections are owned by, and addressed through, their downstream input
/// port. All methods take `&self`; implementations manage interior
/// mutability.
pub trait MediaBackend: Send + Sync {
    /// Stage a format on a port. Takes effect on `commit`.
    fn set_format(&self, port: PortId, format: &PortFormat) -> Result<()>;

    /// Validate and lock the staged format.
    fn commit(&self, port: PortId) -> Result<()>;

    /// Create a connection from an upstream output to a downstream input.
    fn connect(&self, upstream: PortId, downstream: PortId) -> Result<()>;

    /// Start data flowing across the connection into `downstream`.
    fn enable_connection(&self, downstream: PortId) -> Result<()>;

    /// Stop data flowing across the connection into `downstream`.
    fn disable_connection(&self, downstream: PortId) -> Result<()>;

    /// Destroy the (disabled) connection into `downstream`.
    fn disconnect(&self, downstream: PortId) -> Result<()>;

    /// Enable an output port and install its delivery callback.
    fn enable_output(&self, port: PortId, callback: BufferCallback) -> Result<()>;

    /// Disable an output port and drop its callback.
    fn disable_output(&self, port: PortId) -> Result<()>;

    /// Start (`true`) or stop (`false`) exposure and processing on a source port.
    fn set_capture(&self, port: PortId, active: bool) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_borrows_data() {
        let bytes = [1u8, 2, 3];
        let chunk = BufferChunk::new(&bytes, true);
        assert_eq!(chunk.data, &[1, 2, 3]);
        assert!(chunk.end_of_frame);
    }

    /// The backend must be usable as `dyn MediaBackend`.
    #[test]
    fn trait_is_object_safe() {
        fn _accepts_dyn(_backend: &dyn MediaBackend) {}
    }

    #[test]
    fn trait_object_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Box<dyn MediaBackend>>();
    }

    #[test]
    fn callback_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<BufferCallback>();
    }
}
