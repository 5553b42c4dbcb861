//! Boundary to the byte-stream I/O adapter.

/// The physical (or emulated) byte-stream device under the stack.
///
/// Implementations use interior mutability where needed; the stack only
/// ever holds a shared reference. All three methods must be non-blocking.
pub trait Hal {
    /// Free-running monotonic milliseconds. Wraps every 49.7 days; the
    /// stack only ever computes differences.
    fn time_ms(&self) -> u32;

    /// Queue `bytes` for transmission. The data is consumed (copied or
    /// transmitted) before the call returns.
    fn send(&self, bytes: &[u8]);

    /// Instantaneous room available for [`Hal::send`], in octets.
    fn send_available(&self) -> u32;
}
