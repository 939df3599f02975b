//! Size-bounded output sinks.
//!
//! Child process output is pumped through a [`BoundedSink`]: the first
//! `cap` bytes are captured (and forwarded to an optional caller
//! writer), everything past the cap is discarded. Writes always report
//! full success so a chatty child is never blocked or failed by the
//! cap.

use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;

/// A caller-supplied output writer shared across the commands of one
/// execution call.
pub type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Wraps a writer for use as a [`SharedWriter`].
pub fn shared_writer<W: Write + Send + 'static>(writer: W) -> SharedWriter {
    Arc::new(Mutex::new(Box::new(writer)))
}

/// A write sink that captures at most `cap` bytes and drops the rest.
pub struct BoundedSink {
    cap: usize,
    captured: Vec<u8>,
    forward: Option<SharedWriter>,
    truncated: bool,
}

impl BoundedSink {
    /// Creates a capture-only sink.
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            captured: Vec::new(),
            forward: None,
            truncated: false,
        }
    }

    /// Creates a sink that also forwards the capped byte stream to
    /// `writer`.
    pub fn forwarding(cap: usize, writer: SharedWriter) -> Self {
        Self {
            forward: Some(writer),
            ..Self::new(cap)
        }
    }

    /// Returns `true` once at least one byte has been dropped.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Bytes captured so far.
    pub fn captured(&self) -> &[u8] {
        &self.captured
    }

    /// Takes the captured bytes, leaving the sink empty.
    pub fn take_captured(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.captured)
    }
}

impl Write for BoundedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let remaining = self.cap.saturating_sub(self.captured.len());
        let take = remaining.min(buf.len());
        if take > 0 {
            self.captured.extend_from_slice(&buf[..take]);
            if let Some(forward) = &self.forward {
                if let Err(err) = forward.lock().write_all(&buf[..take]) {
                    tracing::warn!(error = %err, "output sink write failed");
                }
            }
        }
        if take < buf.len() {
            self.truncated = true;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(forward) = &self.forward {
            if let Err(err) = forward.lock().flush() {
                tracing::warn!(error = %err, "output sink flush failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CollectWriter(Arc<Mutex<Vec<u8>>>);

    impl Write for CollectWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_captures_within_cap() {
        let mut sink = BoundedSink::new(16);
        sink.write_all(b"hello").unwrap();
        assert_eq!(sink.captured(), b"hello");
        assert!(!sink.truncated());
    }

    #[test]
    fn test_drops_bytes_beyond_cap_without_failing() {
        let mut sink = BoundedSink::new(4);
        let written = sink.write(b"abcdefgh").unwrap();
        assert_eq!(written, 8);
        assert_eq!(sink.captured(), b"abcd");
        assert!(sink.truncated());

        // Later writes still report success.
        assert_eq!(sink.write(b"more").unwrap(), 4);
        assert_eq!(sink.captured(), b"abcd");
    }

    #[test]
    fn test_truncation_across_write_boundary() {
        let mut sink = BoundedSink::new(6);
        sink.write_all(b"1234").unwrap();
        assert!(!sink.truncated());
        sink.write_all(b"5678").unwrap();
        assert_eq!(sink.captured(), b"123456");
        assert!(sink.truncated());
    }

    #[test]
    fn test_forwards_capped_prefix_to_writer() {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let writer = shared_writer(CollectWriter(collected.clone()));
        let mut sink = BoundedSink::forwarding(5, writer);

        sink.write_all(b"abcdefgh").unwrap();

        assert_eq!(collected.lock().as_slice(), b"abcde");
        assert_eq!(sink.take_captured(), b"abcde");
    }

    #[test]
    fn test_zero_cap_captures_nothing() {
        let mut sink = BoundedSink::new(0);
        sink.write_all(b"x").unwrap();
        assert!(sink.captured().is_empty());
        assert!(sink.truncated());
    }
}
