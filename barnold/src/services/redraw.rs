use std::io::{ErrorKind, Read, Write};

const WAKE: u8 = 1;

/// Worker-side half of the redraw notifier: one byte per wake, riding the
/// worker's stdout pipe.
pub struct RedrawSignal<W: Write> {
    sink: W,
}

impl<W: Write> RedrawSignal<W> {
    pub fn new(sink: W) -> Self {
        RedrawSignal { sink }
    }

    /// Raise the event. Wakes persist until the waiter consumes them, so a
    /// burst of tiles can never lose its wake.
    pub fn set(&mut self) -> std::io::Result<()> {
        self.sink.write_all(&[WAKE])?;
        self.sink.flush()
    }
}

/// Controller-side half. `wait()` blocks until at least one wake is
/// pending and consumes everything queued in one read, which both gives
/// consumed-once semantics per cycle and coalesces a burst of tile writes
/// into a single redraw.
pub struct RedrawWaiter<R: Read> {
    source: R,
}

impl<R: Read> RedrawWaiter<R> {
    pub fn new(source: R) -> Self {
        RedrawWaiter { source }
    }

    /// Returns `true` on a wake, `false` once the worker side is gone
    /// (pipe EOF) so the waiter thread can observe shutdown and exit.
    pub fn wait(&mut self) -> std::io::Result<bool> {
        let mut pending = [0u8; 64];
        loop {
            match self.source.read(&mut pending) {
                Ok(0) => return Ok(false),
                Ok(_) => return Ok(true),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
