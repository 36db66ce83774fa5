//! Background readers for the emulator's output channels.
//!
//! ```text
//! [child pipe / console] ──read()──► [reader thread] ──gate──► handler slot
//! ```
//!
//! The reader calls the handler while holding the channel's gate, and
//! teardown closes the gate before joining, so once `close_and_join` starts
//! no handler call can begin on that channel.

use std::io::{self, Read};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use super::Channel;
use super::callbacks::{Slot, TextHandler};

/// Bytes pulled from a channel per read.
pub(crate) const READ_CHUNK: usize = 4096;

/// Open/closed flag serializing handler calls against teardown.
#[derive(Debug)]
pub(crate) struct Gate {
    open: Mutex<bool>,
}

impl Gate {
    fn new() -> Self {
        Self {
            open: Mutex::new(true),
        }
    }

    /// Hand `text` to the handler unless the gate is closed.
    /// Returns `false` once closed.
    fn deliver(&self, slot: &Slot<TextHandler>, text: &str) -> bool {
        let open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if !*open {
            return false;
        }
        slot.with(|handler| handler(text));
        true
    }

    /// Waits for an in-flight handler call to return.
    fn close(&self) {
        *self.open.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }
}

/// Decodes a byte stream as UTF-8 across arbitrary chunk boundaries.
///
/// Sequences split between reads are held back until complete; invalid bytes
/// become U+FFFD.
#[derive(Debug, Default)]
pub(crate) struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // Incomplete trailing sequence: keep it for the next read.
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Whatever is left at end of stream, decoded lossily.
    pub(crate) fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// A running reader thread.
pub(crate) struct ReaderHandle {
    channel: Channel,
    gate: Arc<Gate>,
    finished: mpsc::Receiver<()>,
    thread: JoinHandle<()>,
}

impl ReaderHandle {
    pub(crate) fn spawn<R>(channel: Channel, source: R, slot: Slot<TextHandler>) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let gate = Arc::new(Gate::new());
        let (finished_tx, finished) = mpsc::channel::<()>();

        let thread = {
            let gate = Arc::clone(&gate);
            std::thread::Builder::new()
                .name(format!("qemu-{channel}"))
                .spawn(move || {
                    // Dropped when the thread ends, which is what `finished` observes.
                    let _finished = finished_tx;
                    pump(channel, source, &gate, &slot);
                })?
        };

        Ok(Self {
            channel,
            gate,
            finished,
            thread,
        })
    }

    /// Close the gate and wait up to `grace` for the thread to end.
    ///
    /// A reader still blocked after `grace` (its pipe is held open by some
    /// other process) is detached; the closed gate keeps it from calling the
    /// handler again.
    pub(crate) fn close_and_join(self, grace: Duration) {
        self.gate.close();
        match self.finished.recv_timeout(grace) {
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(channel = %self.channel, "reader still blocked after close; detaching");
            }
            _ => {
                if self.thread.join().is_err() {
                    warn!(channel = %self.channel, "reader thread panicked");
                }
            }
        }
    }
}

fn pump<R: Read>(channel: Channel, mut source: R, gate: &Gate, slot: &Slot<TextHandler>) {
    let mut decoder = Utf8Chunker::default();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match source.read(&mut buf) {
            Ok(0) => {
                debug!(%channel, "end of stream");
                break;
            }
            Ok(n) => {
                let text = decoder.push(&buf[..n]);
                if !text.is_empty() && !gate.deliver(slot, &text) {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(%channel, error = %e, "read failed; treating as end of stream");
                break;
            }
        }
    }

    let rest = decoder.finish();
    if !rest.is_empty() {
        gate.deliver(slot, &rest);
    }
}
