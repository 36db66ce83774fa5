//! Parent-side ends of the emulator's I/O channels.
//!
//! stdout and stderr are anonymous pipes read by one thread each; the console
//! is a duplex stream with its own reader plus a writer half. stdin and the
//! console writer sit in [`InputSlot`]s owned by the facade, so writes never
//! wait on a lifecycle operation.

pub(crate) mod callbacks;
mod reader;

use std::fmt;
use std::io::{self, Write};
use std::process::{Child, ChildStdin};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};

use crate::platform::{Console, ConsoleStream};
use callbacks::CallbackRegistry;
use reader::ReaderHandle;

/// How long teardown waits for each reader before detaching it.
pub(crate) const READER_GRACE: Duration = Duration::from_millis(500);

/// The four logical channels between launcher and emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Stdout,
    Stderr,
    Stdin,
    Console,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Channel::Stdout => "stdout",
            Channel::Stderr => "stderr",
            Channel::Stdin => "stdin",
            Channel::Console => "console",
        })
    }
}

/// A writable endpoint that may be absent (before start, after exit).
pub(crate) struct InputSlot<W> {
    channel: Channel,
    inner: Arc<Mutex<Option<W>>>,
}

impl<W> Clone for InputSlot<W> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: Write + Send> InputSlot<W> {
    pub(crate) fn new(channel: Channel) -> Self {
        Self {
            channel,
            inner: Arc::new(Mutex::new(None)),
        }
    }

    fn install(&self, writer: W) {
        *self.lock() = Some(writer);
    }

    /// Write and flush `bytes`. `false` if the endpoint is closed or the write
    /// failed; a failed endpoint is closed.
    pub(crate) fn write(&self, bytes: &[u8]) -> bool {
        let mut guard = self.lock();
        let Some(writer) = guard.as_mut() else {
            return false;
        };
        match writer.write_all(bytes).and_then(|()| writer.flush()) {
            Ok(()) => true,
            Err(e) => {
                debug!(channel = %self.channel, error = %e, "write failed; closing endpoint");
                *guard = None;
                false
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    /// Drop the writer, closing the parent's end.
    pub(crate) fn close(&self) {
        self.lock().take();
    }

    fn lock(&self) -> MutexGuard<'_, Option<W>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Readers and the console handle of one running emulator.
pub(crate) struct IoBridge {
    readers: Vec<ReaderHandle>,
    console: Console,
    stdin: InputSlot<ChildStdin>,
    console_in: InputSlot<Console>,
}

impl IoBridge {
    /// Take the child's standard pipes and the accepted console, start the
    /// readers, then open the two writable endpoints.
    ///
    /// On error every endpoint taken so far is closed again.
    pub(crate) fn attach(
        child: &mut Child,
        console: Console,
        callbacks: &CallbackRegistry,
        stdin: &InputSlot<ChildStdin>,
        console_in: &InputSlot<Console>,
    ) -> io::Result<Self> {
        let mut bridge = Self {
            readers: Vec::with_capacity(3),
            console,
            stdin: stdin.clone(),
            console_in: console_in.clone(),
        };

        if let Err(e) = bridge.start_readers(child, callbacks) {
            bridge.close(READER_GRACE);
            return Err(e);
        }

        let writer = match bridge.console.try_clone_stream() {
            Ok(writer) => writer,
            Err(e) => {
                bridge.close(READER_GRACE);
                return Err(e);
            }
        };
        let Some(child_stdin) = child.stdin.take() else {
            bridge.close(READER_GRACE);
            return Err(missing_pipe(Channel::Stdin));
        };
        stdin.install(child_stdin);
        console_in.install(writer);

        debug!(readers = bridge.readers.len(), "I/O bridge attached");
        Ok(bridge)
    }

    fn start_readers(&mut self, child: &mut Child, callbacks: &CallbackRegistry) -> io::Result<()> {
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe(Channel::Stdout))?;
        self.readers.push(ReaderHandle::spawn(
            Channel::Stdout,
            stdout,
            callbacks.stdout.clone(),
        )?);

        let stderr = child.stderr.take().ok_or_else(|| missing_pipe(Channel::Stderr))?;
        self.readers.push(ReaderHandle::spawn(
            Channel::Stderr,
            stderr,
            callbacks.stderr.clone(),
        )?);

        let console = self.console.try_clone_stream()?;
        self.readers.push(ReaderHandle::spawn(
            Channel::Console,
            console,
            callbacks.console.clone(),
        )?);
        Ok(())
    }

    /// Close writers, shut the console down, then close gates and join
    /// readers, waiting at most `grace` for each.
    pub(crate) fn close(self, grace: Duration) {
        self.stdin.close();
        self.console_in.close();
        if let Err(e) = self.console.shutdown_stream() {
            warn!(error = %e, "failed to shut down console stream");
        }
        for reader in self.readers {
            reader.close_and_join(grace);
        }
        debug!("I/O bridge closed");
    }
}

fn missing_pipe(channel: Channel) -> io::Error {
    io::Error::other(format!("child {channel} was not piped"))
}
