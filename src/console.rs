// ─────────────────────────────────────────────────────────────────────────────
//  ble-dfu :: console  —  user-visible progress output
//
//  The scan task and the orchestrator both write here, so the sink is shared
//  behind a mutex. Tests swap stdout for an in-memory buffer.
// ─────────────────────────────────────────────────────────────────────────────

use std::fmt::Display;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone)]
pub struct Console {
    sink: Arc<Mutex<Sink>>,
}

struct Sink {
    out:       Box<dyn Write + Send>,
    /// A row of progress dots has been started and not yet ended.
    dots_open: bool,
}

impl Console {
    pub fn stdout() -> Self {
        Self::from_writer(io::stdout())
    }

    pub fn from_writer<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Sink { out: Box::new(writer), dots_open: false })),
        }
    }

    /// A console that records everything it prints.
    pub fn capture() -> (Self, Captured) {
        let buf = Captured::default();
        (Self::from_writer(buf.clone()), buf)
    }

    /// Print one line. An open row of progress dots is ended first.
    pub fn line(&self, text: impl Display) {
        let mut sink = self.lock();
        let dots_open = std::mem::replace(&mut sink.dots_open, false);
        let out = &mut sink.out;
        let result = (if dots_open { writeln!(out) } else { Ok(()) })
            .and_then(|_| writeln!(out, "{}", text))
            .and_then(|_| out.flush());
        if let Err(e) = result {
            log::debug!("console write failed: {}", e);
        }
    }

    /// Lightweight progress marker: a single dot, no newline.
    pub fn tick(&self) {
        let mut sink = self.lock();
        sink.dots_open = true;
        let out = &mut sink.out;
        if let Err(e) = write!(out, ".").and_then(|_| out.flush()) {
            log::debug!("console write failed: {}", e);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Sink> {
        self.sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// In-memory output buffer handed out by [`Console::capture`].
#[derive(Clone, Default)]
pub struct Captured {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl Captured {
    pub fn text(&self) -> String {
        let buf = self.buf.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        String::from_utf8_lossy(&buf).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.text().lines().map(str::to_owned).collect()
    }
}

impl Write for Captured {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut buf = self.buf.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
