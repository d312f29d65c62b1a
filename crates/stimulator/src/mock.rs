//! In-memory transport for tests and bench rigs.
//!
//! `ScriptedTransport` replays canned replies or runs a responder closure
//! against each written frame, which is enough to emulate a well-behaved
//! device, a silent one, or one that corrupts frames on the wire.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::frame::{encode_frame, scan_frame, Scan};
use crate::protocol::CommandSet;
use crate::transport::SerialTransport;

/// One scripted reaction to a written frame.
enum Reply {
    /// Queue these raw bytes for the next reads.
    Raw(Vec<u8>),
    /// Say nothing; the reader times out.
    Silence,
}

enum Mode {
    /// Pop one [`Reply`] per written frame, in order. An exhausted script
    /// behaves like a dead device.
    Script(VecDeque<Reply>),
    /// Compute a reply payload from each written frame payload.
    Auto(Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>),
}

/// A fake serial device. All frames written to it are logged for assertion.
pub struct ScriptedTransport {
    mode: Mode,
    pending: VecDeque<u8>,
    scan_buf: Vec<u8>,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
    read_timeout: Duration,
}

impl ScriptedTransport {
    /// A device that never answers.
    pub fn silent() -> Self {
        Self::with_mode(Mode::Script(VecDeque::new()))
    }

    /// A device driven by an explicit reply script.
    pub fn scripted() -> Self {
        Self::with_mode(Mode::Script(VecDeque::new()))
    }

    /// A device driven by a responder closure receiving each decoded frame
    /// payload and returning the reply payload, if any.
    pub fn auto<F>(responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        Self::with_mode(Mode::Auto(Box::new(responder)))
    }

    fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            pending: VecDeque::new(),
            scan_buf: Vec::new(),
            written: Arc::new(Mutex::new(Vec::new())),
            read_timeout: Duration::from_millis(100),
        }
    }

    /// Queues a well-formed reply frame for the next written frame.
    pub fn push_reply(&mut self, payload: &[u8]) {
        let frame = encode_frame(payload).expect("reply payload fits a frame");
        self.push_raw(frame);
    }

    /// Queues raw bytes verbatim; lets tests put corrupted frames on the wire.
    pub fn push_raw(&mut self, bytes: Vec<u8>) {
        match &mut self.mode {
            Mode::Script(script) => script.push_back(Reply::Raw(bytes)),
            Mode::Auto(_) => panic!("push_raw on an auto-responding transport"),
        }
    }

    /// Queues one tick of silence.
    pub fn push_silence(&mut self) {
        match &mut self.mode {
            Mode::Script(script) => script.push_back(Reply::Silence),
            Mode::Auto(_) => panic!("push_silence on an auto-responding transport"),
        }
    }

    /// Preloads bytes readable before anything is written.
    pub fn preload(&mut self, bytes: &[u8]) {
        self.pending.extend(bytes.iter().copied());
    }

    /// Shared handle onto the log of frame payloads written so far.
    pub fn written_log(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        self.written.clone()
    }
}

impl SerialTransport for ScriptedTransport {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.scan_buf.extend_from_slice(bytes);
        // Decode whole frames out of the written stream and react per frame.
        loop {
            let (_, scan) = scan_frame(&mut self.scan_buf);
            let payload = match scan {
                Scan::Frame(payload) => payload,
                Scan::NeedMore => break,
            };
            self.written.lock().unwrap().push(payload.clone());
            match &mut self.mode {
                Mode::Script(script) => match script.pop_front() {
                    Some(Reply::Raw(reply)) => self.pending.extend(reply),
                    Some(Reply::Silence) | None => {}
                },
                Mode::Auto(responder) => {
                    if let Some(reply) = responder(&payload) {
                        let frame = encode_frame(&reply)
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                        self.pending.extend(frame);
                    }
                }
            }
        }
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            thread::sleep(self.read_timeout);
            return Err(io::Error::new(io::ErrorKind::TimedOut, "scripted timeout"));
        }
        let n = buf.len().min(self.pending.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.pending.pop_front().unwrap();
        }
        Ok(n)
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.read_timeout = timeout;
        Ok(())
    }
}

/// A well-behaved stimulator emulator for the given command table: answers
/// every command with status 0, echoing opcode and sequence, and reports
/// `identity` on identification.
pub fn emulator(set: &CommandSet, identity: &[u8]) -> ScriptedTransport {
    let identify_opcode = set.identify.opcode;
    let identity = identity.to_vec();
    ScriptedTransport::auto(move |payload| {
        let (&opcode, rest) = payload.split_first()?;
        let (&seq, _params) = rest.split_first()?;
        let mut reply = vec![opcode, seq, 0x00];
        if opcode == identify_opcode {
            reply.extend_from_slice(&identity);
        }
        Some(reply)
    })
}
