//! Turns a spawned process into an ordered event stream for one subscriber.
//!
//! Chunks of each output stream arrive in order and are followed by exactly
//! one `Closed` event. If the subscriber drops the relay first, the process
//! is killed.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tracing::{debug, info};

use crate::runtime::{OutputStream, ProcessEvent, ProcessHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Data { stream: OutputStream, text: String },
    Closed { exit_code: Option<i32> },
}

/// Decodes UTF-8 across chunk boundaries, holding back an incomplete
/// trailing sequence until the next chunk.
#[derive(Debug, Default)]
struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    fn push(&mut self, data: &[u8]) -> String {
        self.pending.extend_from_slice(data);
        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    return text;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return text;
                        }
                    }
                }
            }
        }
    }

    fn flush(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayState {
    Open,
    Closed,
}

pub struct StreamRelay {
    session_id: String,
    process: ProcessHandle,
    stdout: Utf8Carry,
    stderr: Utf8Carry,
    queued: VecDeque<StreamEvent>,
    state: RelayState,
    delivered: usize,
}

impl StreamRelay {
    pub fn new(session_id: impl Into<String>, process: ProcessHandle) -> Self {
        Self {
            session_id: session_id.into(),
            process,
            stdout: Utf8Carry::default(),
            stderr: Utf8Carry::default(),
            queued: VecDeque::new(),
            state: RelayState::Open,
            delivered: 0,
        }
    }

    fn carry(&mut self, stream: OutputStream) -> &mut Utf8Carry {
        match stream {
            OutputStream::Stdout => &mut self.stdout,
            OutputStream::Stderr => &mut self.stderr,
        }
    }

    /// Queue leftover bytes and the terminal event.
    fn close(&mut self, exit_code: Option<i32>) {
        for stream in [OutputStream::Stdout, OutputStream::Stderr] {
            let text = self.carry(stream).flush();
            if !text.is_empty() {
                self.queued.push_back(StreamEvent::Data { stream, text });
            }
        }
        self.queued.push_back(StreamEvent::Closed { exit_code });
        self.state = RelayState::Closed;
        debug!(session_id = %self.session_id, exit_code = ?exit_code, chunks = self.delivered, "Stream closed");
    }
}

impl Stream for StreamRelay {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        let this = &mut *self;
        loop {
            if let Some(event) = this.queued.pop_front() {
                if matches!(event, StreamEvent::Data { .. }) {
                    this.delivered += 1;
                }
                return Poll::Ready(Some(event));
            }
            if this.state == RelayState::Closed {
                return Poll::Ready(None);
            }
            match this.process.poll_event(cx) {
                Poll::Ready(Some(ProcessEvent::Output { stream, data })) => {
                    let text = this.carry(stream).push(&data);
                    if !text.is_empty() {
                        this.queued.push_back(StreamEvent::Data { stream, text });
                    }
                }
                Poll::Ready(Some(ProcessEvent::Exited { code })) => this.close(code),
                Poll::Ready(None) => this.close(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for StreamRelay {
    fn drop(&mut self) {
        if self.state == RelayState::Open {
            info!(session_id = %self.session_id, chunks = self.delivered, "Subscriber disconnected, killing process");
            self.process.kill();
        }
    }
}
