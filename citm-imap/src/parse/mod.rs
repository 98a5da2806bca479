//! Streaming decoders.
//!
//! The nom rules live in [`core`], [`command`] and [`response`]; the
//! decoders here own the partial-input buffer.  Feed bytes in as they
//! arrive; complete messages come out.  A literal header inside the
//! stream steals exactly its declared byte count before normal scanning
//! resumes (the streaming `take(n)` inside the literal rule).

pub mod command;
pub mod core;
pub mod response;

use crate::error::ImapError;
use crate::extensions::Extensions;
use crate::types::command::Command;
use crate::types::response::Response;

/// One event from the server-side (command) decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmdEvent {
    Cmd(Command),
    /// The bare DONE terminating IDLE or XKEYSYNC.
    Done,
    /// A line we could not parse; the connection answers with an
    /// untagged BAD and keeps going.
    Bad { text: String },
}

/// Server-side decoder: syntax errors are recoverable.
#[derive(Debug, Default)]
pub struct CommandDecoder {
    buf: Vec<u8>,
    /// Waiting for IDLE/XKEYSYNC DONE instead of a full command.
    awaiting_done: bool,
    /// A bad line is being discarded up to its CRLF.
    skipping: bool,
}

impl CommandDecoder {
    pub fn new() -> CommandDecoder {
        CommandDecoder::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Switch between full-command parsing and DONE-only parsing.
    pub fn set_awaiting_done(&mut self, on: bool) {
        self.awaiting_done = on;
    }

    /// If the buffer ends with a complete synchronizing literal header,
    /// its declared length: the caller owes the client a `+` before the
    /// rest of the command will arrive.
    pub fn pending_sync_literal(&self) -> Option<u32> {
        let b = &self.buf;
        if b.len() < 5 || &b[b.len() - 2..] != b"\r\n" {
            return None;
        }
        let line = &b[..b.len() - 2];
        if line.last() != Some(&b'}') {
            return None;
        }
        let open = line.iter().rposition(|&c| c == b'{')?;
        let mut digits = &line[open + 1..line.len() - 1];
        if digits.last() == Some(&b'+') {
            // LITERAL+: no continuation owed
            return None;
        }
        if digits.is_empty() {
            return None;
        }
        let mut n: u32 = 0;
        while let Some((&d, rest)) = digits.split_first() {
            if !d.is_ascii_digit() {
                return None;
            }
            n = n.checked_mul(10)?.checked_add((d - b'0') as u32)?;
            digits = rest;
        }
        Some(n)
    }

    /// Pull the next event, or None if more input is needed.
    pub fn next(&mut self, exts: &Extensions) -> Option<CmdEvent> {
        loop {
            if self.skipping {
                match find_crlf(&self.buf) {
                    Some(end) => {
                        self.buf.drain(..end + 2);
                        self.skipping = false;
                    }
                    None => {
                        self.buf.clear();
                        return None;
                    }
                }
            }
            if self.buf.is_empty() {
                return None;
            }

            if self.awaiting_done {
                return match command::done_line(&self.buf) {
                    Ok((rest, ())) => {
                        let consumed = self.buf.len() - rest.len();
                        self.buf.drain(..consumed);
                        Some(CmdEvent::Done)
                    }
                    Err(nom::Err::Incomplete(_)) => None,
                    Err(_) => {
                        self.skipping = true;
                        Some(CmdEvent::Bad {
                            text: "expected DONE".into(),
                        })
                    }
                };
            }

            match command::command(&self.buf) {
                Ok((rest, cmd)) => {
                    let consumed = self.buf.len() - rest.len();
                    self.buf.drain(..consumed);
                    // gating and cross-field invariants
                    let gate = cmd
                        .required_exts()
                        .into_iter()
                        .try_for_each(|e| exts.assert_available(e))
                        .and_then(|_| cmd.validate());
                    return Some(match gate {
                        Ok(()) => CmdEvent::Cmd(cmd),
                        Err(e) => CmdEvent::Bad { text: e.to_string() },
                    });
                }
                Err(nom::Err::Incomplete(_)) => return None,
                Err(_) => {
                    self.skipping = true;
                    return Some(CmdEvent::Bad {
                        text: "failure parsing command".into(),
                    });
                }
            }
        }
    }
}

/// Client-side decoder: any syntax error is fatal to the session.
#[derive(Debug, Default)]
pub struct ResponseDecoder {
    buf: Vec<u8>,
}

impl ResponseDecoder {
    pub fn new() -> ResponseDecoder {
        ResponseDecoder::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pull the next response; `Ok(None)` means more input is needed.
    pub fn next(&mut self, exts: &Extensions) -> Result<Option<Response>, ImapError> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        match response::response(&self.buf) {
            Ok((rest, resp)) => {
                let consumed = self.buf.len() - rest.len();
                self.buf.drain(..consumed);
                for ext in resp.required_exts() {
                    exts.assert_available(ext)?;
                }
                Ok(Some(resp))
            }
            Err(nom::Err::Incomplete(_)) => Ok(None),
            Err(_) => Err(ImapError::syntax("response", &self.buf)),
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::{Ext, ExtState, Extensions};
    use crate::types::command::CommandBody;
    use crate::types::response::{ResponseData, Response};

    #[test]
    fn commands_across_chunk_boundaries() {
        // property: any partition of the stream parses identically
        let stream = b"a1 NOOP\r\na2 LOGIN alice {2}\r\npw\r\na3 CLOSE\r\n";
        let exts = Extensions::all_available();
        for split in 0..stream.len() {
            let mut dec = CommandDecoder::new();
            let mut got = Vec::new();
            dec.feed(&stream[..split]);
            while let Some(ev) = dec.next(&exts) {
                got.push(ev);
            }
            dec.feed(&stream[split..]);
            while let Some(ev) = dec.next(&exts) {
                got.push(ev);
            }
            assert_eq!(got.len(), 3, "split={split}");
            assert!(matches!(got[0], CmdEvent::Cmd(ref c) if c.body == CommandBody::Noop));
            assert!(matches!(got[2], CmdEvent::Cmd(ref c) if c.body == CommandBody::Close));
        }
    }

    #[test]
    fn empty_buffer_needs_more() {
        let mut dec = CommandDecoder::new();
        assert_eq!(dec.next(&Extensions::all_available()), None);
    }

    #[test]
    fn bad_line_recovers() {
        let mut dec = CommandDecoder::new();
        let exts = Extensions::all_available();
        dec.feed(b"this is (not valid\r\na2 NOOP\r\n");
        assert!(matches!(dec.next(&exts), Some(CmdEvent::Bad { .. })));
        assert!(matches!(dec.next(&exts), Some(CmdEvent::Cmd(_))));
        assert_eq!(dec.next(&exts), None);
    }

    #[test]
    fn gated_command_is_bad_when_disabled() {
        let mut dec = CommandDecoder::new();
        let mut exts = Extensions::all_available();
        exts.set(Ext::Idle, ExtState::Disabled);
        dec.feed(b"a1 IDLE\r\n");
        assert!(matches!(dec.next(&exts), Some(CmdEvent::Bad { .. })));
    }

    #[test]
    fn done_mode() {
        let mut dec = CommandDecoder::new();
        let exts = Extensions::all_available();
        dec.set_awaiting_done(true);
        dec.feed(b"DONE\r\na2 NOOP\r\n");
        assert_eq!(dec.next(&exts), Some(CmdEvent::Done));
        dec.set_awaiting_done(false);
        assert!(matches!(dec.next(&exts), Some(CmdEvent::Cmd(_))));
    }

    #[test]
    fn sync_literal_detection() {
        let mut dec = CommandDecoder::new();
        dec.feed(b"a1 LOGIN {5}\r\n");
        assert_eq!(dec.pending_sync_literal(), Some(5));
        dec.feed(b"alice {4}\r\n");
        assert_eq!(dec.pending_sync_literal(), Some(4));
        let mut dec = CommandDecoder::new();
        dec.feed(b"a1 LOGIN {5+}\r\n");
        assert_eq!(dec.pending_sync_literal(), None);
    }

    #[test]
    fn responses_across_chunk_boundaries() {
        let stream =
            b"* 3 EXISTS\r\n* VANISHED (EARLIER) 3,5\r\na1 OK [READ-WRITE] SELECT completed\r\n";
        let exts = Extensions::all_available();
        for split in 0..stream.len() {
            let mut dec = ResponseDecoder::new();
            let mut got = Vec::new();
            dec.feed(&stream[..split]);
            while let Some(r) = dec.next(&exts).unwrap() {
                got.push(r);
            }
            dec.feed(&stream[split..]);
            while let Some(r) = dec.next(&exts).unwrap() {
                got.push(r);
            }
            assert_eq!(got.len(), 3, "split={split}");
            assert_eq!(got[0], Response::Data(ResponseData::Exists(3)));
        }
    }

    #[test]
    fn response_syntax_error_is_fatal() {
        let mut dec = ResponseDecoder::new();
        dec.feed(b"!!! garbage\r\n");
        assert!(dec.next(&Extensions::all_available()).is_err());
    }

    #[test]
    fn gated_response_error_when_disabled() {
        let mut dec = ResponseDecoder::new();
        let mut exts = Extensions::all_available();
        exts.set(Ext::Qresync, ExtState::Disabled);
        dec.feed(b"* VANISHED (EARLIER) 3,5\r\n");
        assert!(dec.next(&exts).is_err());
    }
}
