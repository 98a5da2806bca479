//! IMAP connections: the codec layered over a byte stream.
//!
//! [`ImapServerConn`] faces a downstream client (we parse commands and
//! write responses; syntax errors demote to untagged BAD).
//! [`ImapClientConn`] faces the upstream server (we write commands and
//! parse responses; syntax errors are fatal).
//!
//! The `read_more` methods only read — they are safe inside select!
//! arms — and `next_*` drains whatever the buffer already holds, so
//! the canonical loop is: drain, then await more bytes.

use citm_imap::parse::{CmdEvent, CommandDecoder, ResponseDecoder};
use citm_imap::types::core::TagGen;
use citm_imap::types::response::{Response, ResponseStatus};
use citm_imap::write::{write_command, write_response};
use citm_imap::{Command, Extensions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtoError;

/// Any duplex byte stream we can run IMAP over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

const READ_CHUNK: usize = 8 * 1024;
/// Write budget per restartable-writer call.
const WRITE_CHUNK: usize = 4 * 1024;

async fn write_all_restartable<F>(
    stream: &mut BoxedStream,
    mut emit: F,
) -> Result<(), ProtoError>
where
    F: FnMut(&mut [u8], usize) -> Result<citm_imap::write::WriteStatus, ProtoError>,
{
    let mut buf = [0u8; WRITE_CHUNK];
    let mut skip = 0;
    loop {
        let st = emit(&mut buf, skip)?;
        stream.write_all(&buf[..st.written]).await?;
        skip = st.skip;
        if st.want == 0 {
            stream.flush().await?;
            return Ok(());
        }
    }
}

// ---- downstream (we are the server) ----

pub struct ImapServerConn {
    stream: BoxedStream,
    dec: CommandDecoder,
    pub exts: Extensions,
    eof: bool,
}

impl ImapServerConn {
    pub fn new(stream: BoxedStream, exts: Extensions) -> ImapServerConn {
        ImapServerConn { stream, dec: CommandDecoder::new(), exts, eof: false }
    }

    /// Unwrap the stream (for a STARTTLS upgrade).
    pub fn into_stream(self) -> BoxedStream {
        self.stream
    }

    /// Read once; returns false on EOF.  Pure read: select!-safe.
    pub async fn read_more(&mut self) -> Result<bool, ProtoError> {
        let mut buf = [0u8; READ_CHUNK];
        let n = self.stream.read(&mut buf).await?;
        if n == 0 {
            self.eof = true;
            return Ok(false);
        }
        self.dec.feed(&buf[..n]);
        Ok(true)
    }

    pub fn eof(&self) -> bool {
        self.eof
    }

    /// Drain one already-buffered event, if any.
    pub fn next_event(&mut self) -> Option<CmdEvent> {
        self.dec.next(&self.exts)
    }

    /// A synchronizing literal header is waiting on our `+`.
    pub fn pending_sync_literal(&self) -> Option<u32> {
        self.dec.pending_sync_literal()
    }

    /// Switch the parser to IDLE/XKEYSYNC DONE mode.
    pub fn set_awaiting_done(&mut self, on: bool) {
        self.dec.set_awaiting_done(on);
    }

    pub async fn write(&mut self, resp: &Response) -> Result<(), ProtoError> {
        let exts = self.exts;
        write_all_restartable(&mut self.stream, |buf, skip| {
            write_response(resp, &exts, buf, skip).map_err(ProtoError::from)
        })
        .await
    }

    pub async fn write_all(&mut self, resps: &[Response]) -> Result<(), ProtoError> {
        for resp in resps {
            self.write(resp).await?;
        }
        Ok(())
    }

    /// The recovery path for a line that would not parse.
    pub async fn write_parse_bad(&mut self, text: &str) -> Result<(), ProtoError> {
        self.write(&Response::Status(ResponseStatus::bad(None, None, text)))
            .await
    }
}

// ---- upstream (we are the client) ----

pub struct ImapClientConn {
    stream: BoxedStream,
    dec: ResponseDecoder,
    pub exts: Extensions,
    pub tags: TagGen,
    eof: bool,
}

impl ImapClientConn {
    pub fn new(stream: BoxedStream, exts: Extensions) -> ImapClientConn {
        ImapClientConn {
            stream,
            dec: ResponseDecoder::new(),
            exts,
            tags: TagGen::new("citm"),
            eof: false,
        }
    }

    /// Read once; returns false on EOF.  Pure read: select!-safe.
    pub async fn read_more(&mut self) -> Result<bool, ProtoError> {
        let mut buf = [0u8; READ_CHUNK];
        let n = self.stream.read(&mut buf).await?;
        if n == 0 {
            self.eof = true;
            return Ok(false);
        }
        self.dec.feed(&buf[..n]);
        Ok(true)
    }

    pub fn eof(&self) -> bool {
        self.eof
    }

    /// Drain one already-buffered response, if any.  Syntax errors
    /// from a server are fatal.
    pub fn next_response(&mut self) -> Result<Option<Response>, ProtoError> {
        self.dec.next(&self.exts).map_err(ProtoError::from)
    }

    /// Read until one full response is available.
    pub async fn read_response(&mut self) -> Result<Response, ProtoError> {
        loop {
            if let Some(resp) = self.next_response()? {
                return Ok(resp);
            }
            if !self.read_more().await? {
                return Err(ProtoError::ConnClosed);
            }
        }
    }

    pub async fn write(&mut self, cmd: &Command) -> Result<(), ProtoError> {
        let exts = self.exts;
        write_all_restartable(&mut self.stream, |buf, skip| {
            write_command(cmd, &exts, buf, skip).map_err(ProtoError::from)
        })
        .await
    }

    pub async fn write_all_cmds(&mut self, cmds: &[Command]) -> Result<(), ProtoError> {
        for cmd in cmds {
            self.write(cmd).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use citm_imap::types::command::CommandBody;
    use citm_imap::types::core::Tag;
    use citm_imap::types::response::{ResponseData, StatusKind};
    use tokio::io::duplex;

    #[tokio::test]
    async fn server_conn_parses_and_responds() {
        let (ours, theirs) = duplex(64 * 1024);
        let mut conn = ImapServerConn::new(Box::new(ours), Extensions::all_available());
        let (mut client_rd, mut client_wr) = tokio::io::split(theirs);

        client_wr.write_all(b"a1 NOOP\r\n").await.unwrap();
        assert!(conn.read_more().await.unwrap());
        let ev = conn.next_event().unwrap();
        match ev {
            CmdEvent::Cmd(cmd) => assert_eq!(cmd.body, CommandBody::Noop),
            other => panic!("{other:?}"),
        }

        conn.write(&Response::Status(ResponseStatus::ok(
            Some(Tag::new("a1").unwrap()),
            None,
            "NOOP completed",
        )))
        .await
        .unwrap();
        let mut buf = [0u8; 64];
        let n = client_rd.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"a1 OK NOOP completed\r\n");
    }

    #[tokio::test]
    async fn client_conn_round_trip() {
        let (ours, theirs) = duplex(64 * 1024);
        let mut conn = ImapClientConn::new(Box::new(ours), Extensions::all_available());
        let (mut server_rd, mut server_wr) = tokio::io::split(theirs);

        let tag = conn.tags.next();
        conn.write(&Command::new(tag, CommandBody::Capability))
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        let n = server_rd.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"citm1 CAPABILITY\r\n");

        server_wr
            .write_all(b"* CAPABILITY IMAP4rev1 XKEY\r\n")
            .await
            .unwrap();
        let resp = conn.read_response().await.unwrap();
        assert!(matches!(resp, Response::Data(ResponseData::Capability(_))));
    }

    #[tokio::test]
    async fn large_message_streams_through_small_chunks() {
        let (ours, theirs) = duplex(1 << 20);
        let mut conn = ImapClientConn::new(Box::new(ours), Extensions::all_available());
        let body = vec![b'x'; 3 * WRITE_CHUNK + 17];
        let tag = conn.tags.next();
        conn.write(&Command::new(
            tag,
            CommandBody::Append {
                mailbox: "INBOX".into(),
                flags: Default::default(),
                time: None,
                message: body.clone(),
            },
        ))
        .await
        .unwrap();
        drop(conn);

        let mut got = Vec::new();
        let mut rd = theirs;
        rd.read_to_end(&mut got).await.unwrap();
        let expected_start = format!("citm1 APPEND INBOX {{{}+}}\r\n", body.len());
        assert!(got.starts_with(expected_start.as_bytes()));
        assert!(got.ends_with(b"\r\n"));
        assert_eq!(got.len(), expected_start.len() + body.len() + 2);
    }

    #[tokio::test]
    async fn bad_command_yields_bad_event_then_recovers() {
        let (ours, theirs) = duplex(64 * 1024);
        let mut conn = ImapServerConn::new(Box::new(ours), Extensions::all_available());
        let (_client_rd, mut client_wr) = tokio::io::split(theirs);
        client_wr
            .write_all(b"garbage ( line\r\na2 CHECK\r\n")
            .await
            .unwrap();
        conn.read_more().await.unwrap();
        assert!(matches!(conn.next_event(), Some(CmdEvent::Bad { .. })));
        assert!(matches!(
            conn.next_event(),
            Some(CmdEvent::Cmd(Command { body: CommandBody::Check, .. }))
        ));
    }

    #[tokio::test]
    async fn sync_literal_prompts_continuation() {
        let (ours, theirs) = duplex(64 * 1024);
        let mut conn = ImapServerConn::new(Box::new(ours), Extensions::all_available());
        let (mut client_rd, mut client_wr) = tokio::io::split(theirs);

        client_wr.write_all(b"a1 LOGIN {5}\r\n").await.unwrap();
        conn.read_more().await.unwrap();
        assert_eq!(conn.next_event(), None);
        assert_eq!(conn.pending_sync_literal(), Some(5));
        conn.write(&Response::Plus { code: None, text: "OK".into() })
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        let n = client_rd.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"+ OK\r\n");

        client_wr.write_all(b"alice {2}\r\npw\r\n").await.unwrap();
        conn.read_more().await.unwrap();
        assert!(matches!(
            conn.next_event(),
            Some(CmdEvent::Cmd(Command { body: CommandBody::Login { .. }, .. }))
        ));
    }

    #[tokio::test]
    async fn upstream_garbage_is_fatal() {
        let (ours, theirs) = duplex(64 * 1024);
        let mut conn = ImapClientConn::new(Box::new(ours), Extensions::all_available());
        let (_rd, mut wr) = tokio::io::split(theirs);
        wr.write_all(b"!!! nonsense\r\n").await.unwrap();
        conn.read_more().await.unwrap();
        assert!(conn.next_response().is_err());
    }

    #[test]
    fn status_kind_sanity() {
        // BYE is untagged in our model
        let bye = ResponseStatus::bye("shutting down");
        assert_eq!(bye.kind, StatusKind::Bye);
        assert!(bye.tag.is_none());
    }
}
