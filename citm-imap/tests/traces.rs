//! Trace-driven round trips: parse each line of a captured session,
//! re-emit it, and parse the emission again.  The second parse must
//! yield the same AST (the wire bytes may differ where the writer
//! re-classifies strings or canonicalizes INBOX).

use citm_imap::parse::command::command;
use citm_imap::parse::response::response;
use citm_imap::write::{command_to_vec, response_to_vec, write_command};
use citm_imap::Extensions;

enum Who {
    Client,
    Server,
}

fn split_trace(trace: &str) -> Vec<(Who, Vec<u8>)> {
    trace
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            let (who, rest) = match l.split_at(3) {
                ("C: ", rest) => (Who::Client, rest),
                ("S: ", rest) => (Who::Server, rest),
                _ => panic!("trace lines must start with C: or S: ({l:?})"),
            };
            let mut bytes = rest.as_bytes().to_vec();
            bytes.extend_from_slice(b"\r\n");
            (who, bytes)
        })
        .collect()
}

fn roundtrip_trace(trace: &str) {
    let exts = Extensions::all_available();
    for (who, line) in split_trace(trace) {
        match who {
            Who::Client => {
                let (rem, parsed) =
                    command(&line).unwrap_or_else(|e| panic!("{}: {e:?}", String::from_utf8_lossy(&line)));
                assert!(rem.is_empty());
                let emitted = command_to_vec(&parsed, &exts).unwrap();
                let (rem, parsed2) = command(&emitted)
                    .unwrap_or_else(|e| panic!("{}: {e:?}", String::from_utf8_lossy(&emitted)));
                assert!(rem.is_empty());
                assert_eq!(parsed, parsed2, "line: {}", String::from_utf8_lossy(&line));
            }
            Who::Server => {
                let (rem, parsed) =
                    response(&line).unwrap_or_else(|e| panic!("{}: {e:?}", String::from_utf8_lossy(&line)));
                assert!(rem.is_empty());
                let emitted = response_to_vec(&parsed, &exts).unwrap();
                let (rem, parsed2) = response(&emitted)
                    .unwrap_or_else(|e| panic!("{}: {e:?}", String::from_utf8_lossy(&emitted)));
                assert!(rem.is_empty());
                assert_eq!(parsed, parsed2, "line: {}", String::from_utf8_lossy(&line));
            }
        }
    }
}

#[test]
fn login_and_list_session() {
    roundtrip_trace(
        "S: * OK [CAPABILITY IMAP4rev1 UIDPLUS ENABLE CONDSTORE QRESYNC UNSELECT IDLE LITERAL+] ready\n\
         C: a1 LOGIN alice \"hunter two\"\n\
         S: a1 OK LOGIN completed\n\
         C: a2 LIST \"\" \"*\"\n\
         S: * LIST (\\HasNoChildren) \"/\" \"INBOX\"\n\
         S: a2 OK LIST completed\n",
    );
}

#[test]
fn condstore_select_session() {
    roundtrip_trace(
        "C: a3 ENABLE CONDSTORE\n\
         S: * ENABLED CONDSTORE\n\
         S: a3 OK ENABLE completed\n\
         C: a4 SELECT INBOX\n\
         S: * FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)\n\
         S: * 3 EXISTS\n\
         S: * 0 RECENT\n\
         S: * OK [UIDVALIDITY 123] UIDs valid\n\
         S: * OK [UIDNEXT 44] next uid\n\
         S: * OK [HIGHESTMODSEQ 7] tracked\n\
         S: a4 OK [READ-WRITE] SELECT completed\n",
    );
}

#[test]
fn qresync_fetch_session() {
    roundtrip_trace(
        "C: a5 SELECT INBOX (QRESYNC (123 7 1:10))\n\
         S: * OK [CLOSED] previous mailbox closed\n\
         S: * VANISHED (EARLIER) 3,5\n\
         C: a6 UID FETCH 1:* (FLAGS) (CHANGEDSINCE 7 VANISHED)\n\
         S: * 2 FETCH (UID 9 FLAGS (\\Seen) MODSEQ (12))\n\
         S: a6 OK UID FETCH completed\n",
    );
}

#[test]
fn store_expunge_session() {
    roundtrip_trace(
        "C: a7 STORE 1:3 +FLAGS.SILENT (\\Deleted)\n\
         S: a7 OK [MODIFIED 2] conditional store failed for some\n\
         C: a8 UID EXPUNGE 4:7\n\
         S: * VANISHED 4,6\n\
         S: a8 OK expunged\n\
         C: a9 UID COPY 2:4 Archive\n\
         S: a9 OK [COPYUID 38505 2:4 3956:3958] copied\n",
    );
}

#[test]
fn xkey_session() {
    roundtrip_trace(
        "C: k1 XKEYSYNC aabbccdd 00112233\n\
         S: * XKEYSYNC DELETED aabbccdd\n\
         S: * XKEYSYNC OK\n\
         S: k1 OK XKEYSYNC completed\n\
         C: k2 XKEYADD \"fake pem\"\n\
         S: k2 OK key added\n",
    );
}

#[test]
fn idle_session() {
    roundtrip_trace(
        "C: a9 IDLE\n\
         S: + idling\n\
         S: * 4 EXISTS\n\
         S: * 1 RECENT\n\
         S: a9 OK IDLE terminated\n",
    );
}

/// Byte budgets from 2 up produce identical output to a one-shot
/// write, for a command with a literal in the middle.
#[test]
fn restartable_write_budgets() {
    let exts = Extensions::all_available();
    let line = b"a1 APPEND saved (\\Seen) {26+}\r\nSubject: hi\r\n\r\nhello there\r\n";
    let (_rem, cmd) = command(line).unwrap();
    let whole = command_to_vec(&cmd, &exts).unwrap();
    for budget in 2..40 {
        let mut out = Vec::new();
        let mut buf = vec![0u8; budget];
        let mut skip = 0;
        loop {
            let st = write_command(&cmd, &exts, &mut buf, skip).unwrap();
            out.extend_from_slice(&buf[..st.written]);
            skip = st.skip;
            if st.want == 0 {
                break;
            }
        }
        assert_eq!(out, whole, "budget={budget}");
    }
}
