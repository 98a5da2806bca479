//! The pre-login connection pair.
//!
//! Sits between a fresh downstream client and its upstream connection:
//! greeting, capabilities, optional STARTTLS downstream, then LOGIN
//! proxying.  A failed LOGIN answers NO and waits for another attempt;
//! a successful one hands both connections (and the credentials) to
//! the preuser stage.
//!
//! The upstream and downstream prelogin halves run concurrently: the
//! upstream greeting/capability exchange does not delay our greeting.

use citm_imap::extensions::{Ext, ExtState, Extensions};
use citm_imap::parse::CmdEvent;
use citm_imap::types::command::{Command, CommandBody};
use citm_imap::types::core::{IString, Tag};
use citm_imap::types::response::{
    Capa, Code, Response, ResponseData, ResponseStatus, StatusKind,
};
use tokio_rustls::TlsAcceptor;

use crate::conn::{ImapClientConn, ImapServerConn};
use crate::error::ProtoError;

/// The result of a successful login.
pub struct LoginOutcome {
    pub dn: ImapServerConn,
    pub up: ImapClientConn,
    pub user: String,
    pub pass: String,
}

/// The capabilities we offer downstream clients (XKEY stays between us
/// and the upstream server).
pub fn dn_capabilities() -> Vec<Capa> {
    vec![
        Capa::Imap4rev1,
        Capa::Uidplus,
        Capa::Enable,
        Capa::Condstore,
        Capa::Qresync,
        Capa::Unselect,
        Capa::Idle,
        Capa::LiteralPlus,
    ]
}

/// Map an advertised capability list onto an extensions record:
/// advertised means available (Off), absent means Disabled.
pub fn exts_from_capas(capas: &[Capa]) -> Extensions {
    let mut exts = Extensions::all_disabled();
    for capa in capas {
        if let Some(ext) = capa.to_ext() {
            exts.set(ext, ExtState::Off);
        }
    }
    exts
}

/// Run the pre-login stage.  `Ok(None)` is a graceful LOGOUT.
pub async fn run(
    mut dn: ImapServerConn,
    mut up: ImapClientConn,
    acceptor: Option<&TlsAcceptor>,
) -> Result<Option<LoginOutcome>, ProtoError> {
    // prelogin halves in parallel
    let (up_res, dn_res) = tokio::join!(upstream_prelogin(&mut up), async {
        dn.write(&Response::Status(ResponseStatus::ok(
            None,
            Some(Code::Capability(dn_capabilities())),
            "citm ready",
        )))
        .await
    });
    up_res?;
    dn_res?;

    let mut tls_done = acceptor.is_none();

    loop {
        let event = match next_dn_event(&mut dn).await? {
            Some(ev) => ev,
            None => return Ok(None), // client hung up
        };
        let cmd = match event {
            CmdEvent::Cmd(cmd) => cmd,
            CmdEvent::Done => continue,
            CmdEvent::Bad { text } => {
                dn.write_parse_bad(&text).await?;
                continue;
            }
        };
        let tag = cmd.tag.clone();
        match cmd.body {
            CommandBody::Noop => {
                ok(&mut dn, tag, "NOOP completed").await?;
            }
            CommandBody::Capability => {
                dn.write(&Response::Data(ResponseData::Capability(dn_capabilities())))
                    .await?;
                ok(&mut dn, tag, "CAPABILITY completed").await?;
            }
            CommandBody::Logout => {
                dn.write(&Response::Status(ResponseStatus::bye("logging out")))
                    .await?;
                ok(&mut dn, tag, "LOGOUT completed").await?;
                return Ok(None);
            }
            CommandBody::StartTls => match (acceptor, tls_done) {
                (Some(acceptor), false) => {
                    ok(&mut dn, tag, "begin TLS negotiation").await?;
                    let exts = dn.exts;
                    let plain = dn.into_stream();
                    let tls = acceptor.accept(plain).await.map_err(ProtoError::Os)?;
                    dn = ImapServerConn::new(Box::new(tls), exts);
                    tls_done = true;
                }
                _ => {
                    dn.write(&Response::Status(ResponseStatus::bad(
                        Some(tag),
                        None,
                        "TLS not available here",
                    )))
                    .await?;
                }
            },
            CommandBody::Login { user, pass } => {
                match proxy_login(&mut up, &user, &pass).await? {
                    true => {
                        ok(&mut dn, tag, "LOGIN completed").await?;
                        return Ok(Some(LoginOutcome {
                            dn,
                            up,
                            user: user.to_string_lossy(),
                            pass: pass.to_string_lossy(),
                        }));
                    }
                    false => {
                        dn.write(&Response::Status(ResponseStatus::no(
                            Some(tag),
                            None,
                            "LOGIN failed",
                        )))
                        .await?;
                        // reset: wait for another LOGIN
                    }
                }
            }
            other => {
                dn.write(&Response::Status(ResponseStatus::bad(
                    Some(tag),
                    None,
                    format!("{} before LOGIN", other.name()),
                )))
                .await?;
            }
        }
    }
}

async fn next_dn_event(dn: &mut ImapServerConn) -> Result<Option<CmdEvent>, ProtoError> {
    loop {
        if let Some(ev) = dn.next_event() {
            return Ok(Some(ev));
        }
        if dn.pending_sync_literal().is_some() {
            dn.write(&Response::Plus { code: None, text: "OK".into() })
                .await?;
        }
        if !dn.read_more().await? {
            return Ok(None);
        }
    }
}

async fn ok(dn: &mut ImapServerConn, tag: Tag, text: &str) -> Result<(), ProtoError> {
    dn.write(&Response::Status(ResponseStatus::ok(Some(tag), None, text)))
        .await
}

/// Read the upstream greeting and learn its capabilities, asking
/// explicitly when the greeting does not volunteer them.
pub(crate) async fn upstream_prelogin(up: &mut ImapClientConn) -> Result<(), ProtoError> {
    let greeting = up.read_response().await?;
    let mut capas: Option<Vec<Capa>> = None;
    match &greeting {
        Response::Status(ResponseStatus { tag: None, kind: StatusKind::Ok, code, .. }) => {
            if let Some(Code::Capability(list)) = code {
                capas = Some(list.clone());
            }
        }
        Response::Status(ResponseStatus { kind: StatusKind::Bye, text, .. }) => {
            return Err(ProtoError::Response(format!("upstream rejected us: {text}")));
        }
        other => {
            return Err(ProtoError::Response(format!(
                "unexpected upstream greeting: {other:?}"
            )));
        }
    }

    if capas.is_none() {
        let tag = up.tags.next();
        up.write(&Command::new(tag.clone(), CommandBody::Capability))
            .await?;
        loop {
            match up.read_response().await? {
                Response::Data(ResponseData::Capability(list)) => capas = Some(list),
                Response::Status(ResponseStatus { tag: Some(t), kind, text, .. })
                    if t == tag =>
                {
                    if kind != StatusKind::Ok {
                        return Err(ProtoError::Response(format!(
                            "upstream CAPABILITY failed: {text}"
                        )));
                    }
                    break;
                }
                _ => {}
            }
        }
    }

    let capas =
        capas.ok_or_else(|| ProtoError::Response("upstream offered no capabilities".into()))?;
    if !capas.contains(&Capa::Imap4rev1) {
        return Err(ProtoError::Response("upstream is not an IMAP4rev1 server".into()));
    }
    up.exts = exts_from_capas(&capas);
    Ok(())
}

/// Forward a LOGIN upstream; true on success.
async fn proxy_login(
    up: &mut ImapClientConn,
    user: &IString,
    pass: &IString,
) -> Result<bool, ProtoError> {
    let tag = up.tags.next();
    up.write(&Command::new(
        tag.clone(),
        CommandBody::Login { user: user.clone(), pass: pass.clone() },
    ))
    .await?;
    loop {
        match up.read_response().await? {
            Response::Status(ResponseStatus { tag: Some(t), kind, code, .. }) if t == tag => {
                // a post-login capability code updates our view
                if let Some(Code::Capability(list)) = code {
                    up.exts = exts_from_capas(&list);
                }
                return Ok(kind == StatusKind::Ok);
            }
            Response::Data(ResponseData::Capability(list)) => {
                up.exts = exts_from_capas(&list);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    async fn read_some(
        rd: &mut (impl tokio::io::AsyncRead + Unpin),
        until: &str,
    ) -> String {
        let mut got = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = rd.read(&mut buf).await.unwrap();
            assert!(n > 0, "eof before {until:?}; got {:?}", String::from_utf8_lossy(&got));
            got.extend_from_slice(&buf[..n]);
            if String::from_utf8_lossy(&got).contains(until) {
                return String::from_utf8_lossy(&got).into_owned();
            }
        }
    }

    #[tokio::test]
    async fn login_flow_with_one_failure() {
        let (dn_ours, dn_theirs) = duplex(64 * 1024);
        let (up_ours, up_theirs) = duplex(64 * 1024);
        let dn = ImapServerConn::new(Box::new(dn_ours), Extensions::all_available());
        let up = ImapClientConn::new(Box::new(up_ours), Extensions::all_disabled());

        let task = tokio::spawn(async move { run(dn, up, None).await });

        let (mut client_rd, mut client_wr) = tokio::io::split(dn_theirs);
        let (mut srv_rd, mut srv_wr) = tokio::io::split(up_theirs);

        // upstream greets with capabilities
        srv_wr
            .write_all(b"* OK [CAPABILITY IMAP4rev1 UIDPLUS ENABLE CONDSTORE QRESYNC UNSELECT IDLE LITERAL+ XKEY] hi\r\n")
            .await
            .unwrap();

        // client sees our greeting
        let text = read_some(&mut client_rd, "citm ready").await;
        assert!(text.contains("CAPABILITY"));
        assert!(!text.contains("XKEY"));

        // bad password first
        client_wr
            .write_all(b"a1 LOGIN alice wrong\r\n")
            .await
            .unwrap();
        read_some(&mut srv_rd, "LOGIN").await;
        srv_wr.write_all(b"citm1 NO bad creds\r\n").await.unwrap();
        let text = read_some(&mut client_rd, "a1 NO").await;
        assert!(text.contains("LOGIN failed"));

        // then success
        client_wr
            .write_all(b"a2 LOGIN alice hunter2\r\n")
            .await
            .unwrap();
        read_some(&mut srv_rd, "LOGIN").await;
        srv_wr.write_all(b"citm2 OK logged in\r\n").await.unwrap();
        read_some(&mut client_rd, "a2 OK").await;

        let outcome = task.await.unwrap().unwrap().unwrap();
        assert_eq!(outcome.user, "alice");
        assert_eq!(outcome.pass, "hunter2");
        assert!(outcome.up.exts.is_available(Ext::Xkey));
    }

    #[tokio::test]
    async fn logout_before_login() {
        let (dn_ours, dn_theirs) = duplex(64 * 1024);
        let (up_ours, up_theirs) = duplex(64 * 1024);
        let dn = ImapServerConn::new(Box::new(dn_ours), Extensions::all_available());
        let up = ImapClientConn::new(Box::new(up_ours), Extensions::all_disabled());

        let task = tokio::spawn(async move { run(dn, up, None).await });
        let (mut client_rd, mut client_wr) = tokio::io::split(dn_theirs);
        let (_srv_rd, mut srv_wr) = tokio::io::split(up_theirs);

        srv_wr
            .write_all(b"* OK [CAPABILITY IMAP4rev1] hi\r\n")
            .await
            .unwrap();
        read_some(&mut client_rd, "citm ready").await;
        client_wr.write_all(b"a1 LOGOUT\r\n").await.unwrap();
        let text = read_some(&mut client_rd, "a1 OK").await;
        assert!(text.contains("* BYE"));
        assert!(task.await.unwrap().unwrap().is_none());
    }
}
