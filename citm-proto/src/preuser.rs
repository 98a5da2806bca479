//! The keysync warm-up, run once per account right after its first
//! successful login.
//!
//! To keep user-facing startup snappy the three commands are pipelined
//! in one write: LOGIN, a bare XKEYSYNC (which makes the server stream
//! every key it has), and the DONE that bounds the stream.  If the
//! streamed keys did not include mykey, it is published with XKEYADD.

use std::sync::Arc;

use citm_imap::extensions::Ext;
use citm_imap::types::command::{Command, CommandBody};
use citm_imap::types::core::IString;
use citm_imap::types::response::{
    Response, ResponseData, ResponseStatus, StatusKind, XkeySyncResp,
};

use crate::conn::ImapClientConn;
use crate::error::ProtoError;
use crate::keydir::Keydir;

pub async fn run(
    up: &mut ImapClientConn,
    user: &str,
    pass: &str,
    keydir: &Arc<dyn Keydir>,
) -> Result<(), ProtoError> {
    if !up.exts.is_available(Ext::Xkey) {
        return Err(ProtoError::Response(
            "upstream does not speak XKEY; cannot sync keys".into(),
        ));
    }

    let login_tag = up.tags.next();
    let sync_tag = up.tags.next();
    up.write_all_cmds(&[
        Command::new(
            login_tag.clone(),
            CommandBody::Login { user: IString::from(user), pass: IString::from(pass) },
        ),
        Command::new(sync_tag.clone(), CommandBody::XkeySync(vec![])),
        Command::new(sync_tag.clone(), CommandBody::XkeySyncDone),
    ])
    .await?;

    let mykey_fpr = keydir.mykey().fingerprint().clone();
    let mut saw_mykey = false;

    // drain until the XKEYSYNC tagged response
    loop {
        match up.read_response().await? {
            Response::Data(ResponseData::Xkeysync(XkeySyncResp::Created(pem))) => {
                let key = keydir.add_key(&pem.to_string_lossy())?;
                if key.fingerprint() == &mykey_fpr {
                    saw_mykey = true;
                }
            }
            Response::Data(ResponseData::Xkeysync(_)) => {}
            Response::Status(ResponseStatus { tag: Some(tag), kind, text, .. }) => {
                if tag == login_tag {
                    if kind != StatusKind::Ok {
                        return Err(ProtoError::Response(format!(
                            "keysync login failed: {text}"
                        )));
                    }
                } else if tag == sync_tag {
                    if kind != StatusKind::Ok {
                        return Err(ProtoError::Response(format!("XKEYSYNC failed: {text}")));
                    }
                    break;
                }
            }
            _ => {}
        }
    }

    if !saw_mykey {
        let add_tag = up.tags.next();
        up.write(&Command::new(
            add_tag.clone(),
            CommandBody::XkeyAdd(IString::Literal(
                keydir.mykey().public().pem().as_bytes().to_vec(),
            )),
        ))
        .await?;
        loop {
            match up.read_response().await? {
                Response::Status(ResponseStatus { tag: Some(tag), kind, text, .. })
                    if tag == add_tag =>
                {
                    if kind != StatusKind::Ok {
                        return Err(ProtoError::Response(format!("XKEYADD failed: {text}")));
                    }
                    break;
                }
                _ => {}
            }
        }
        tracing::info!(user, "published mykey upstream");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keydir::MemKeydir;
    use citm_imap::Extensions;
    use citm_crypto::Keypair;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    async fn read_until(rd: &mut (impl tokio::io::AsyncRead + Unpin), until: &str) -> String {
        let mut got = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = rd.read(&mut buf).await.unwrap();
            assert!(n > 0, "eof before {until:?}");
            got.extend_from_slice(&buf[..n]);
            let s = String::from_utf8_lossy(&got).into_owned();
            if s.contains(until) {
                return s;
            }
        }
    }

    #[tokio::test]
    async fn warmup_publishes_missing_mykey() {
        let (ours, theirs) = duplex(256 * 1024);
        let mut up = ImapClientConn::new(Box::new(ours), Extensions::all_available());
        let keydir: Arc<dyn Keydir> =
            Arc::new(MemKeydir::new(Keypair::generate(1024).unwrap()));
        let peer = Keypair::generate(1024).unwrap();
        let peer_pem = peer.public().pem().to_string();

        let kd = keydir.clone();
        let task = tokio::spawn(async move {
            let mut up = up;
            run(&mut up, "alice", "hunter2", &kd).await
        });

        let (mut rd, mut wr) = tokio::io::split(theirs);
        let text = read_until(&mut rd, "DONE\r\n").await;
        assert!(text.contains("LOGIN alice hunter2"));
        assert!(text.contains("XKEYSYNC\r\n"));

        wr.write_all(b"citm1 OK logged in\r\n").await.unwrap();
        // server streams one peer key (not ours)
        let created = format!("* XKEYSYNC CREATED {{{}}}\r\n{}\r\n", peer_pem.len(), peer_pem);
        wr.write_all(created.as_bytes()).await.unwrap();
        wr.write_all(b"citm2 OK done syncing\r\n").await.unwrap();

        // mykey was absent, expect an XKEYADD
        read_until(&mut rd, "XKEYADD").await;
        wr.write_all(b"citm3 OK key added\r\n").await.unwrap();

        task.await.unwrap().unwrap();
        assert_eq!(keydir.peers().len(), 1);
    }

    #[tokio::test]
    async fn warmup_skips_publish_when_mykey_present() {
        let (ours, theirs) = duplex(256 * 1024);
        let mut up = ImapClientConn::new(Box::new(ours), Extensions::all_available());
        let keydir: Arc<dyn Keydir> =
            Arc::new(MemKeydir::new(Keypair::generate(1024).unwrap()));
        let my_pem = keydir.mykey().public().pem().to_string();

        let kd = keydir.clone();
        let task = tokio::spawn(async move {
            let mut up = up;
            run(&mut up, "alice", "pw", &kd).await
        });

        let (mut rd, mut wr) = tokio::io::split(theirs);
        read_until(&mut rd, "DONE\r\n").await;
        wr.write_all(b"citm1 OK logged in\r\n").await.unwrap();
        let created = format!("* XKEYSYNC CREATED {{{}}}\r\n{}\r\n", my_pem.len(), my_pem);
        wr.write_all(created.as_bytes()).await.unwrap();
        wr.write_all(b"citm2 OK done\r\n").await.unwrap();

        task.await.unwrap().unwrap();
        // our own key is not a peer
        assert!(keydir.peers().is_empty());
    }
}
