//! The keysync client: one long-lived XKEYSYNC command upstream,
//! streaming key changes into the keydir.
//!
//! CREATED adds a key, DELETED removes one, and `* XKEYSYNC OK` means
//! the server is ending the stream (we re-subscribe).  A DELETED for
//! mykey is the STONITH signal: the account logs itself out rather
//! than fight over its own key.

use std::sync::Arc;

use citm_imap::types::command::{Command, CommandBody};
use citm_imap::types::core::{IString, Tag};
use citm_imap::types::response::{
    Response, ResponseData, ResponseStatus, StatusKind, XkeySyncResp,
};

use crate::error::ProtoError;
use crate::keydir::Keydir;

/// What the owner must act on after feeding a response.
#[derive(Debug, Default)]
pub struct KeysyncOutput {
    pub cmds: Vec<Command>,
    /// Upstream deleted mykey; the user must log out.
    pub stonith: bool,
    /// Fingerprints of keys created in this step (new-device notices).
    pub created: Vec<citm_crypto::Fingerprint>,
}

pub struct KeysyncClient {
    keydir: Arc<dyn Keydir>,
    sync_tag: Option<Tag>,
}

impl KeysyncClient {
    pub fn new(keydir: Arc<dyn Keydir>) -> KeysyncClient {
        KeysyncClient { keydir, sync_tag: None }
    }

    /// (Re-)subscribe, advertising the fingerprints we already hold so
    /// the server does not repeat them.
    pub fn subscribe(&mut self, tags: &mut citm_imap::types::core::TagGen) -> Command {
        let mut fprs: Vec<IString> = vec![IString::Atom(
            self.keydir.mykey().fingerprint().hex(),
        )];
        for key in self.keydir.peers() {
            fprs.push(IString::Atom(key.fingerprint().hex()));
        }
        let tag = tags.next();
        self.sync_tag = Some(tag.clone());
        Command::new(tag, CommandBody::XkeySync(fprs))
    }

    /// Feed one upstream response.
    pub fn on_response(
        &mut self,
        resp: &Response,
        tags: &mut citm_imap::types::core::TagGen,
    ) -> Result<KeysyncOutput, ProtoError> {
        let mut out = KeysyncOutput::default();
        match resp {
            Response::Data(ResponseData::Xkeysync(x)) => match x {
                XkeySyncResp::Created(pem) => {
                    let key = self.keydir.add_key(&pem.to_string_lossy())?;
                    tracing::info!(fpr = %key.fingerprint(), "peer key created");
                    out.created.push(key.fingerprint().clone());
                }
                XkeySyncResp::Deleted(fpr_text) => {
                    let fpr =
                        citm_crypto::Fingerprint::from_hex(&fpr_text.to_string_lossy())
                            .map_err(|e| ProtoError::Response(e.to_string()))?;
                    if &fpr == self.keydir.mykey().fingerprint() {
                        tracing::warn!("upstream deleted our own key; logging out");
                        out.stonith = true;
                    } else {
                        tracing::info!(fpr = %fpr, "peer key deleted");
                        self.keydir.delete_key(&fpr);
                    }
                }
                XkeySyncResp::Ok => {
                    // server is closing the stream; re-subscribe after
                    // the tagged response
                }
            },
            Response::Status(ResponseStatus { tag: Some(tag), kind, text, .. }) => {
                if self.sync_tag.as_ref() == Some(tag) {
                    self.sync_tag = None;
                    if *kind != StatusKind::Ok {
                        return Err(ProtoError::Response(format!(
                            "XKEYSYNC refused: {} {}",
                            kind.token(),
                            text
                        )));
                    }
                    if !out.stonith {
                        out.cmds.push(self.subscribe(tags));
                    }
                }
            }
            _ => {}
        }
        Ok(out)
    }

    /// Connection lost: forget every discovered peer so the fresh
    /// subscription starts from a clean slate.
    pub fn connection_lost(&mut self) {
        self.sync_tag = None;
        for key in self.keydir.peers() {
            self.keydir.delete_key(key.fingerprint());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keydir::MemKeydir;
    use citm_crypto::Keypair;
    use citm_imap::types::core::TagGen;

    fn fixture() -> (Arc<MemKeydir>, KeysyncClient, TagGen) {
        let kd = Arc::new(MemKeydir::new(Keypair::generate(1024).unwrap()));
        let client = KeysyncClient::new(kd.clone());
        (kd, client, TagGen::new("k"))
    }

    fn created(pem: &str) -> Response {
        Response::Data(ResponseData::Xkeysync(XkeySyncResp::Created(IString::from(
            pem,
        ))))
    }

    #[test]
    fn created_and_deleted_maintain_the_keydir() {
        let (kd, mut client, mut tags) = fixture();
        let cmd = client.subscribe(&mut tags);
        assert!(matches!(cmd.body, CommandBody::XkeySync(ref f) if f.len() == 1));

        let peer = Keypair::generate(1024).unwrap();
        let out = client
            .on_response(&created(peer.public().pem()), &mut tags)
            .unwrap();
        assert!(!out.stonith);
        assert_eq!(kd.peers().len(), 1);

        let out = client
            .on_response(
                &Response::Data(ResponseData::Xkeysync(XkeySyncResp::Deleted(
                    IString::Atom(peer.fingerprint().hex()),
                ))),
                &mut tags,
            )
            .unwrap();
        assert!(!out.stonith);
        assert!(kd.peers().is_empty());
    }

    #[test]
    fn deleting_mykey_is_stonith() {
        let (kd, mut client, mut tags) = fixture();
        client.subscribe(&mut tags);
        let out = client
            .on_response(
                &Response::Data(ResponseData::Xkeysync(XkeySyncResp::Deleted(
                    IString::Atom(kd.mykey().fingerprint().hex()),
                ))),
                &mut tags,
            )
            .unwrap();
        assert!(out.stonith);
    }

    #[test]
    fn stream_end_resubscribes() {
        let (_kd, mut client, mut tags) = fixture();
        let cmd = client.subscribe(&mut tags);
        client
            .on_response(
                &Response::Data(ResponseData::Xkeysync(XkeySyncResp::Ok)),
                &mut tags,
            )
            .unwrap();
        let out = client
            .on_response(
                &Response::Status(ResponseStatus::ok(Some(cmd.tag.clone()), None, "done")),
                &mut tags,
            )
            .unwrap();
        assert_eq!(out.cmds.len(), 1);
        assert!(matches!(out.cmds[0].body, CommandBody::XkeySync(_)));
    }

    #[test]
    fn connection_loss_drops_discovered_keys() {
        let (kd, mut client, mut tags) = fixture();
        client.subscribe(&mut tags);
        let peer = Keypair::generate(1024).unwrap();
        client
            .on_response(&created(peer.public().pem()), &mut tags)
            .unwrap();
        assert_eq!(kd.peers().len(), 1);
        client.connection_lost();
        assert!(kd.peers().is_empty());
    }
}
