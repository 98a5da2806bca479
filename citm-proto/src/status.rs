//! The status socket: a JSON-lines protocol over a UNIX socket that a
//! local control tool reads to learn what the daemon is doing.
//!
//! The server pushes one status object at connect time and again every
//! time the state changes; the client's only request is
//! `{"action": "check"}`, which asks the daemon to re-examine its
//! configuration immediately.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};

use crate::error::ProtoError;

/// "splintermail is ..."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusMaj {
    NoTls,
    ManualCert,
    NeedConf,
    TlsFirst,
    TlsExpired,
    TlsRenew,
    TlsGood,
}

/// "... and is currently ..."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusMin {
    None,
    CreateAccount,
    Reload,
    CreateOrder,
    GetAuthz,
    PrepareChallenge,
    CompleteChallenge,
    GenerateKey,
    FinalizeOrder,
    Retry,
}

/// yes / no / not-applicable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tri {
    Yes,
    No,
    Na,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitmStatus {
    pub version_maj: u32,
    pub version_min: u32,
    pub version_patch: u32,
    pub fulldomain: String,
    pub status_maj: StatusMaj,
    pub status_min: StatusMin,
    pub configured: Tri,
    pub tls_ready: Tri,
}

#[derive(Debug, Deserialize)]
struct ClientRequest {
    action: String,
}

/// Serve the status socket until the shutdown watch trips.  Each
/// connected client gets the current status immediately and an update
/// line on every change; a `check` request is forwarded to the owner.
pub async fn serve(
    path: PathBuf,
    status: watch::Receiver<CitmStatus>,
    check: mpsc::Sender<()>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ProtoError> {
    // a stale socket file from a dead daemon refuses binds
    let _ = std::fs::remove_file(&path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(&path)?;
    tracing::info!(path = %path.display(), "status socket listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _addr) = accepted?;
                let status = status.clone();
                let check = check.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_client(stream, status, check, shutdown).await {
                        tracing::debug!(err = %e, "status client dropped");
                    }
                });
            }
            _ = shutdown.changed() => {
                let _ = std::fs::remove_file(&path);
                return Ok(());
            }
        }
    }
}

async fn serve_client(
    stream: UnixStream,
    mut status: watch::Receiver<CitmStatus>,
    check: mpsc::Sender<()>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ProtoError> {
    let (rd, mut wr) = stream.into_split();
    let mut lines = BufReader::new(rd).lines();

    let send = |s: &CitmStatus| -> Result<Vec<u8>, ProtoError> {
        let mut line = serde_json::to_vec(s)
            .map_err(|e| ProtoError::Internal(format!("status serialization: {e}")))?;
        line.push(b'\n');
        Ok(line)
    };

    // one message on connect
    let line = send(&status.borrow_and_update().clone())?;
    wr.write_all(&line).await?;

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let line = send(&status.borrow_and_update().clone())?;
                wr.write_all(&line).await?;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(());
                };
                match serde_json::from_str::<ClientRequest>(&line) {
                    Ok(req) if req.action == "check" => {
                        let _ = check.send(()).await;
                    }
                    Ok(req) => {
                        tracing::debug!(action = %req.action, "unknown status action");
                    }
                    Err(e) => {
                        tracing::debug!(err = %e, "bad status request line");
                    }
                }
            }
            _ = shutdown.changed() => return Ok(()),
        }
    }
}

/// One-shot client: read the daemon's current status.
pub async fn fetch(path: &Path) -> Result<CitmStatus, ProtoError> {
    let stream = UnixStream::connect(path).await?;
    let mut lines = BufReader::new(stream).lines();
    let line = lines
        .next_line()
        .await?
        .ok_or(ProtoError::ConnClosed)?;
    serde_json::from_str(&line)
        .map_err(|e| ProtoError::Response(format!("bad status line: {e}")))
}

/// Ask the daemon to re-check its configuration, then report the next
/// status it emits.
pub async fn request_check(path: &Path) -> Result<CitmStatus, ProtoError> {
    let stream = UnixStream::connect(path).await?;
    let (rd, mut wr) = stream.into_split();
    let mut lines = BufReader::new(rd).lines();
    // the greeting status
    let _ = lines.next_line().await?.ok_or(ProtoError::ConnClosed)?;
    wr.write_all(b"{\"action\": \"check\"}\n").await?;
    let line = lines
        .next_line()
        .await?
        .ok_or(ProtoError::ConnClosed)?;
    serde_json::from_str(&line)
        .map_err(|e| ProtoError::Response(format!("bad status line: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CitmStatus {
        CitmStatus {
            version_maj: 0,
            version_min: 2,
            version_patch: 0,
            fulldomain: "user.splintermail.com".into(),
            status_maj: StatusMaj::TlsGood,
            status_min: StatusMin::None,
            configured: Tri::Yes,
            tls_ready: Tri::Yes,
        }
    }

    #[test]
    fn wire_format_field_names() {
        let json = serde_json::to_string(&sample()).unwrap();
        for field in [
            "\"version_maj\":0",
            "\"fulldomain\":\"user.splintermail.com\"",
            "\"status_maj\":\"tls_good\"",
            "\"status_min\":\"none\"",
            "\"configured\":\"yes\"",
            "\"tls_ready\":\"yes\"",
        ] {
            assert!(json.contains(field), "{json}");
        }
        let back: CitmStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn all_status_words_spell_right() {
        let majs = [
            (StatusMaj::NoTls, "no_tls"),
            (StatusMaj::ManualCert, "manual_cert"),
            (StatusMaj::NeedConf, "need_conf"),
            (StatusMaj::TlsFirst, "tls_first"),
            (StatusMaj::TlsExpired, "tls_expired"),
            (StatusMaj::TlsRenew, "tls_renew"),
            (StatusMaj::TlsGood, "tls_good"),
        ];
        for (v, s) in majs {
            assert_eq!(serde_json::to_string(&v).unwrap(), format!("\"{s}\""));
        }
        let mins = [
            (StatusMin::CreateAccount, "create_account"),
            (StatusMin::PrepareChallenge, "prepare_challenge"),
            (StatusMin::FinalizeOrder, "finalize_order"),
        ];
        for (v, s) in mins {
            assert_eq!(serde_json::to_string(&v).unwrap(), format!("\"{s}\""));
        }
    }

    #[tokio::test]
    async fn connect_emits_then_updates_on_change() {
        let tmp = tempfile::tempdir().unwrap();
        let sock = tmp.path().join("citm.sock");
        let (status_tx, status_rx) = watch::channel(sample());
        let (check_tx, mut check_rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let server = tokio::spawn(serve(sock.clone(), status_rx, check_tx, shutdown_rx));

        // wait for the socket to exist
        for _ in 0..100 {
            if sock.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let first = fetch(&sock).await.unwrap();
        assert_eq!(first, sample());

        // a check request comes through and the next update is seen
        let sock2 = sock.clone();
        let checker = tokio::spawn(async move { request_check(&sock2).await });
        check_rx.recv().await.unwrap();
        let mut updated = sample();
        updated.status_maj = StatusMaj::TlsRenew;
        updated.status_min = StatusMin::CreateOrder;
        status_tx.send(updated.clone()).unwrap();

        let got = checker.await.unwrap().unwrap();
        assert_eq!(got, updated);

        server.abort();
    }
}
