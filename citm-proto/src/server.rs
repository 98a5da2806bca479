//! The accept loop: pairs every downstream connection with an upstream
//! connection and walks it through anon → preuser → user → bridge.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use citm_maildir::dirmgr::Dirmgr;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::anon;
use crate::conn::{ImapClientConn, ImapServerConn};
use crate::error::ProtoError;
use crate::keydir::{FsKeydir, Keydir};
use crate::preuser;
use crate::sc::{self, ScContext};
use crate::tls;
use crate::user::User;

#[derive(Debug, Clone)]
pub struct CitmConfig {
    /// Where downstream clients connect.
    pub listen_addr: SocketAddr,
    /// host:port of the upstream IMAP server.
    pub upstream_addr: String,
    /// TLS name of the upstream server.
    pub upstream_host: String,
    /// Plaintext upstream connections, for tests against local servers.
    pub upstream_insecure: bool,
    /// Extra CA bundle to trust for the upstream connection.
    pub trust_ca: Option<PathBuf>,
    /// Certificate + key for the downstream listener; None = plaintext
    /// listener (loopback deployments).
    pub tls: Option<(PathBuf, PathBuf)>,
    /// Offer STARTTLS on a plaintext listener instead of wrapping every
    /// connection at accept time.  Requires `tls`.
    pub starttls: bool,
    /// Per-user state root; user data lands under `<root>/<user>/`.
    pub state_root: PathBuf,
}

pub struct Citm {
    cfg: CitmConfig,
    acceptor: Option<TlsAcceptor>,
    users: Mutex<HashMap<String, Arc<User>>>,
}

impl Citm {
    pub fn new(cfg: CitmConfig) -> Result<Arc<Citm>, ProtoError> {
        let acceptor = match &cfg.tls {
            Some((cert, key)) => Some(tls::acceptor(cert, key)?),
            None => None,
        };
        Ok(Arc::new(Citm { cfg, acceptor, users: Mutex::new(HashMap::new()) }))
    }

    /// Accept until the shutdown watch trips, then stop the users and
    /// drain the remaining connections.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), ProtoError> {
        let listener = TcpListener::bind(self.cfg.listen_addr).await?;
        tracing::info!(addr = %self.cfg.listen_addr, "citm listening");

        let mut connections = FuturesUnordered::new();

        while !*shutdown.borrow() {
            let wait_conn_finished = async {
                if connections.is_empty() {
                    futures::future::pending().await
                } else {
                    connections.next().await
                }
            };
            let (socket, peer) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = wait_conn_finished => continue,
                _ = shutdown.changed() => continue,
            };
            tracing::info!(%peer, "accepted connection");
            let this = self.clone();
            connections.push(tokio::spawn(async move {
                if let Err(e) = this.handle_conn(socket).await {
                    tracing::warn!(%peer, err = %e, "connection ended with error");
                }
            }));
        }
        drop(listener);

        tracing::info!("shutting down users, draining remaining connections...");
        let users: Vec<Arc<User>> = self.users.lock().unwrap().values().cloned().collect();
        for user in users {
            user.shut_down();
        }
        while connections.next().await.is_some() {}
        Ok(())
    }

    /// TCP + TLS + greeting + capability learning for one upstream
    /// connection.
    async fn connect_upstream(&self) -> Result<ImapClientConn, ProtoError> {
        let tcp = TcpStream::connect(&self.cfg.upstream_addr).await?;
        let mut up = if self.cfg.upstream_insecure {
            ImapClientConn::new(Box::new(tcp), citm_imap::Extensions::all_disabled())
        } else {
            let tls = tls::connect(tcp, &self.cfg.upstream_host, self.cfg.trust_ca.as_deref())
                .await?;
            ImapClientConn::new(Box::new(tls), citm_imap::Extensions::all_disabled())
        };
        anon::upstream_prelogin(&mut up).await?;
        Ok(up)
    }

    async fn handle_conn(self: &Arc<Self>, socket: TcpStream) -> Result<(), ProtoError> {
        // downstream side: wrap at accept time, unless the operator
        // asked for a STARTTLS listener
        let dn = match &self.acceptor {
            Some(acceptor) if !self.cfg.starttls => {
                let tls = acceptor.accept(socket).await?;
                ImapServerConn::new(Box::new(tls), citm_imap::Extensions::all_available())
            }
            _ => ImapServerConn::new(Box::new(socket), citm_imap::Extensions::all_available()),
        };

        // upstream side, then the pre-login dance
        let up = self.connect_upstream().await?;
        let starttls_acceptor = if self.cfg.starttls { self.acceptor.as_ref() } else { None };
        let Some(outcome) = anon::run(dn, up, starttls_acceptor).await? else {
            return Ok(());
        };

        let user = self.get_or_start_user(&outcome.user, &outcome.pass).await?;
        let ctx = ScContext {
            keydir: user.handle.keydir.clone(),
            dirmgr: user.handle.dirmgr.clone(),
        };
        sc::run(outcome.dn, outcome.up, ctx, user.handle.shutdown.clone()).await
    }

    /// First connection for an account runs the keysync warm-up and
    /// starts the account's long-lived keysync session.
    async fn get_or_start_user(
        self: &Arc<Self>,
        username: &str,
        pass: &str,
    ) -> Result<Arc<User>, ProtoError> {
        if let Some(user) = self.users.lock().unwrap().get(username) {
            return Ok(user.clone());
        }

        let user_root = self.cfg.state_root.join(citm_maildir::name::encode(username));
        let keys_root = user_root.join("keys");
        let keydir: Arc<dyn Keydir> = tokio::task::spawn_blocking(move || {
            FsKeydir::load(keys_root).map(Arc::new)
        })
        .await
        .map_err(|e| ProtoError::Internal(format!("keydir load task: {e}")))?
        .map(|kd| kd as Arc<dyn Keydir>)?;

        let mut warmup = self.connect_upstream().await?;
        preuser::run(&mut warmup, username, pass, &keydir).await?;

        let dirmgr = Arc::new(Dirmgr::new(user_root.join("mail")));
        let user = Arc::new(User::new(username.to_string(), keydir, dirmgr));

        // races on simultaneous first logins: the first insert wins
        {
            let mut users = self.users.lock().unwrap();
            if let Some(existing) = users.get(username) {
                return Ok(existing.clone());
            }
            users.insert(username.to_string(), user.clone());
        }

        // the warm-up connection stays on as the keysync session
        let keysync_user = user.clone();
        let this = self.clone();
        let username = username.to_string();
        tokio::spawn(async move {
            let result = keysync_user.run_keysync(warmup).await;
            if let Err(e) = result {
                tracing::warn!(user = %username, err = %e, "keysync session died");
            }
            // whatever the reason, this account is over; drop it so the
            // next login starts fresh
            this.users.lock().unwrap().remove(&username);
        });

        Ok(user)
    }
}
