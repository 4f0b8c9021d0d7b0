//! Git over SSH. Public-key authentication only; each session channel runs
//! one `git-upload-pack` or `git-receive-pack` through a [`ProcessRelay`].
//!
//! [`ProcessRelay`]: crate::server::relay::ProcessRelay

mod command;
pub mod host_key;
mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::MethodSet;
use russh_keys::key::KeyPair;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use command::{ExecCommand, parse_exec_command};

use self::session::SessionHandler;
use crate::engine::VersionControlEngine;
use crate::error::Result;
use crate::indexer::IndexTrigger;
use crate::store::Store;

/// Shared by every session of one server.
pub(crate) struct SshContext {
    pub store: Arc<dyn Store>,
    pub engine: Arc<dyn VersionControlEngine>,
    pub trigger: Arc<IndexTrigger>,
}

pub struct SshServer {
    addr: SocketAddr,
    config: Arc<russh::server::Config>,
    ctx: Arc<SshContext>,
    shutdown: CancellationToken,
}

/// A running accept loop.
pub struct SshServerHandle {
    pub local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl SshServerHandle {
    /// Waits for the accept loop to end after [`SshServer::stop`].
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::warn!("SSH accept loop panicked: {e}");
        }
    }
}

impl SshServer {
    pub fn new(
        addr: SocketAddr,
        host_key: KeyPair,
        store: Arc<dyn Store>,
        engine: Arc<dyn VersionControlEngine>,
        trigger: Arc<IndexTrigger>,
    ) -> Self {
        let config = russh::server::Config {
            keys: vec![host_key],
            methods: MethodSet::PUBLICKEY,
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::ZERO),
            inactivity_timeout: Some(Duration::from_secs(3600)),
            ..Default::default()
        };

        Self {
            addr,
            config: Arc::new(config),
            ctx: Arc::new(SshContext {
                store,
                engine,
                trigger,
            }),
            shutdown: CancellationToken::new(),
        }
    }

    /// Binds the listener and starts accepting connections.
    pub async fn start(&self) -> Result<SshServerHandle> {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("SSH listening on {local_addr}");

        let task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.config),
            Arc::clone(&self.ctx),
            self.shutdown.clone(),
        ));

        Ok(SshServerHandle { local_addr, task })
    }

    /// Stops accepting and tears down every live session, killing their git
    /// processes.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<russh::server::Config>,
    ctx: Arc<SshContext>,
    shutdown: CancellationToken,
) {
    loop {
        let (socket, peer) = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("SSH accept failed: {e}");
                    continue;
                }
            },
        };

        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!("set_nodelay failed: {e}");
        }

        let session_shutdown = shutdown.child_token();
        let handler = SessionHandler::new(Arc::clone(&ctx), Some(peer), session_shutdown.clone());
        let config = Arc::clone(&config);

        tokio::spawn(async move {
            let session = match russh::server::run_stream(config, socket, handler).await {
                Ok(session) => session,
                Err(e) => {
                    tracing::debug!(%peer, "SSH handshake failed: {e}");
                    return;
                }
            };
            tokio::select! {
                result = session => {
                    if let Err(e) = result {
                        tracing::debug!(%peer, "SSH session ended: {e}");
                    }
                }
                () = session_shutdown.cancelled() => {
                    tracing::debug!(%peer, "SSH session closed by shutdown");
                }
            }
        });
    }

    tracing::info!("SSH server stopped");
}
