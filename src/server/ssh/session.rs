use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::PublicKeyBase64;
use russh_keys::key::PublicKey;
use tokio_util::sync::CancellationToken;

use super::SshContext;
use super::command::parse_exec_command;
use crate::auth::find_matching_key;
use crate::engine::{GitService, ProtocolMode};
use crate::error::{Error, Result};
use crate::server::access::{can_push, can_read, resolve_repo};
use crate::server::relay::{ProcessRelay, RelaySink};
use crate::types::{Repository, User};

const STDERR_EXT: u32 = 1;

fn channel_gone() -> Error {
    Error::Io(std::io::ErrorKind::BrokenPipe.into())
}

/// Forwards child output to one SSH channel.
struct ChannelSink {
    handle: Handle,
    channel: ChannelId,
}

#[async_trait]
impl RelaySink for ChannelSink {
    async fn stdout(&self, data: Bytes) -> Result<()> {
        self.handle
            .data(self.channel, CryptoVec::from_slice(&data))
            .await
            .map_err(|_| channel_gone())
    }

    async fn stderr(&self, data: Bytes) -> Result<()> {
        self.handle
            .extended_data(self.channel, STDERR_EXT, CryptoVec::from_slice(&data))
            .await
            .map_err(|_| channel_gone())
    }

    async fn exit(&self, code: u32) -> Result<()> {
        self.handle
            .exit_status_request(self.channel, code)
            .await
            .map_err(|_| channel_gone())?;
        let _ = self.handle.eof(self.channel).await;
        let _ = self.handle.close(self.channel).await;
        Ok(())
    }
}

/// Per-connection state. A connection authenticates once and then runs at
/// most one git command per channel.
pub struct SessionHandler {
    ctx: Arc<SshContext>,
    peer: Option<SocketAddr>,
    user: Option<User>,
    relays: Arc<Mutex<HashMap<ChannelId, ProcessRelay>>>,
    shutdown: CancellationToken,
}

impl SessionHandler {
    pub(super) fn new(
        ctx: Arc<SshContext>,
        peer: Option<SocketAddr>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            peer,
            user: None,
            relays: Arc::new(Mutex::new(HashMap::new())),
            shutdown,
        }
    }

    fn relays(&self) -> std::sync::MutexGuard<'_, HashMap<ChannelId, ProcessRelay>> {
        self.relays
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Looks up the target repository and applies the permission gate. Every
    /// failure looks the same to the client.
    fn authorize(&self, user: &User, owner: &str, repo: &str, service: GitService) -> Option<Repository> {
        let store = self.ctx.store.as_ref();
        let lookup = resolve_repo(store, owner, repo).and_then(|found| {
            let Some((_, repo)) = found else {
                return Ok(None);
            };
            let allowed = match service {
                GitService::UploadPack => can_read(store, Some(&user.id), &repo.id)?,
                GitService::ReceivePack => can_push(store, &user.id, &repo.id)?,
            };
            Ok(allowed.then_some(repo))
        });

        match lookup {
            Ok(repo) => repo,
            Err(e) => {
                tracing::warn!(peer = ?self.peer, "SSH authorization lookup failed: {e}");
                None
            }
        }
    }

    fn refuse(channel: ChannelId, session: &mut Session) {
        let _ = session.channel_failure(channel);
        let _ = session.close(channel);
    }

    async fn start_command(
        &mut self,
        channel: ChannelId,
        raw: &str,
        session: &mut Session,
    ) -> Result<bool> {
        let Some(user) = self.user.clone() else {
            return Ok(false);
        };
        let command = match parse_exec_command(raw) {
            Ok(command) => command,
            Err(e) => {
                tracing::info!(peer = ?self.peer, user = %user.username, "SSH command refused: {e}");
                return Ok(false);
            }
        };
        let Some(repo) = self.authorize(&user, &command.owner, &command.repo, command.service) else {
            tracing::info!(
                user = %user.username,
                owner = %command.owner,
                repo = %command.repo,
                service = %command.service,
                "SSH access denied"
            );
            return Ok(false);
        };

        let pending = if command.service.is_write() {
            match self.ctx.trigger.capture(&repo.id, &repo.path).await {
                Ok(pending) => Some(pending),
                Err(e) => {
                    tracing::warn!(repo_id = %repo.id, "Ref snapshot failed, push will not be indexed: {e}");
                    None
                }
            }
        } else {
            None
        };

        let process = self
            .ctx
            .engine
            .protocol_command(&repo.path, command.service, ProtocolMode::Interactive);
        let sink = Arc::new(ChannelSink {
            handle: session.handle(),
            channel,
        });
        let relay = ProcessRelay::spawn_with_cancel(process, sink, self.shutdown.child_token())?;

        let closed = relay.closed();
        self.relays().insert(channel, relay);

        let relays = Arc::clone(&self.relays);
        let trigger = Arc::clone(&self.ctx.trigger);
        tokio::spawn(async move {
            closed.await;
            relays
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(&channel);
            if let Some(pending) = pending {
                trigger.complete(pending);
            }
        });

        tracing::info!(
            user = %user.username,
            repo_id = %repo.id,
            service = %command.service,
            "SSH git command started"
        );
        Ok(true)
    }
}

#[async_trait]
impl Handler for SessionHandler {
    type Error = Error;

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth> {
        if self.user.is_some() {
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        }

        let offered = public_key.public_key_bytes();
        let keys = self.ctx.store.list_ssh_keys()?;
        let Some(key) = find_matching_key(&keys, &offered) else {
            tracing::info!(peer = ?self.peer, login = user, "SSH key not recognised");
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        };

        let Some(owner) = self.ctx.store.get_user(&key.user_id)? else {
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        };

        tracing::info!(peer = ?self.peer, user = %owner.username, key = %key.fingerprint, "SSH authenticated");
        self.user = Some(owner);
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool> {
        Ok(self.user.is_some())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<()> {
        let raw = String::from_utf8_lossy(data).into_owned();
        if self.relays().contains_key(&channel) {
            Self::refuse(channel, session);
            return Ok(());
        }

        match self.start_command(channel, &raw, session).await {
            Ok(true) => {
                let _ = session.channel_success(channel);
            }
            Ok(false) => Self::refuse(channel, session),
            Err(e) => {
                tracing::warn!(peer = ?self.peer, "Failed to start git command: {e}");
                Self::refuse(channel, session);
            }
        }
        Ok(())
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], _session: &mut Session) -> Result<()> {
        let stdin = self.relays().get(&channel).and_then(ProcessRelay::input);
        if let Some(stdin) = stdin {
            if stdin.send(Bytes::copy_from_slice(data)).is_err() {
                tracing::debug!(?channel, "Input after process stopped reading");
            }
        }
        Ok(())
    }

    async fn channel_eof(&mut self, channel: ChannelId, _session: &mut Session) -> Result<()> {
        if let Some(relay) = self.relays().get_mut(&channel) {
            relay.close_input();
        }
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<()> {
        if let Some(relay) = self.relays().remove(&channel) {
            relay.cancel();
        }
        Ok(())
    }
}

impl Drop for SessionHandler {
    fn drop(&mut self) {
        for (_, relay) in self.relays().drain() {
            relay.cancel();
        }
    }
}
