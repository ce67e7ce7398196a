//! SSH server glue
//!
//! `russh` handles the transport (key exchange, encryption, channels). This
//! module accepts password logins, accepts the `sftp` subsystem and runs one
//! [`session::serve`] task per SFTP channel.

use crate::auth::Credentials;
use crate::dispatcher::Dispatcher;
use crate::handle::HandleTable;
use crate::jail::Jail;
use crate::{Config, Error, Result, session};
use russh::keys::PrivateKey;
use russh::server::{self, Auth, Msg, Server as _, Session};
use russh::{Channel, ChannelId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// SFTP Server
pub struct Server {
    config: Arc<Config>,
    jail: Jail,
    ssh_config: server::Config,
}

impl Server {
    /// Create a server from a validated configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid or the host
    /// key cannot be loaded.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let jail = Jail::new(&config.root_dir)?;

        let host_key = load_host_key(config.host_key_path.as_deref())?;

        let ssh_config = server::Config {
            inactivity_timeout: Some(Duration::from_secs(config.timeout)),
            auth_rejection_time: Duration::from_secs(3),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            keys: vec![host_key],
            ..Default::default()
        };

        Ok(Self {
            config: Arc::new(config),
            jail,
            ssh_config,
        })
    }

    /// Bind and serve connections until the listener fails
    ///
    /// # Errors
    ///
    /// Returns [`Error::Filesystem`] if the address cannot be bound and
    /// [`Error::Ssh`] if the accept loop fails.
    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(
            event = "server_start",
            address = %addr,
            root = ?self.jail.root(),
            "Starting SFTP server"
        );

        self.run_on_listener(listener).await
    }

    /// Serve connections from an already-bound listener
    ///
    /// # Errors
    ///
    /// Returns [`Error::Ssh`] if the accept loop fails.
    pub async fn run_on_listener(self, listener: TcpListener) -> Result<()> {
        let mut factory = SftpServer {
            config: self.config,
            jail: self.jail,
        };

        factory
            .run_on_socket(Arc::new(self.ssh_config), &listener)
            .await
            .map_err(|e| Error::Ssh(format!("Server error: {e}")))
    }
}

/// Creates one handler per TCP connection
struct SftpServer {
    config: Arc<Config>,
    jail: Jail,
}

impl server::Server for SftpServer {
    type Handler = ConnectionHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!(event = "connection_accepted", peer = ?peer_addr, "New SSH connection");
        ConnectionHandler {
            config: Arc::clone(&self.config),
            jail: self.jail.clone(),
            credentials: Credentials::new(
                self.config.username.clone(),
                self.config.password.clone(),
            ),
            peer_addr,
            user: None,
            channels: HashMap::new(),
        }
    }

    fn handle_session_error(&mut self, error: <Self::Handler as server::Handler>::Error) {
        error!(error = %error, "SSH session error");
    }
}

/// Per-connection state
struct ConnectionHandler {
    config: Arc<Config>,
    jail: Jail,
    credentials: Credentials,
    peer_addr: Option<SocketAddr>,
    user: Option<String>,
    /// Session channels waiting for a subsystem request
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl ConnectionHandler {
    fn spawn_sftp(&self, channel: Channel<Msg>) {
        let dispatcher = Dispatcher::new(
            self.jail.clone(),
            HandleTable::new(self.config.max_handles),
            self.config.max_read_len,
        );
        let max_packet_size = self.config.max_packet_size;
        let user = self.user.clone().unwrap_or_default();
        let stream = channel.into_stream();

        tokio::spawn(async move {
            if let Err(e) = session::serve(stream, dispatcher, max_packet_size, &user).await {
                debug!(error = %e, "SFTP session task finished with error");
            }
        });
    }
}

impl server::Handler for ConnectionHandler {
    type Error = Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth> {
        debug!(user, method = "none", "Rejecting authentication method");
        Ok(Auth::reject())
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<Auth> {
        debug!(user, method = "publickey", "Rejecting authentication method");
        Ok(Auth::reject())
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth> {
        match self.credentials.verify(user, password) {
            Ok(()) => {
                self.user = Some(user.to_string());
                Ok(Auth::Accept)
            }
            Err(e) => {
                warn!(
                    event = "security_violation",
                    peer = ?self.peer_addr,
                    error = %e.sanitized_message(),
                    "Password rejected"
                );
                Ok(Auth::reject())
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool> {
        debug!(channel = %channel.id(), "Session channel opened");
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<()> {
        info!(event = "subsystem_request", subsystem = name, channel = %channel_id);

        match (name, self.channels.remove(&channel_id)) {
            ("sftp", Some(channel)) => {
                session.channel_success(channel_id)?;
                self.spawn_sftp(channel);
            }
            (_, channel) => {
                warn!(subsystem = name, "Unsupported subsystem");
                if let Some(channel) = channel {
                    self.channels.insert(channel_id, channel);
                }
                session.channel_failure(channel_id)?;
            }
        }
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<()> {
        debug!(channel = %channel, "Channel closed");
        self.channels.remove(&channel);
        Ok(())
    }
}

/// Load the configured host key, or generate an ephemeral Ed25519 key
fn load_host_key(path: Option<&Path>) -> Result<PrivateKey> {
    match path {
        Some(path) if path.exists() => russh::keys::load_secret_key(path, None)
            .map_err(|e| Error::Config(format!("Failed to load host key: {e}"))),
        other => {
            warn!(
                path = ?other,
                "Host key not found, generating temporary Ed25519 key"
            );
            PrivateKey::random(&mut rand::thread_rng(), russh::keys::Algorithm::Ed25519)
                .map_err(|e| Error::Config(format!("Failed to generate host key: {e}")))
        }
    }
}
