use crate::{
    auth::{AuthRegistry, AuthStrategy, UserPass},
    connection::Connection,
    protocol::AuthMethod,
};
use anyhow::{Result, anyhow, bail};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Default time a client may stay silent before the relay starts
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// ServerConfig holds the listener settings of a Socks5Server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:1080".to_string(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Socks5Server represents a SOCKS5 server and houses related
/// configuration data
pub struct Socks5Server {
    pub config: ServerConfig,
    registry: AuthRegistry,
    listener: Option<TcpListener>,
}

/// Socks5Server implementation block
impl Socks5Server {
    /// new is a constructor for the Socks5Server type. No auth method is
    /// registered yet, so every client is refused until one is.
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self::with_config(ServerConfig {
            listen_addr: listen_addr.into(),
            ..ServerConfig::default()
        })
    }

    /// with_config is a constructor taking the full ServerConfig
    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            config,
            registry: AuthRegistry::new(),
            listener: None,
        }
    }

    /// with_auth registers username/password with the given credentials,
    /// or no-auth when there are none
    pub fn with_auth(mut self, auth: Option<UserPass>) -> Result<Self> {
        match auth {
            Some(creds) => self.register_auth(AuthMethod::UserPass as u8, Some(creds), None)?,
            None => self.register_auth(AuthMethod::NoAuth as u8, None, None)?,
        }
        Ok(self)
    }

    /// with_idle_timeout overrides the pre-relay idle timeout
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.config.idle_timeout = idle_timeout;
        self
    }

    /// register_auth adds an auth method. It must be called before `run`;
    /// the last registration for a method wins.
    pub fn register_auth(
        &mut self,
        method: u8,
        config: Option<UserPass>,
        strategy: Option<Arc<dyn AuthStrategy>>,
    ) -> Result<()> {
        self.registry.register(method, config, strategy)?;
        info!("registered auth method {method:#04x}");
        Ok(())
    }

    /// bind to the listen address, errors when called twice
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if self.listener.is_some() {
            bail!("[ERR] bind can only be called once");
        }

        // Instantiate tokio listener
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;

        info!("SOCKS5 proxy listening on {:?}", addr);

        self.listener = Some(listener);
        Ok(addr)
    }

    /// local_addr is the bound address, once `bind` has run
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// run handles server spinup and listens for incoming connections
    pub async fn run(&mut self) -> Result<()> {
        if self.listener.is_none() {
            self.bind().await?;
        }
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow!("[ERR] listener missing after bind"))?;

        if self.registry.is_empty() {
            info!("no auth methods registered: every client will be refused");
        }

        // Registration is over once we accept, connections share a snapshot
        let registry = Arc::new(self.registry.clone());
        let idle_timeout = self.config.idle_timeout;

        // Listen for connections to proxy
        loop {
            // Accept incoming connection
            let (inbound, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("accept error: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            // Clone for this connection
            let registry = Arc::clone(&registry);

            // Spawn async task
            tokio::spawn(async move {
                info!("new client: {}", peer_addr);

                let connection = Connection::new(inbound, peer_addr, registry, idle_timeout);
                if let Err(e) = connection.run().await {
                    error!("connection error from {peer_addr}: {e}");
                }
            });
        }
    }
}
