pub(crate) mod handshake;
#[cfg(test)]
mod test;

use std::time::Duration;

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};

use self::handshake::{Handshaker, HandshakerOptions};
use super::Connection;
use crate::{
    client::{
        auth::{self, AuthContext, Credential},
        options::{ClientOptions, ServerAddress},
    },
    error::{Error, Result},
    trace::CONNECTION_TRACING_EVENT_TARGET,
};

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Contains the logic to establish a connection: opening the stream, handshaking, and
/// authenticating.
#[derive(Clone, Debug)]
pub struct ConnectionEstablisher {
    /// Contains the logic for handshaking a connection.
    handshaker: Handshaker,

    credential: Option<Credential>,

    /// `None` means no timeout.
    connect_timeout: Option<Duration>,

    max_document_length_bytes: Option<usize>,
}

impl ConnectionEstablisher {
    /// Creates a new `ConnectionEstablisher` from the given options.
    pub fn new(options: &ClientOptions) -> Self {
        let connect_timeout = match options.connect_timeout {
            Some(d) if d.is_zero() => None,
            Some(d) => Some(d),
            None => Some(DEFAULT_CONNECT_TIMEOUT),
        };

        Self {
            handshaker: Handshaker::new(HandshakerOptions::from(options)),
            credential: options.credential.clone(),
            connect_timeout,
            max_document_length_bytes: options.tracing_max_document_length_bytes,
        }
    }

    async fn make_stream(&self, address: &ServerAddress) -> Result<TcpStream> {
        let connect = TcpStream::connect((address.host(), address.port_or_default()));
        let stream = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| Error::network_timeout())??,
            None => connect.await?,
        };
        stream.set_nodelay(true)?;

        Ok(stream)
    }

    /// Opens a TCP connection to `address` and establishes a connection over it.
    pub async fn establish_connection(&self, address: &ServerAddress) -> Result<Connection> {
        let stream = self.make_stream(address).await?;
        self.establish_stream(address.clone(), stream).await
    }

    /// Establishes a connection over an already-open stream: handshakes it and, unless the server
    /// is an arbiter, authenticates it with the configured credential.
    pub async fn establish_stream<S>(&self, address: ServerAddress, stream: S) -> Result<Connection>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        if let Some(ref credential) = self.credential {
            if let Some(ref mechanism) = credential.mechanism {
                mechanism.validate_credential(credential)?;
            }
        }

        let mut conn = Connection::new(address, stream, self.max_document_length_bytes);
        let mut auth_context = self.credential.clone().map(AuthContext::new);

        let hello_reply = self
            .handshaker
            .handshake(&mut conn, auth_context.as_mut())
            .await?;
        let server_type = hello_reply.command_response.server_type();

        if let Some(mut ctx) = auth_context {
            if server_type.can_auth() {
                auth::authenticate_stream(&mut conn, &mut ctx).await?;
                conn.auth_context = Some(ctx);
            }
        }

        tracing::debug!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            driverConnectionId = conn.id,
            serverHost = conn.address.host(),
            serverPort = conn.address.port_or_default(),
            authenticated = conn.is_authenticated(),
            "Connection ready"
        );

        Ok(conn)
    }
}
