pub(crate) mod command;
mod stream_description;
#[cfg(test)]
mod test;
pub(crate) mod wire;

use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::Instant,
};

use derive_where::derive_where;
use tokio::io::{AsyncRead, AsyncWrite, BufStream};

use self::wire::{next_request_id, Message, MessageFlags};
use crate::{
    bson::Document,
    client::auth::{AuthContext, AuthMechanism},
    error::{Error, Result},
    options::ServerAddress,
    trace::{command::CommandTracingEventEmitter, COMMAND_TRACING_EVENT_TARGET},
};

pub(crate) use self::{
    command::{Command, RawCommandResponse},
    stream_description::{
        DEFAULT_MAX_BSON_OBJECT_SIZE,
        DEFAULT_MAX_MESSAGE_SIZE_BYTES,
        DEFAULT_MAX_WRITE_BATCH_SIZE,
    },
};
pub use self::stream_description::{ServerType, StreamDescription};

/// A byte stream a connection can run over.
trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

fn next_connection_id() -> u32 {
    static CONNECTION_ID: AtomicU32 = AtomicU32::new(1);

    CONNECTION_ID.fetch_add(1, Ordering::SeqCst)
}

/// A single connection to a MongoDB server.
///
/// A connection carries one request/response exchange at a time; every operation on it takes
/// `&mut self`.
#[derive_where(Debug)]
pub struct Connection {
    /// Driver-generated ID for the connection.
    pub(crate) id: u32,

    pub(crate) address: ServerAddress,

    /// The cached StreamDescription from the connection's handshake.
    pub(crate) stream_description: Option<StreamDescription>,

    /// The authentication state of this connection, kept so it can be reauthenticated.
    pub(crate) auth_context: Option<AuthContext>,

    command_tracer: CommandTracingEventEmitter,

    #[derive_where(skip)]
    stream: BufStream<Box<dyn AsyncStream>>,
}

impl Connection {
    pub(crate) fn new<S>(
        address: ServerAddress,
        stream: S,
        max_document_length_bytes: Option<usize>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let id = next_connection_id();
        let stream: Box<dyn AsyncStream> = Box::new(stream);
        Self {
            id,
            command_tracer: CommandTracingEventEmitter::new(
                max_document_length_bytes,
                id,
                address.clone(),
            ),
            address,
            stream_description: None,
            auth_context: None,
            stream: BufStream::new(stream),
        }
    }

    /// The driver-generated ID of this connection.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The address of the server this connection is connected to.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Gets the connection's StreamDescription.
    pub fn stream_description(&self) -> Result<&StreamDescription> {
        self.stream_description
            .as_ref()
            .ok_or_else(|| Error::internal("Stream checked out but not handshaked"))
    }

    /// Whether this connection has been authenticated and can therefore be reauthenticated.
    pub fn is_authenticated(&self) -> bool {
        self.auth_context.is_some()
    }

    /// Writes a command to the server and reads its reply.
    ///
    /// An `Ok(...)` result simply means the server received the command and that the driver
    /// received the response; it does not imply anything about the success of the command
    /// itself.
    pub(crate) async fn send_message(&mut self, command: Command) -> Result<RawCommandResponse> {
        let request_id = next_request_id();
        let command_name = command.name.clone();
        let target_db = command.target_db.clone();
        let should_redact = command.should_redact();
        let message = Message::from_command(command, Some(request_id))?;

        let tracing_enabled =
            tracing::enabled!(target: COMMAND_TRACING_EVENT_TARGET, tracing::Level::DEBUG);
        if tracing_enabled {
            let command_document = if should_redact {
                Document::new()
            } else {
                message.get_command_document()
            };
            self.command_tracer
                .started(command_document, &target_db, &command_name, request_id);
        }

        let start_time = Instant::now();
        let result = self.write_and_read(message, request_id).await;

        if tracing_enabled {
            let duration = start_time.elapsed();
            match result {
                Ok(ref response) => match response.validate() {
                    Ok(()) => {
                        let reply = if should_redact {
                            Document::new()
                        } else {
                            response.to_document().unwrap_or_default()
                        };
                        self.command_tracer
                            .succeeded(reply, &command_name, request_id, duration);
                    }
                    Err(ref error) => {
                        self.command_tracer
                            .failed(error, &command_name, request_id, duration);
                    }
                },
                Err(ref error) => {
                    self.command_tracer
                        .failed(error, &command_name, request_id, duration);
                }
            }
        }

        result
    }

    async fn write_and_read(
        &mut self,
        message: Message,
        request_id: i32,
    ) -> Result<RawCommandResponse> {
        message.write_to(&mut self.stream).await?;

        let max_message_size_bytes = self
            .stream_description
            .as_ref()
            .map(|description| description.max_message_size_bytes);
        let reply = Message::read_from(&mut self.stream, max_message_size_bytes).await?;

        if reply.response_to != request_id {
            return Err(Error::invalid_response(format!(
                "expected a reply to request {request_id}, got a reply to request {}",
                reply.response_to
            )));
        }
        if reply.flags.contains(MessageFlags::MORE_TO_COME) {
            return Err(Error::invalid_response(
                "the server unexpectedly set the moreToCome flag on a reply",
            ));
        }

        Ok(RawCommandResponse::new(self.address.clone(), reply))
    }

    /// Sends a command and returns an error if the server reports that it failed.
    pub(crate) async fn send_command(&mut self, command: Command) -> Result<RawCommandResponse> {
        let response = self.send_message(command).await?;
        response.validate()?;
        Ok(response)
    }

    /// Sends a command, reauthenticating and retrying once if the server reports that the
    /// connection's authentication has expired.
    pub(crate) async fn run_command(&mut self, command: Command) -> Result<RawCommandResponse> {
        match self.send_command(command.clone()).await {
            Err(error) if error.is_reauthentication_required() && self.is_authenticated() => {
                self.reauthenticate().await?;
                self.send_command(command).await
            }
            result => result,
        }
    }

    /// Reauthenticates this connection with the mechanism it was originally authenticated with.
    pub async fn reauthenticate(&mut self) -> Result<()> {
        let Some(mut auth_context) = self.auth_context.take() else {
            return Err(Error::invalid_argument(
                "cannot reauthenticate a connection that was never authenticated",
            ));
        };

        let provider = auth_context.mechanism().map(AuthMechanism::provider);
        let result = match provider {
            Some(provider) => provider.reauth(self, &mut auth_context).await,
            None => Err(Error::internal(
                "authenticated connection has no resolved mechanism",
            )),
        };
        self.auth_context = Some(auth_context);

        result
    }
}
