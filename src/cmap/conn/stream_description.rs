use crate::{hello::HelloReply, options::ServerAddress};

pub(crate) const DEFAULT_MAX_BSON_OBJECT_SIZE: i64 = 16 * 1024 * 1024;
pub(crate) const DEFAULT_MAX_WRITE_BATCH_SIZE: i64 = 100_000;
pub(crate) const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i32 = 48_000_000;

/// The possible types for a server, as reported by its handshake reply.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum ServerType {
    /// A single, non-replica set mongod.
    Standalone,

    /// A router used in sharded deployments.
    Mongos,

    /// The primary node in a replica set.
    RsPrimary,

    /// A secondary node in a replica set.
    RsSecondary,

    /// A non-data bearing node in a replica set which can participate in elections.
    RsArbiter,

    /// Hidden, starting up, or recovering nodes in a replica set.
    RsOther,

    /// A member of an uninitialized replica set or a member that has been removed from the
    /// replica set config.
    RsGhost,

    /// A server type that could not be determined.
    #[default]
    Unknown,
}

impl ServerType {
    /// Whether connections to a server of this type are authenticated.
    pub fn can_auth(self) -> bool {
        !matches!(self, ServerType::RsArbiter)
    }
}

/// Contains information about a given server in a format digestible by a connection.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct StreamDescription {
    /// The address of the server.
    pub server_address: ServerAddress,

    /// The type of the server when the handshake occurred.
    pub initial_server_type: ServerType,

    /// The maximum wire version that the server understands.
    pub max_wire_version: Option<i32>,

    /// The minimum wire version that the server understands.
    pub min_wire_version: Option<i32>,

    /// The supported authentication mechanisms that the server understands.
    pub sasl_supported_mechs: Option<Vec<String>>,

    /// The maximum size of writes (excluding command overhead) that should be sent to the server.
    pub max_bson_object_size: i64,

    /// The maximum number of inserts, updates, or deletes that can be included in a write batch.
    /// If more than this number of writes are included, the server cannot guarantee space in the
    /// response document to reply to the batch.
    pub max_write_batch_size: i64,

    /// Whether the server associated with this connection supports the `hello` command.
    pub hello_ok: bool,

    /// The maximum permitted size of a BSON wire protocol message.
    pub max_message_size_bytes: i32,
}

impl Default for StreamDescription {
    fn default() -> Self {
        Self {
            server_address: Default::default(),
            initial_server_type: Default::default(),
            max_wire_version: None,
            min_wire_version: None,
            sasl_supported_mechs: None,
            max_bson_object_size: DEFAULT_MAX_BSON_OBJECT_SIZE,
            max_write_batch_size: DEFAULT_MAX_WRITE_BATCH_SIZE,
            hello_ok: false,
            max_message_size_bytes: DEFAULT_MAX_MESSAGE_SIZE_BYTES,
        }
    }
}

impl StreamDescription {
    /// Constructs a new StreamDescription from a `HelloReply`.
    pub(crate) fn from_hello_reply(reply: &HelloReply) -> Self {
        let response = &reply.command_response;
        Self {
            server_address: reply.server_address.clone(),
            initial_server_type: response.server_type(),
            max_wire_version: response.max_wire_version,
            min_wire_version: response.min_wire_version,
            sasl_supported_mechs: response.sasl_supported_mechs.clone(),
            max_bson_object_size: response
                .max_bson_object_size
                .unwrap_or(DEFAULT_MAX_BSON_OBJECT_SIZE),
            max_write_batch_size: response
                .max_write_batch_size
                .unwrap_or(DEFAULT_MAX_WRITE_BATCH_SIZE),
            hello_ok: response.hello_ok.unwrap_or(false),
            max_message_size_bytes: response
                .max_message_size_bytes
                .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES),
        }
    }

    /// Gets a description of a stream for a 4.2 connection.
    #[cfg(test)]
    pub(crate) fn new_testing() -> Self {
        Self::with_wire_version(8)
    }

    /// Gets a description of a stream for a connection to a server with the provided
    /// maxWireVersion.
    #[cfg(test)]
    pub(crate) fn with_wire_version(max_wire_version: i32) -> Self {
        Self {
            initial_server_type: ServerType::Standalone,
            max_wire_version: Some(max_wire_version),
            min_wire_version: Some(max_wire_version),
            ..Default::default()
        }
    }
}
