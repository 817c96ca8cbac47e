
use std::sync::LazyLock;

use crate::{
    bson::{doc, Bson, Document},
    client::{
        auth::{AuthContext, AuthMechanism, Credential},
        options::ClientOptions,
    },
    cmap::{Command, Connection, StreamDescription},
    error::Result,
    hello::{hello_command, run_hello, HelloReply},
};

const DRIVER_NAME: &str = "mongo-bulk-auth";

#[derive(Clone, Debug)]
struct ClientMetadata {
    application: Option<AppMetadata>,
    driver: DriverMetadata,
    os: OsMetadata,
}

#[derive(Clone, Debug)]
struct AppMetadata {
    name: String,
}

#[derive(Clone, Debug)]
struct DriverMetadata {
    name: String,
    version: String,
}

#[derive(Clone, Debug)]
struct OsMetadata {
    os_type: String,
    architecture: String,
}

impl From<ClientMetadata> for Bson {
    fn from(metadata: ClientMetadata) -> Self {
        let mut metadata_doc = Document::new();

        if let Some(application) = metadata.application {
            metadata_doc.insert("application", doc! { "name": application.name });
        }

        metadata_doc.insert(
            "driver",
            doc! {
                "name": metadata.driver.name,
                "version": metadata.driver.version,
            },
        );

        metadata_doc.insert(
            "os",
            doc! {
                "type": metadata.os.os_type,
                "architecture": metadata.os.architecture,
            },
        );

        Bson::Document(metadata_doc)
    }
}

/// Contains the basic handshake information that can be statically determined. This document
/// (potentially with additional fields added) can be cloned and put in the `client` field of
/// the hello command.
static BASE_CLIENT_METADATA: LazyLock<ClientMetadata> = LazyLock::new(|| ClientMetadata {
    application: None,
    driver: DriverMetadata {
        name: DRIVER_NAME.into(),
        version: env!("CARGO_PKG_VERSION").into(),
    },
    os: OsMetadata {
        os_type: std::env::consts::OS.into(),
        architecture: std::env::consts::ARCH.into(),
    },
});

/// Contains the logic needed to handshake a connection.
#[derive(Debug, Clone)]
pub(crate) struct Handshaker {
    /// The hello command to send when handshaking. This will always be identical given the same
    /// options, so it can be created at the time the Handshaker is created.
    command: Command,
}

#[derive(Debug, Default)]
pub(crate) struct HandshakerOptions {
    pub(crate) app_name: Option<String>,
    pub(crate) credential: Option<Credential>,
}

impl From<&ClientOptions> for HandshakerOptions {
    fn from(options: &ClientOptions) -> Self {
        Self {
            app_name: options.app_name.clone(),
            credential: options.credential.clone(),
        }
    }
}

impl Handshaker {
    /// Creates a new Handshaker.
    pub(crate) fn new(options: HandshakerOptions) -> Self {
        let mut metadata = BASE_CLIENT_METADATA.clone();
        let mut command = hello_command(None);

        if let Some(app_name) = options.app_name {
            metadata.application = Some(AppMetadata { name: app_name });
        }

        if let Some(credential) = options.credential {
            credential.append_needed_mechanism_negotiation(&mut command.body);
            command.target_db = credential.resolved_source().to_string();
        }

        command.body.insert("client", metadata);

        Self { command }
    }

    /// Handshakes a connection, embedding the first step of authentication in the hello command
    /// when an auth context is given and its mechanism allows it.
    pub(crate) async fn handshake(
        &self,
        conn: &mut Connection,
        mut auth_context: Option<&mut AuthContext>,
    ) -> Result<HelloReply> {
        let mut command = self.command.clone();

        if let Some(ctx) = auth_context.as_deref_mut() {
            set_speculative_auth_info(&mut command.body, ctx)?;
        }

        let mut hello_reply = run_hello(conn, command).await?;
        conn.stream_description = Some(StreamDescription::from_hello_reply(&hello_reply));

        if let Some(ctx) = auth_context {
            ctx.record_speculative_response(
                hello_reply
                    .command_response
                    .speculative_authenticate
                    .take(),
            );
        }

        Ok(hello_reply)
    }
}

/// Updates the handshake command document with the speculative authentication info.
fn set_speculative_auth_info(command: &mut Document, ctx: &mut AuthContext) -> Result<()> {
    // SCRAM-SHA-256 is assumed when no mechanism is given; servers too old to default to it
    // don't support speculative authentication at all.
    let mechanism = ctx
        .credential
        .mechanism
        .clone()
        .unwrap_or(AuthMechanism::ScramSha256);

    mechanism.provider().prepare(command, ctx)?;
    if ctx.client_first.is_some() {
        ctx.speculative_mechanism = Some(mechanism);
    }

    Ok(())
}
