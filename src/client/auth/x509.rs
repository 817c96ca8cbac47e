use futures_util::FutureExt;

use crate::{
    bson::{doc, Document},
    client::auth::{self, AuthContext, AuthProvider, Credential},
    cmap::{Command, Connection},
    error::{Error, Result},
    BoxFuture,
};

/// Authenticates with the client certificate presented when the connection was opened.
pub(crate) struct X509Provider;

impl AuthProvider for X509Provider {
    fn prepare(&self, handshake: &mut Document, ctx: &mut AuthContext) -> Result<()> {
        let mut body = build_client_first(&ctx.credential).body;
        body.insert("db", "$external");
        handshake.insert("speculativeAuthenticate", body);
        ctx.client_first = Some(auth::ClientFirst::X509);

        Ok(())
    }

    fn auth<'a>(
        &'a self,
        conn: &'a mut Connection,
        ctx: &'a mut AuthContext,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let server_first = match ctx.first_round.take() {
                Some(auth::FirstRound::X509(server_first)) => Some(server_first),
                _ => None,
            };
            authenticate_stream(conn, &ctx.credential, server_first).await
        }
        .boxed()
    }
}

/// Constructs the first client message in the X.509 handshake.
pub(crate) fn build_client_first(credential: &Credential) -> Command {
    let mut auth_command_doc = doc! {
        "authenticate": 1,
        "mechanism": "MONGODB-X509",
    };

    if let Some(ref username) = credential.username {
        auth_command_doc.insert("user", username);
    }

    Command::new("authenticate", "$external", auth_command_doc)
}

/// Performs X.509 authentication for a given stream.
async fn authenticate_stream(
    conn: &mut Connection,
    credential: &Credential,
    server_first: Option<Document>,
) -> Result<()> {
    let server_response = match server_first {
        Some(server_first) => server_first,
        None => {
            let response = conn.send_message(build_client_first(credential)).await?;
            let body: Document = response.auth_response_body("MONGODB-X509")?;
            super::sasl::validate_command_success("MONGODB-X509", &body)?;
            body
        }
    };

    if server_response.get_str("dbname") != Ok("$external") {
        return Err(Error::authentication_error(
            "MONGODB-X509",
            "Authentication failed",
        ));
    }

    Ok(())
}
