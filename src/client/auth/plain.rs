use futures_util::FutureExt;

use crate::{
    client::auth::{
        sasl::{SaslResponse, SaslStart},
        AuthContext,
        AuthMechanism,
        AuthProvider,
        Credential,
    },
    cmap::Connection,
    error::{Error, Result},
    BoxFuture,
};

/// Authenticates with the SASL PLAIN mechanism (LDAP proxy authentication).
pub(crate) struct PlainProvider;

impl AuthProvider for PlainProvider {
    fn auth<'a>(
        &'a self,
        conn: &'a mut Connection,
        ctx: &'a mut AuthContext,
    ) -> BoxFuture<'a, Result<()>> {
        authenticate_stream(conn, &ctx.credential).boxed()
    }
}

async fn authenticate_stream(conn: &mut Connection, credential: &Credential) -> Result<()> {
    let source = credential.source.as_deref().unwrap_or("$external");
    let username = credential
        .username
        .as_ref()
        .ok_or_else(|| Error::authentication_error("PLAIN", "no username supplied"))?;

    let password = credential
        .password
        .as_ref()
        .ok_or_else(|| Error::authentication_error("PLAIN", "no password supplied"))?;

    let sasl_start = SaslStart::new(
        source.into(),
        AuthMechanism::Plain,
        payload_bytes(username, password),
    )
    .into_command();

    let response = conn.send_message(sasl_start).await?;
    let sasl_response = SaslResponse::parse("PLAIN", response.auth_response_body("PLAIN")?)?;

    if !sasl_response.done {
        return Err(Error::invalid_authentication_response("PLAIN"));
    }

    Ok(())
}

pub(super) fn payload_bytes(username: &str, password: &str) -> Vec<u8> {
    let mut bytes = Vec::new();

    bytes.push(0);
    bytes.extend(username.as_bytes());

    bytes.push(0);
    bytes.extend(password.as_bytes());

    bytes
}
