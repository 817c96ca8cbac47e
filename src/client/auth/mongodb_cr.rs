use futures_util::FutureExt;
use hmac::digest::Digest;
use md5::Md5;
use serde::Deserialize;

use crate::{
    bson::{doc, Document},
    client::auth::{sasl::validate_command_success, AuthContext, AuthProvider, Credential},
    cmap::{Command, Connection},
    error::{Error, Result},
    BoxFuture,
};

const MECHANISM: &str = "MONGODB-CR";

/// Authenticates with the legacy nonce and MD5 challenge-response exchange.
pub(crate) struct MongoDbCrProvider;

impl AuthProvider for MongoDbCrProvider {
    fn auth<'a>(
        &'a self,
        conn: &'a mut Connection,
        ctx: &'a mut AuthContext,
    ) -> BoxFuture<'a, Result<()>> {
        authenticate_stream(conn, &ctx.credential).boxed()
    }
}

#[derive(Deserialize)]
struct GetNonceReply {
    nonce: String,
}

async fn authenticate_stream(conn: &mut Connection, credential: &Credential) -> Result<()> {
    let username = credential
        .username
        .as_deref()
        .ok_or_else(|| Error::authentication_error(MECHANISM, "no username supplied"))?;
    let password = credential
        .password
        .as_deref()
        .ok_or_else(|| Error::authentication_error(MECHANISM, "no password supplied"))?;
    let source = credential.resolved_source();

    let response = conn
        .send_message(Command::new("getnonce", source, doc! { "getnonce": 1 }))
        .await?;
    let body: Document = response.auth_response_body(MECHANISM)?;
    validate_command_success(MECHANISM, &body)?;
    let GetNonceReply { nonce } = crate::bson::from_document(body)
        .map_err(|_| Error::invalid_authentication_response(MECHANISM))?;

    let authenticate = doc! {
        "authenticate": 1,
        "user": username,
        "nonce": nonce.as_str(),
        "key": key(&nonce, username, password),
    };
    let response = conn
        .send_message(Command::new("authenticate", source, authenticate))
        .await?;
    let body: Document = response.auth_response_body(MECHANISM)?;
    validate_command_success(MECHANISM, &body)
}

fn md5_hex(input: &str) -> String {
    let mut md5 = Md5::new();
    md5.update(input);
    hex::encode(md5.finalize())
}

/// `md5(nonce + username + md5(username + ":mongo:" + password))`, hex encoded.
fn key(nonce: &str, username: &str, password: &str) -> String {
    let digest = md5_hex(&format!("{username}:mongo:{password}"));
    md5_hex(&format!("{nonce}{username}{digest}"))
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    #[test]
    fn md5_is_lowercase_hex() {
        assert_eq!(super::md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn key_depends_on_nonce() {
        let first = super::key("2375531c32080ae8", "user", "pencil");
        assert_eq!(first.len(), 32);
        assert_eq!(first, super::key("2375531c32080ae8", "user", "pencil"));
        assert_ne!(first, super::key("0000000000000000", "user", "pencil"));

        let expected = super::md5_hex(&format!(
            "2375531c32080ae8user{}",
            super::md5_hex("user:mongo:pencil")
        ));
        assert_eq!(first, expected);
    }
}
