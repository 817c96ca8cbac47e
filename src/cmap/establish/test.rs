use hmac::{Hmac, Mac};
use pretty_assertions::assert_eq;
use sha2::Sha256;

use super::ConnectionEstablisher;
use crate::{
    base64,
    bson::{doc, Document},
    client::{
        auth::{AuthMechanism, Credential},
        options::{ClientOptions, ServerAddress},
    },
    test::{mock_stream, sasl_reply},
};

const SALT: &[u8] = b"0123456789abcdef";
const ITERATIONS: u32 = 4096;

/// The server side of a SCRAM-SHA-256 conversation for a user whose password is "pencil".
#[derive(Default)]
struct ScramServer {
    client_first_bare: String,
    server_first: String,
}

impl ScramServer {
    fn server_first(&mut self, client_first: &[u8]) -> Vec<u8> {
        let client_first = std::str::from_utf8(client_first).unwrap();
        let bare = client_first.strip_prefix("n,,").unwrap();
        let nonce = bare.split(",r=").nth(1).unwrap();

        self.client_first_bare = bare.to_string();
        self.server_first = format!(
            "r={nonce}c2VydmVyIG5vbmNl,s={},i={ITERATIONS}",
            base64::encode(SALT)
        );
        self.server_first.clone().into_bytes()
    }

    fn server_final(&self, client_final: &[u8]) -> Vec<u8> {
        let client_final = std::str::from_utf8(client_final).unwrap();
        let without_proof = client_final.split(",p=").next().unwrap();
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, self.server_first, without_proof
        );

        let mut salted_password = [0u8; 32];
        pbkdf2::pbkdf2::<Hmac<Sha256>>(b"pencil", SALT, ITERATIONS, &mut salted_password)
            .unwrap();
        let server_key = hmac(&salted_password, b"Server Key");
        let server_signature = hmac(&server_key, auth_message.as_bytes());

        format!("v={}", base64::encode(server_signature)).into_bytes()
    }
}

fn hmac(key: &[u8], input: &[u8]) -> Vec<u8> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).unwrap();
    mac.update(input);
    mac.finalize().into_bytes().to_vec()
}

fn payload(command: &Document) -> Vec<u8> {
    command.get_binary_generic("payload").unwrap().clone()
}

fn establisher(credential: Option<Credential>) -> ConnectionEstablisher {
    ConnectionEstablisher::new(&ClientOptions::builder().credential(credential).build())
}

fn scram_credential() -> Credential {
    Credential::builder()
        .username("user".to_string())
        .password("pencil".to_string())
        .source("admin".to_string())
        .build()
}

#[tokio::test]
async fn speculative_scram_sha_256() {
    let mut server = ScramServer::default();
    let (stream, handle) = mock_stream(move |command| {
        if let Ok(speculative) = command.get_document("speculativeAuthenticate") {
            let server_first = server.server_first(&payload(speculative));
            doc! {
                "ok": 1,
                "isWritablePrimary": true,
                "maxWireVersion": 21,
                "speculativeAuthenticate": sasl_reply(1, false, server_first),
            }
        } else {
            sasl_reply(1, true, server.server_final(&payload(&command)))
        }
    });

    let conn = establisher(Some(scram_credential()))
        .establish_stream(ServerAddress::default(), stream)
        .await
        .unwrap();
    assert!(conn.is_authenticated());
    assert_eq!(
        conn.auth_context.as_ref().and_then(|ctx| ctx.mechanism()),
        Some(&AuthMechanism::ScramSha256)
    );
    assert_eq!(conn.stream_description().unwrap().max_wire_version, Some(21));
    drop(conn);

    let commands = handle.await.unwrap();
    assert_eq!(commands.len(), 2);
    assert_eq!(commands[0].get_str("saslSupportedMechs"), Ok("admin.user"));
    assert_eq!(commands[0].get_str("$db"), Ok("admin"));
    assert!(commands[1].contains_key("saslContinue"));
}

#[tokio::test]
async fn scram_without_speculative_reply() {
    let mut server = ScramServer::default();
    let (stream, handle) = mock_stream(move |command| {
        if command.contains_key("isMaster") {
            doc! { "ok": 1, "isWritablePrimary": true, "saslSupportedMechs": ["SCRAM-SHA-256"] }
        } else if command.contains_key("saslStart") {
            sasl_reply(2, false, server.server_first(&payload(&command)))
        } else {
            sasl_reply(2, true, server.server_final(&payload(&command)))
        }
    });

    let conn = establisher(Some(scram_credential()))
        .establish_stream(ServerAddress::default(), stream)
        .await
        .unwrap();
    assert!(conn.is_authenticated());
    drop(conn);

    let commands = handle.await.unwrap();
    let names: Vec<_> = commands
        .iter()
        .filter_map(|command| command.keys().next().cloned())
        .collect();
    assert_eq!(names, vec!["isMaster", "saslStart", "saslContinue"]);
    assert_eq!(commands[1].get_str("mechanism"), Ok("SCRAM-SHA-256"));
    assert_eq!(
        commands[1].get_document("options"),
        Ok(&doc! { "skipEmptyExchange": true })
    );
}

#[tokio::test]
async fn negotiates_scram_sha_1() {
    let (stream, handle) = mock_stream(|command| {
        if command.contains_key("isMaster") {
            doc! { "ok": 1, "saslSupportedMechs": ["SCRAM-SHA-1"] }
        } else {
            doc! { "ok": 0, "code": 18, "errmsg": "Authentication failed." }
        }
    });

    let error = establisher(Some(scram_credential()))
        .establish_stream(ServerAddress::default(), stream)
        .await
        .unwrap_err();
    assert!(error.is_auth_error());

    let commands = handle.await.unwrap();
    assert_eq!(commands.len(), 2);
    assert_eq!(commands[1].get_str("mechanism"), Ok("SCRAM-SHA-1"));
}

#[tokio::test]
async fn mismatched_speculative_nonce_rejected() {
    let (stream, handle) = mock_stream(|_| {
        doc! {
            "ok": 1,
            "speculativeAuthenticate": sasl_reply(1, false, "r=notmynonce,s=c2FsdA==,i=4096"),
        }
    });

    let error = establisher(Some(scram_credential()))
        .establish_stream(ServerAddress::default(), stream)
        .await
        .unwrap_err();
    assert!(error.to_string().contains("mismatched nonce"));
    assert_eq!(handle.await.unwrap().len(), 1);
}

#[tokio::test]
async fn arbiters_are_not_authenticated() {
    let (stream, handle) = mock_stream(|_| {
        doc! { "ok": 1, "setName": "rs", "arbiterOnly": true }
    });

    let conn = establisher(Some(scram_credential()))
        .establish_stream(ServerAddress::default(), stream)
        .await
        .unwrap();
    assert!(!conn.is_authenticated());
    drop(conn);

    assert_eq!(handle.await.unwrap().len(), 1);
}

#[tokio::test]
async fn speculative_x509() {
    let (stream, handle) = mock_stream(|_| {
        doc! {
            "ok": 1,
            "speculativeAuthenticate": { "dbname": "$external", "user": "CN=client" },
        }
    });

    let credential = Credential::builder()
        .mechanism(AuthMechanism::MongoDbX509)
        .build();
    let conn = establisher(Some(credential))
        .establish_stream(ServerAddress::default(), stream)
        .await
        .unwrap();
    assert!(conn.is_authenticated());
    drop(conn);

    let commands = handle.await.unwrap();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].get_str("$db"), Ok("$external"));
}

#[tokio::test]
async fn no_credential() {
    let (stream, handle) = mock_stream(|_| doc! { "ok": 1, "helloOk": true });

    let conn = establisher(None)
        .establish_stream(ServerAddress::default(), stream)
        .await
        .unwrap();
    assert!(!conn.is_authenticated());
    assert!(conn.stream_description().unwrap().hello_ok);
    drop(conn);

    let commands = handle.await.unwrap();
    assert_eq!(commands.len(), 1);
    assert!(!commands[0].contains_key("speculativeAuthenticate"));
    assert!(!commands[0].contains_key("saslSupportedMechs"));
}

#[tokio::test]
async fn invalid_credential_fails_before_handshake() {
    let (stream, handle) = mock_stream(|_| doc! { "ok": 1, "helloOk": true });

    let credential = Credential::builder()
        .mechanism(AuthMechanism::MongoDbX509)
        .password("pencil".to_string())
        .build();
    let error = establisher(Some(credential))
        .establish_stream(ServerAddress::default(), stream)
        .await
        .unwrap_err();
    assert!(error.is_invalid_argument());

    assert!(handle.await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_handshake() {
    let (stream, _handle) = mock_stream(|_| doc! { "ok": 0, "code": 8000, "errmsg": "nope" });

    let error = establisher(None)
        .establish_stream(ServerAddress::default(), stream)
        .await
        .unwrap_err();
    assert_eq!(error.code(), Some(8000));
}
