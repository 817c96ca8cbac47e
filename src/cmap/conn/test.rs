use pretty_assertions::assert_eq;
use tokio::io::duplex;

use super::{
    wire::{Message, MessageFlags},
    Command,
    Connection,
};
use crate::{
    bson::{doc, rawdoc, Bson, RawDocumentBuf},
    client::auth::{AuthContext, AuthMechanism, Credential},
    error::ErrorKind,
    options::ServerAddress,
    test::{mock_connection, sasl_reply},
};

fn ping() -> Command {
    Command::new("ping", "admin", doc! { "ping": 1 })
}

fn find() -> Command {
    Command::new("find", "db", doc! { "find": "coll" })
}

#[tokio::test]
async fn command_failure() {
    let (mut conn, _handle) =
        mock_connection(|_| doc! { "ok": 0, "code": 11600, "errmsg": "interrupted" });

    let response = conn.send_message(ping()).await.unwrap();
    assert!(!response.is_success());

    let error = conn.send_command(ping()).await.unwrap_err();
    assert_eq!(error.code(), Some(11600));
    assert!(error.server_response().is_some());
}

#[tokio::test]
async fn document_sequences_reach_the_server() {
    let (mut conn, handle) = mock_connection(|_| doc! { "ok": 1, "n": 2 });

    let mut insert = Command::new("insert", "db", doc! { "insert": "coll" });
    insert.add_document_sequence("documents", vec![rawdoc! { "x": 1 }, rawdoc! { "x": 2 }]);
    let response = conn.send_command(insert).await.unwrap();
    assert_eq!(response.to_document().unwrap().get_i32("n"), Ok(2));
    drop(conn);

    let commands = handle.await.unwrap();
    assert_eq!(
        commands[0],
        doc! {
            "insert": "coll",
            "$db": "db",
            "documents": [{ "x": 1 }, { "x": 2 }],
        }
    );
}

#[tokio::test]
async fn mismatched_response_to() {
    let (client, mut server) = duplex(1024);
    tokio::spawn(async move {
        let request = Message::read_from(&mut server, None).await.unwrap();
        let reply = Message {
            document_payload: RawDocumentBuf::from_document(&doc! { "ok": 1 }).unwrap(),
            document_sequences: Vec::new(),
            response_to: request.request_id.unwrap_or_default().wrapping_add(1),
            flags: MessageFlags::empty(),
            checksum: None,
            request_id: None,
        };
        reply.write_to(&mut server).await.unwrap();
        server
    });

    let mut conn = Connection::new(ServerAddress::default(), client, None);
    let error = conn.send_message(ping()).await.unwrap_err();
    assert!(error.to_string().contains("expected a reply to request"));
}

#[tokio::test]
async fn closed_stream() {
    let (client, server) = duplex(1024);
    drop(server);

    let mut conn = Connection::new(ServerAddress::default(), client, None);
    let error = conn.send_message(ping()).await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Io(..)));
}

fn plain_context() -> AuthContext {
    let mut ctx = AuthContext::new(
        Credential::builder()
            .username("user".to_string())
            .password("pencil".to_string())
            .mechanism(AuthMechanism::Plain)
            .build(),
    );
    ctx.mechanism = Some(AuthMechanism::Plain);
    ctx
}

fn expiring_server() -> impl FnMut(crate::bson::Document) -> crate::bson::Document {
    let mut expired = false;
    move |command| {
        if command.contains_key("saslStart") {
            sasl_reply(1, true, Vec::new())
        } else if !expired {
            expired = true;
            doc! { "ok": 0, "code": 391, "errmsg": "reauthentication required" }
        } else {
            doc! { "ok": 1, "cursor": { "id": 0_i64, "ns": "db.coll", "firstBatch": [] } }
        }
    }
}

#[tokio::test]
async fn run_command_reauthenticates() {
    let (mut conn, handle) = mock_connection(expiring_server());
    conn.auth_context = Some(plain_context());

    conn.run_command(find()).await.unwrap();
    assert!(conn.is_authenticated());
    drop(conn);

    let names: Vec<_> = handle
        .await
        .unwrap()
        .iter()
        .filter_map(|command| command.keys().next().cloned())
        .collect();
    assert_eq!(names, vec!["find", "saslStart", "find"]);
}

#[tokio::test]
async fn run_command_unauthenticated() {
    let (mut conn, handle) = mock_connection(expiring_server());

    let error = conn.run_command(find()).await.unwrap_err();
    assert!(error.is_reauthentication_required());
    drop(conn);

    assert_eq!(handle.await.unwrap().len(), 1);
}

#[tokio::test]
async fn reauthenticate_requires_authentication() {
    let (mut conn, _handle) = mock_connection(|_| doc! { "ok": 1 });

    let error = conn.reauthenticate().await.unwrap_err();
    assert!(error.is_invalid_argument());
}

#[tokio::test]
async fn failed_reauthentication_keeps_context() {
    let (mut conn, _handle) = mock_connection(|command| {
        if command.contains_key("saslStart") {
            doc! { "ok": 0, "code": 18, "errmsg": "Authentication failed." }
        } else {
            doc! { "ok": 0, "code": 391, "errmsg": "reauthentication required" }
        }
    });
    conn.auth_context = Some(plain_context());

    let error = conn.run_command(find()).await.unwrap_err();
    assert!(error.is_auth_error());
    assert!(conn.is_authenticated());
    assert_eq!(
        conn.auth_context
            .as_ref()
            .map(AuthContext::is_reauthenticating),
        Some(false)
    );
}

#[test]
fn sensitive_commands_are_redacted() {
    assert!(Command::new("saslStart", "admin", doc! { "saslStart": 1 }).should_redact());
    assert!(Command::new(
        "isMaster",
        "admin",
        doc! { "isMaster": 1, "speculativeAuthenticate": {} }
    )
    .should_redact());
    assert!(!Command::new("isMaster", "admin", doc! { "isMaster": 1 }).should_redact());
    assert!(!ping().should_redact());
    assert_eq!(ping().body.get("ping"), Some(&Bson::Int32(1)));
}
