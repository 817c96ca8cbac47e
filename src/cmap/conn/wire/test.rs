use pretty_assertions::assert_eq;

use super::message::{DocumentSequence, Message, MessageFlags};
use crate::{
    bson::{doc, rawdoc},
    cmap::Command,
};

async fn encode(message: &Message) -> Vec<u8> {
    let mut bytes = Vec::new();
    message.write_to(&mut bytes).await.unwrap();
    bytes
}

#[tokio::test]
async fn document_sequences_survive_framing() {
    let mut command = Command::new("insert", "db", doc! { "insert": "coll", "ordered": true });
    command.add_document_sequence(
        "documents",
        vec![rawdoc! { "_id": 1 }, rawdoc! { "_id": 2, "x": "y" }],
    );
    let message = Message::from_command(command, Some(42)).unwrap();
    let bytes = encode(&message).await;

    assert_eq!(
        i32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize,
        bytes.len()
    );
    assert_eq!(i32::from_le_bytes(bytes[4..8].try_into().unwrap()), 42);
    assert_eq!(i32::from_le_bytes(bytes[12..16].try_into().unwrap()), 2013);

    let decoded = Message::read_from(bytes.as_slice(), None).await.unwrap();
    assert_eq!(decoded.request_id, Some(42));
    assert_eq!(
        decoded.document_payload.to_document().unwrap(),
        doc! { "insert": "coll", "ordered": true, "$db": "db" }
    );
    assert_eq!(
        decoded.document_sequences,
        vec![DocumentSequence {
            identifier: "documents".to_string(),
            documents: vec![rawdoc! { "_id": 1 }, rawdoc! { "_id": 2, "x": "y" }],
        }]
    );
    assert_eq!(
        decoded.get_command_document(),
        doc! {
            "insert": "coll",
            "ordered": true,
            "$db": "db",
            "documents": [{ "_id": 1 }, { "_id": 2, "x": "y" }],
        }
    );
}

#[tokio::test]
async fn checksum_is_skipped() {
    let mut message =
        Message::from_command(Command::new("ping", "admin", doc! { "ping": 1 }), None).unwrap();
    message.flags = MessageFlags::CHECKSUM_PRESENT;
    message.checksum = Some(0xdead_beef);

    let decoded = Message::read_from(encode(&message).await.as_slice(), None)
        .await
        .unwrap();
    assert_eq!(decoded.checksum, Some(0xdead_beef));
    assert_eq!(
        decoded.document_payload.to_document().unwrap(),
        doc! { "ping": 1, "$db": "admin" }
    );
}

#[tokio::test]
async fn oversized_message_rejected() {
    let message =
        Message::from_command(Command::new("ping", "admin", doc! { "ping": 1 }), None).unwrap();
    let bytes = encode(&message).await;
    let error = Message::read_from(bytes.as_slice(), Some(bytes.len() as i32 - 1))
        .await
        .unwrap_err();
    assert!(error.to_string().contains("over maximum"), "{error}");
}

#[tokio::test]
async fn unexpected_op_code_rejected() {
    let message =
        Message::from_command(Command::new("ping", "admin", doc! { "ping": 1 }), None).unwrap();
    let mut bytes = encode(&message).await;
    bytes[12..16].copy_from_slice(&2004i32.to_le_bytes());
    assert!(Message::read_from(bytes.as_slice(), None).await.is_err());

    bytes[12..16].copy_from_slice(&7i32.to_le_bytes());
    assert!(Message::read_from(bytes.as_slice(), None).await.is_err());
}

#[tokio::test]
async fn malformed_sections_rejected() {
    let message =
        Message::from_command(Command::new("ping", "admin", doc! { "ping": 1 }), None).unwrap();
    let bytes = encode(&message).await;

    // Claim two extra bytes in the header and append them: they cannot form a section.
    let mut padded = bytes.clone();
    padded.extend_from_slice(&[0, 0]);
    let length = padded.len() as i32;
    padded[0..4].copy_from_slice(&length.to_le_bytes());
    assert!(Message::read_from(padded.as_slice(), None).await.is_err());

    // A message with no payload type 0 section.
    let mut empty = Vec::new();
    empty.extend_from_slice(&20i32.to_le_bytes());
    empty.extend_from_slice(&1i32.to_le_bytes());
    empty.extend_from_slice(&0i32.to_le_bytes());
    empty.extend_from_slice(&2013i32.to_le_bytes());
    empty.extend_from_slice(&0u32.to_le_bytes());
    assert!(Message::read_from(empty.as_slice(), None).await.is_err());
}
