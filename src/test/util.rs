use std::sync::{Arc, Mutex};

use tokio::{
    io::{duplex, DuplexStream},
    task::JoinHandle,
};

use crate::{
    bson::{doc, spec::BinarySubtype, Binary, Document, RawDocumentBuf},
    cmap::{
        conn::wire::{Message, MessageFlags},
        Connection,
        StreamDescription,
    },
    options::ServerAddress,
};

const MOCK_STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Spawns an in-memory server that answers every command it receives with `handler`. The returned
/// handle resolves to the commands the server received once the client side is dropped.
pub(crate) fn mock_stream<F>(handler: F) -> (DuplexStream, JoinHandle<Vec<Document>>)
where
    F: FnMut(Document) -> Document + Send + 'static,
{
    let (client, server) = duplex(MOCK_STREAM_BUFFER_SIZE);
    let handle = tokio::spawn(serve(server, handler));
    (client, handle)
}

/// A handshaked, unauthenticated connection to a mock server.
pub(crate) fn mock_connection<F>(handler: F) -> (Connection, JoinHandle<Vec<Document>>)
where
    F: FnMut(Document) -> Document + Send + 'static,
{
    let (stream, handle) = mock_stream(handler);
    let mut conn = Connection::new(ServerAddress::default(), stream, None);
    conn.stream_description = Some(StreamDescription::new_testing());
    (conn, handle)
}

async fn serve<F>(mut stream: DuplexStream, mut handler: F) -> Vec<Document>
where
    F: FnMut(Document) -> Document,
{
    let mut received = Vec::new();
    while let Ok(request) = Message::read_from(&mut stream, None).await {
        let command = request.get_command_document();
        let reply = handler(command.clone());
        received.push(command);

        let Ok(document_payload) = RawDocumentBuf::from_document(&reply) else {
            break;
        };
        let message = Message {
            document_payload,
            document_sequences: Vec::new(),
            response_to: request.request_id.unwrap_or_default(),
            flags: MessageFlags::empty(),
            checksum: None,
            request_id: None,
        };
        if message.write_to(&mut stream).await.is_err() {
            break;
        }
    }
    received
}

/// A `saslStart`/`saslContinue` reply carrying `payload`.
pub(crate) fn sasl_reply(conversation_id: i32, done: bool, payload: impl Into<Vec<u8>>) -> Document {
    doc! {
        "conversationId": conversation_id,
        "done": done,
        "payload": Binary { subtype: BinarySubtype::Generic, bytes: payload.into() },
        "ok": 1,
    }
}

/// Collects values from inside mock server handlers.
#[derive(Clone, Debug, Default)]
pub(crate) struct Recorder<T> {
    values: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone> Recorder<T> {
    pub(crate) fn record(&self, value: T) {
        self.values.lock().unwrap().push(value);
    }

    pub(crate) fn values(&self) -> Vec<T> {
        self.values.lock().unwrap().clone()
    }
}
