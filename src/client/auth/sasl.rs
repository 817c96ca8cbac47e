use serde::Deserialize;

use crate::{
    bson::{doc, spec::BinarySubtype, Binary, Bson, Document},
    bson_util,
    client::auth::AuthMechanism,
    cmap::Command,
    error::{Error, Result},
};

fn payload_binary(bytes: Vec<u8>) -> Binary {
    Binary {
        subtype: BinarySubtype::Generic,
        bytes,
    }
}

/// The first message of a SASL conversation.
pub(super) struct SaslStart {
    source: String,
    mechanism: AuthMechanism,
    payload: Vec<u8>,
}

impl SaslStart {
    pub(super) fn new(source: String, mechanism: AuthMechanism, payload: Vec<u8>) -> Self {
        Self {
            source,
            mechanism,
            payload,
        }
    }

    /// SCRAM conversations ask the server to skip the trailing empty round.
    pub(super) fn into_command(self) -> Command {
        let is_scram = matches!(
            self.mechanism,
            AuthMechanism::ScramSha1 | AuthMechanism::ScramSha256
        );
        let mut body = doc! {
            "saslStart": 1,
            "mechanism": self.mechanism.as_str(),
            "payload": payload_binary(self.payload),
        };
        if is_scram {
            body.insert("options", doc! { "skipEmptyExchange": true });
        }

        Command::new("saslStart", self.source, body)
    }
}

/// A follow-up message in a SASL conversation.
pub(super) struct SaslContinue {
    source: String,
    conversation_id: Bson,
    payload: Vec<u8>,
}

impl SaslContinue {
    pub(super) fn new(source: String, conversation_id: Bson, payload: Vec<u8>) -> Self {
        Self {
            source,
            conversation_id,
            payload,
        }
    }

    pub(super) fn into_command(self) -> Command {
        let body = doc! {
            "saslContinue": 1,
            "conversationId": self.conversation_id,
            "payload": payload_binary(self.payload),
        };

        Command::new("saslContinue", self.source, body)
    }
}

/// Fails with an authentication error carrying the server's `errmsg` if `response` has a
/// non-1 `ok`. A reply without `ok` passes.
pub(super) fn validate_command_success(auth_mechanism: &str, response: &Document) -> Result<()> {
    let Some(ok) = response.get("ok") else {
        return Ok(());
    };

    match bson_util::get_int(ok) {
        Some(1) => Ok(()),
        Some(_) => {
            let reason = response
                .get_str("errmsg")
                .unwrap_or("Authentication failure");
            Err(Error::authentication_error(auth_mechanism, reason))
        }
        None => Err(Error::invalid_authentication_response(auth_mechanism)),
    }
}

/// A server reply within a SASL conversation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SaslResponse {
    pub(super) conversation_id: Bson,
    pub(super) done: bool,
    #[serde(deserialize_with = "deserialize_payload")]
    pub(super) payload: Vec<u8>,
}

fn deserialize_payload<'de, D>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Binary::deserialize(deserializer).map(|binary| binary.bytes)
}

impl SaslResponse {
    pub(super) fn parse(auth_mechanism: &str, response: Document) -> Result<Self> {
        validate_command_success(auth_mechanism, &response)?;
        crate::bson::from_document(response)
            .map_err(|_| Error::invalid_authentication_response(auth_mechanism))
    }
}
