use std::time::Duration;

use crate::{
    bson::Document,
    error::Error,
    options::ServerAddress,
    trace::{serialize_command_or_reply, TracingRepresentation, COMMAND_TRACING_EVENT_TARGET},
};

use super::DEFAULT_MAX_DOCUMENT_LENGTH_BYTES;

/// Emits the started/succeeded/failed tracing events for the commands run on one connection.
#[derive(Clone, Debug)]
pub(crate) struct CommandTracingEventEmitter {
    max_document_length_bytes: usize,
    driver_connection_id: u32,
    address: ServerAddress,
}

impl CommandTracingEventEmitter {
    pub(crate) fn new(
        max_document_length_bytes: Option<usize>,
        driver_connection_id: u32,
        address: ServerAddress,
    ) -> CommandTracingEventEmitter {
        CommandTracingEventEmitter {
            max_document_length_bytes: max_document_length_bytes
                .unwrap_or(DEFAULT_MAX_DOCUMENT_LENGTH_BYTES),
            driver_connection_id,
            address,
        }
    }

    pub(crate) fn started(
        &self,
        command: Document,
        database_name: &str,
        command_name: &str,
        request_id: i32,
    ) {
        tracing::debug!(
            target: COMMAND_TRACING_EVENT_TARGET,
            command = serialize_command_or_reply(command, self.max_document_length_bytes),
            databaseName = database_name,
            commandName = command_name,
            requestId = request_id,
            driverConnectionId = self.driver_connection_id,
            serverHost = self.address.host(),
            serverPort = self.address.port_or_default(),
            "Command started"
        );
    }

    pub(crate) fn succeeded(
        &self,
        reply: Document,
        command_name: &str,
        request_id: i32,
        duration: Duration,
    ) {
        tracing::debug!(
            target: COMMAND_TRACING_EVENT_TARGET,
            reply = serialize_command_or_reply(reply, self.max_document_length_bytes),
            commandName = command_name,
            requestId = request_id,
            driverConnectionId = self.driver_connection_id,
            serverHost = self.address.host(),
            serverPort = self.address.port_or_default(),
            durationMS = duration.as_millis(),
            "Command succeeded"
        );
    }

    pub(crate) fn failed(
        &self,
        failure: &Error,
        command_name: &str,
        request_id: i32,
        duration: Duration,
    ) {
        tracing::debug!(
            target: COMMAND_TRACING_EVENT_TARGET,
            failure = failure.tracing_representation(),
            commandName = command_name,
            requestId = request_id,
            driverConnectionId = self.driver_connection_id,
            serverHost = self.address.host(),
            serverPort = self.address.port_or_default(),
            durationMS = duration.as_millis(),
            "Command failed"
        );
    }
}
