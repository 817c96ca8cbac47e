use std::io::Read;

use bitflags::bitflags;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    header::{Header, OpCode},
    next_request_id,
    util::{SyncCountReader, SyncLittleEndianRead},
};
use crate::{
    bson::{doc, Array, Document, RawDocumentBuf},
    bson_util,
    cmap::Command,
    error::{Error, ErrorKind, Result},
};

pub(crate) const DEFAULT_MAX_MESSAGE_SIZE_BYTES: i32 = 48 * 1024 * 1024;

/// Represents an OP_MSG wire protocol operation.
#[derive(Debug)]
pub(crate) struct Message {
    // OP_MSG payload type 0
    pub(crate) document_payload: RawDocumentBuf,
    // OP_MSG payload type 1
    pub(crate) document_sequences: Vec<DocumentSequence>,
    pub(crate) response_to: i32,
    pub(crate) flags: MessageFlags,
    pub(crate) checksum: Option<u32>,
    pub(crate) request_id: Option<i32>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DocumentSequence {
    pub(crate) identifier: String,
    pub(crate) documents: Vec<RawDocumentBuf>,
}

impl DocumentSequence {
    /// The number of bytes this sequence occupies in a message, excluding the payload type byte.
    pub(crate) fn len_bytes(&self) -> usize {
        4 + self.identifier.len()
            + 1
            + self
                .documents
                .iter()
                .map(|document| document.as_bytes().len())
                .sum::<usize>()
    }
}

impl Message {
    /// Creates a `Message` from a given `Command`. Note that the `response_to` field must be set
    /// manually.
    pub(crate) fn from_command(command: Command, request_id: Option<i32>) -> Result<Self> {
        let mut body = command.body;
        body.insert("$db", command.target_db);
        let document_payload = RawDocumentBuf::from_document(&body)?;

        Ok(Self {
            document_payload,
            document_sequences: command.document_sequences,
            response_to: 0,
            flags: MessageFlags::empty(),
            checksum: None,
            request_id,
        })
    }

    /// Gets this message's command as a Document, with every document sequence folded in as an
    /// array field. If deserialization fails, returns a document containing the error.
    pub(crate) fn get_command_document(&self) -> Document {
        let mut command = match self.document_payload.to_document() {
            Ok(document) => document,
            Err(error) => return doc! { "serialization error": error.to_string() },
        };

        for document_sequence in &self.document_sequences {
            let mut documents = Array::new();
            for document in &document_sequence.documents {
                match document.to_document() {
                    Ok(document) => documents.push(document.into()),
                    Err(error) => return doc! { "serialization error": error.to_string() },
                }
            }
            command.insert(document_sequence.identifier.clone(), documents);
        }

        command
    }

    /// Reads bytes from `reader` and deserializes them into a Message.
    pub(crate) async fn read_from<T: AsyncRead + Unpin + Send>(
        mut reader: T,
        max_message_size_bytes: Option<i32>,
    ) -> Result<Self> {
        let header = Header::read_from(&mut reader).await?;
        let max_len = max_message_size_bytes.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES);
        if header.length > max_len {
            return Err(ErrorKind::InvalidResponse {
                message: format!("Message length {} over maximum {}", header.length, max_len),
            }
            .into());
        }

        if header.op_code != OpCode::Message {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "Invalid op code, expected {} and got {}",
                    OpCode::Message as u32,
                    header.op_code as u32
                ),
            }
            .into());
        }

        let length_remaining = usize::try_from(header.length)
            .ok()
            .and_then(|length| length.checked_sub(Header::LENGTH))
            .ok_or_else(|| {
                Error::invalid_response(format!("invalid message length: {}", header.length))
            })?;
        let mut buf = vec![0u8; length_remaining];
        reader.read_exact(&mut buf).await?;

        Self::read_op_common(buf.as_slice(), length_remaining, &header)
    }

    fn read_op_common(mut reader: &[u8], length_remaining: usize, header: &Header) -> Result<Self> {
        let flags = MessageFlags::from_bits_truncate(reader.read_u32_sync()?);
        let mut length_remaining = length_remaining
            .checked_sub(std::mem::size_of::<u32>())
            .ok_or_else(|| Error::invalid_response("OP_MSG too short to contain flags"))?;

        let checksum_length = if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            4
        } else {
            0
        };

        let mut count_reader = SyncCountReader::new(&mut reader);
        let mut document_payload = None;
        let mut document_sequences = Vec::new();
        while length_remaining.saturating_sub(count_reader.bytes_read()) > checksum_length {
            let next_section = MessageSection::read(&mut count_reader)?;
            match next_section {
                MessageSection::Document(document) => {
                    if document_payload.is_some() {
                        return Err(ErrorKind::InvalidResponse {
                            message: "an OP_MSG response must contain exactly one payload type 0 \
                                      section"
                                .into(),
                        }
                        .into());
                    } else {
                        document_payload = Some(document);
                    }
                }
                MessageSection::Sequence(document_sequence) => {
                    document_sequences.push(document_sequence)
                }
            }
        }

        let bytes_read = count_reader.bytes_read();
        length_remaining = length_remaining.checked_sub(bytes_read).ok_or_else(|| {
            Error::invalid_response(format!(
                "The server indicated that the reply would be {} bytes long, but it instead was \
                 longer",
                header.length,
            ))
        })?;

        let mut checksum = None;

        if length_remaining == 4 && flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            checksum = Some(reader.read_u32_sync()?);
        } else if length_remaining != 0 {
            return Err(Error::invalid_response(format!(
                "The server indicated that the reply would be {} bytes long, but {} bytes were \
                 left over",
                header.length, length_remaining,
            )));
        }

        Ok(Self {
            response_to: header.response_to,
            flags,
            document_payload: document_payload.ok_or_else(|| ErrorKind::InvalidResponse {
                message: "an OP_MSG response must contain exactly one payload type 0 section"
                    .into(),
            })?,
            document_sequences,
            checksum,
            request_id: Some(header.request_id),
        })
    }

    /// Serializes the Message to bytes and writes them to `writer`.
    pub(crate) async fn write_to<T: AsyncWrite + Send + Unpin>(&self, mut writer: T) -> Result<()> {
        let sections = self.get_sections_bytes()?;

        let total_length = Header::LENGTH
            + std::mem::size_of::<u32>()
            + sections.len()
            + self
                .checksum
                .as_ref()
                .map(std::mem::size_of_val)
                .unwrap_or(0);

        let header = Header {
            length: i32::try_from(total_length).map_err(|_| {
                Error::invalid_argument(format!("message length {total_length} overflows an i32"))
            })?,
            request_id: self.request_id.unwrap_or_else(next_request_id),
            response_to: self.response_to,
            op_code: OpCode::Message,
        };

        header.write_to(&mut writer).await?;
        writer.write_u32_le(self.flags.bits()).await?;
        writer.write_all(&sections).await?;

        if let Some(checksum) = self.checksum {
            writer.write_u32_le(checksum).await?;
        }

        writer.flush().await?;

        Ok(())
    }

    fn get_sections_bytes(&self) -> Result<Vec<u8>> {
        let mut sections = Vec::new();

        // Payload type 0
        sections.push(0);
        sections.extend(self.document_payload.as_bytes());

        for document_sequence in &self.document_sequences {
            // Payload type 1
            sections.push(1);

            let size = i32::try_from(document_sequence.len_bytes()).map_err(|_| {
                Error::invalid_argument(format!(
                    "document sequence \"{}\" is too large",
                    document_sequence.identifier
                ))
            })?;
            sections.extend(size.to_le_bytes());

            sections.extend(document_sequence.identifier.as_bytes());
            sections.push(0);

            for document in &document_sequence.documents {
                sections.extend(document.as_bytes());
            }
        }

        Ok(sections)
    }
}

bitflags! {
    /// The bitwise flags of an OP_MSG.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub(crate) struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}

/// A section of an OP_MSG.
#[derive(Debug)]
enum MessageSection {
    Document(RawDocumentBuf),
    Sequence(DocumentSequence),
}

impl MessageSection {
    /// Reads bytes from `reader` and deserializes them into a MessageSection.
    fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let payload_type = reader.read_u8_sync()?;

        if payload_type == 0 {
            let bytes = bson_util::read_document_bytes(reader)?;
            let document = RawDocumentBuf::from_bytes(bytes)?;
            return Ok(MessageSection::Document(document));
        }

        if payload_type != 1 {
            return Err(Error::invalid_response(format!(
                "invalid OP_MSG payload type: {payload_type}"
            )));
        }

        let size = reader.read_i32_sync()?;
        let (identifier, identifier_length) = reader.read_cstring_sync()?;
        let length_remaining = usize::try_from(size)
            .ok()
            .and_then(|size| size.checked_sub(std::mem::size_of::<i32>() + identifier_length))
            .ok_or_else(|| {
                Error::invalid_response(format!("invalid document sequence size: {size}"))
            })?;

        let mut documents = Vec::new();
        let mut count_reader = SyncCountReader::new(reader);

        while length_remaining > count_reader.bytes_read() {
            let bytes = bson_util::read_document_bytes(&mut count_reader)?;
            let document = RawDocumentBuf::from_bytes(bytes)?;
            documents.push(document);
        }

        if length_remaining != count_reader.bytes_read() {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "The server indicated that the document sequence would be {} bytes long, but \
                     it instead was {}",
                    size,
                    std::mem::size_of::<i32>() + identifier_length + count_reader.bytes_read(),
                ),
            }
            .into());
        }

        Ok(MessageSection::Sequence(DocumentSequence {
            identifier,
            documents,
        }))
    }
}
