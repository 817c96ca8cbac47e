pub(crate) mod conn;
pub(crate) mod establish;

pub use self::conn::{Connection, ServerType, StreamDescription};
pub(crate) use self::conn::{
    Command,
    RawCommandResponse,
    DEFAULT_MAX_BSON_OBJECT_SIZE,
    DEFAULT_MAX_MESSAGE_SIZE_BYTES,
    DEFAULT_MAX_WRITE_BATCH_SIZE,
};
