pub(crate) mod util;

pub(crate) use self::util::{mock_connection, mock_stream, sasl_reply};
