use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

use crate::options::WriteConcern;

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub(crate) fn serialize_duration_option_as_int_millis<S: Serializer>(
    val: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match val {
        Some(duration) if duration.as_millis() > i32::MAX as u128 => {
            serializer.serialize_i64(duration.as_millis() as i64)
        }
        Some(duration) => serializer.serialize_i32(duration.as_millis() as i32),
        None => serializer.serialize_none(),
    }
}

pub(crate) fn deserialize_duration_option_from_u64_millis<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = Option::<u64>::deserialize(deserializer)?;
    Ok(millis.map(Duration::from_millis))
}

pub(crate) fn write_concern_is_empty(write_concern: &Option<WriteConcern>) -> bool {
    write_concern
        .as_ref()
        .is_none_or(|write_concern| write_concern.is_empty())
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};

    use crate::bson::{doc, Bson};

    #[derive(Debug, Deserialize, PartialEq, Serialize)]
    struct Timeout {
        #[serde(
            serialize_with = "super::serialize_duration_option_as_int_millis",
            deserialize_with = "super::deserialize_duration_option_from_u64_millis",
            default
        )]
        timeout: Option<Duration>,
    }

    #[test]
    fn duration_millis() {
        let short = Timeout {
            timeout: Some(Duration::from_millis(1500)),
        };
        let document = crate::bson::to_document(&short).unwrap();
        assert_eq!(document, doc! { "timeout": 1500 });
        assert_eq!(crate::bson::from_document::<Timeout>(document).unwrap(), short);

        let long = Timeout {
            timeout: Some(Duration::from_secs(30 * 24 * 60 * 60)),
        };
        let document = crate::bson::to_document(&long).unwrap();
        assert_eq!(document.get("timeout"), Some(&Bson::Int64(2_592_000_000)));
    }
}
