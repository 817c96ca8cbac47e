//! Write concerns sent with each bulk write batch.

#[cfg(test)]
mod test;

use std::time::Duration;

use serde::{de, ser, Deserialize, Deserializer, Serialize, Serializer};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{
    error::{Error, Result},
    serde_util,
};

/// The acknowledgement a write waits for before the server replies.
///
/// A write concern with no fields set leaves the choice to the server and is omitted from
/// commands.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder, Serialize, Deserialize)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct WriteConcern {
    /// How many members, or which tagged set of members, must apply the write.
    pub w: Option<Acknowledgment>,

    /// How long the server waits for `w` to be satisfied before reporting a write concern
    /// error. Writes already applied are not undone when this expires.
    #[serde(rename = "wtimeout", alias = "wtimeoutMS")]
    #[serde(serialize_with = "serde_util::serialize_duration_option_as_int_millis")]
    #[serde(deserialize_with = "serde_util::deserialize_duration_option_from_u64_millis")]
    #[serde(default)]
    pub w_timeout: Option<Duration>,

    /// Whether the write must reach the on-disk journal.
    #[serde(rename = "j", alias = "journal")]
    pub journal: Option<bool>,
}

/// The `w` field of a [`WriteConcern`].
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Acknowledgment {
    /// A number of members. `Nodes(0)` asks for no acknowledgement at all, which bulk writes
    /// reject.
    Nodes(u32),

    /// A majority of the voting members.
    Majority,

    /// A custom write concern defined by the replica set's tag configuration.
    Custom(String),
}

/// The wire form of `w`: either a count or a name.
#[derive(Deserialize, Serialize)]
#[serde(untagged)]
enum WireAcknowledgment {
    Count(i32),
    Name(String),
}

impl Serialize for Acknowledgment {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let wire = match self {
            Self::Nodes(n) => WireAcknowledgment::Count(
                i32::try_from(*n).map_err(|_| ser::Error::custom("w exceeds i32::MAX"))?,
            ),
            Self::Majority => WireAcknowledgment::Name("majority".to_string()),
            Self::Custom(name) => WireAcknowledgment::Name(name.clone()),
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Acknowledgment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match WireAcknowledgment::deserialize(deserializer)? {
            WireAcknowledgment::Count(n) => u32::try_from(n)
                .map(Self::Nodes)
                .map_err(|_| de::Error::custom(format!("w must be non-negative, got {n}"))),
            WireAcknowledgment::Name(name) => Ok(name.into()),
        }
    }
}

impl From<u32> for Acknowledgment {
    fn from(n: u32) -> Self {
        Self::Nodes(n)
    }
}

impl From<String> for Acknowledgment {
    fn from(name: String) -> Self {
        match name.as_str() {
            "majority" => Self::Majority,
            _ => Self::Custom(name),
        }
    }
}

impl From<&str> for Acknowledgment {
    fn from(name: &str) -> Self {
        name.to_string().into()
    }
}

impl From<Acknowledgment> for WriteConcern {
    fn from(w: Acknowledgment) -> Self {
        Self {
            w: Some(w),
            ..Default::default()
        }
    }
}

impl WriteConcern {
    /// Waits for `n` members.
    pub fn nodes(n: u32) -> Self {
        Acknowledgment::Nodes(n).into()
    }

    /// Waits for a majority of members.
    pub fn majority() -> Self {
        Acknowledgment::Majority.into()
    }

    /// Waits for the tagged write concern `name`.
    pub fn custom(name: impl AsRef<str>) -> Self {
        Acknowledgment::from(name.as_ref()).into()
    }

    /// Whether the server replies only after applying the write. `j: true` forces a reply even
    /// with `w: 0`.
    pub(crate) fn is_acknowledged(&self) -> bool {
        self.journal == Some(true) || self.w != Some(Acknowledgment::Nodes(0))
    }

    pub(crate) fn is_empty(&self) -> bool {
        matches!(
            self,
            Self {
                w: None,
                w_timeout: None,
                journal: None
            }
        )
    }

    /// Rejects the contradictory combination of `w: 0` and `j: true`.
    pub(crate) fn validate(&self) -> Result<()> {
        match (&self.w, self.journal) {
            (Some(Acknowledgment::Nodes(0)), Some(true)) => Err(Error::invalid_argument(
                "write concern cannot have w=0 and j=true",
            )),
            _ => Ok(()),
        }
    }
}
