//! Contains the types needed to configure connections and bulk writes.
//!
//! Most of the options structs in this module use the
//! [`typed-builder`](https://crates.io/crates/typed-builder) crate to derive a type-safe builder
//! API on them. For example, to create a [`Credential`] for SCRAM authentication:
//!
//! ```rust
//! # use mongo_bulk_auth::options::{AuthMechanism, Credential};
//! #
//! let credential = Credential::builder()
//!     .username("user".to_string())
//!     .password("pencil".to_string())
//!     .mechanism(AuthMechanism::ScramSha256)
//!     .build();
//! ```

pub use crate::{
    bulk::{BulkWriteOptions, UpdateModifications, WriteModel},
    client::{
        auth::{oidc, AuthMechanism, Credential},
        options::{ClientOptions, ServerAddress},
    },
    concern::{Acknowledgment, WriteConcern},
};
