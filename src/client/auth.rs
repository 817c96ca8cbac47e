//! Contains the types needed to authenticate a [`Connection`].

#[cfg(feature = "aws-auth")]
mod aws;
#[cfg(all(feature = "gssapi-auth", not(windows)))]
mod gssapi;
mod mongodb_cr;
pub mod oidc;
mod plain;
mod sasl;
mod scram;
mod x509;

use std::{fmt::Debug, str::FromStr};

use derive_where::derive_where;
use futures_util::FutureExt;
use hmac::{digest::KeyInit, Mac};
use rand::Rng;
use typed_builder::TypedBuilder;

use self::scram::ScramVersion;
use crate::{
    base64,
    bson::Document,
    cmap::{Connection, StreamDescription},
    error::{Error, ErrorKind, Result},
    trace::CONNECTION_TRACING_EVENT_TARGET,
    BoxFuture,
};

const SCRAM_SHA_1_STR: &str = "SCRAM-SHA-1";
const SCRAM_SHA_256_STR: &str = "SCRAM-SHA-256";
const MONGODB_CR_STR: &str = "MONGODB-CR";
const GSSAPI_STR: &str = "GSSAPI";
const MONGODB_AWS_STR: &str = "MONGODB-AWS";
const MONGODB_X509_STR: &str = "MONGODB-X509";
const PLAIN_STR: &str = "PLAIN";
const MONGODB_OIDC_STR: &str = "MONGODB-OIDC";

/// The authentication mechanisms supported by MongoDB.
#[derive(Clone, PartialEq, Debug)]
#[non_exhaustive]
pub enum AuthMechanism {
    /// MongoDB Challenge Response nonce and MD5 based authentication system. It is deprecated
    /// and only kept for servers that predate SCRAM.
    MongoDbCr,

    /// The SCRAM-SHA-1 mechanism as defined in [RFC 5802](http://tools.ietf.org/html/rfc5802).
    ///
    /// See the [MongoDB documentation](https://www.mongodb.com/docs/manual/core/security-scram/) for more information.
    ScramSha1,

    /// The SCRAM-SHA-256 mechanism which extends [RFC 5802](http://tools.ietf.org/html/rfc5802) and is formally defined in [RFC 7677](https://tools.ietf.org/html/rfc7677).
    ///
    /// See the [MongoDB documentation](https://www.mongodb.com/docs/manual/core/security-scram/) for more information.
    ScramSha256,

    /// The MONGODB-X509 mechanism based on the usage of X.509 certificates to validate a client
    /// where the distinguished subject name of the client certificate acts as the username.
    ///
    /// See the [MongoDB documentation](https://www.mongodb.com/docs/manual/core/security-x.509/) for more information.
    MongoDbX509,

    /// Kerberos authentication mechanism as defined in [RFC 4752](http://tools.ietf.org/html/rfc4752).
    ///
    /// See the [MongoDB documentation](https://www.mongodb.com/docs/manual/core/kerberos/) for more information.
    #[cfg(all(feature = "gssapi-auth", not(windows)))]
    Gssapi,

    /// The SASL PLAIN mechanism, as defined in [RFC 4616](), is used in MongoDB to perform LDAP
    /// authentication and cannot be used for any other type of authentication.
    /// Since the credentials are stored outside of MongoDB, the "$external" database must be used
    /// for authentication.
    ///
    /// See the [MongoDB documentation](https://www.mongodb.com/docs/manual/core/security-ldap/#ldap-proxy-authentication) for more information on LDAP authentication.
    Plain,

    /// MONGODB-AWS authenticates using AWS IAM credentials (an access key ID and a secret access
    /// key), taken either from the credential or from the `AWS_ACCESS_KEY_ID`,
    /// `AWS_SECRET_ACCESS_KEY` and `AWS_SESSION_TOKEN` environment variables.
    #[cfg(feature = "aws-auth")]
    MongoDbAws,

    /// MONGODB-OIDC authenticates using [OpenID Connect](https://openid.net/developers/specs/) access tokens.
    MongoDbOidc,
}

impl AuthMechanism {
    fn from_scram_version(scram: &ScramVersion) -> Self {
        match scram {
            ScramVersion::Sha1 => Self::ScramSha1,
            ScramVersion::Sha256 => Self::ScramSha256,
        }
    }

    /// Chooses the mechanism for a credential that doesn't name one: SCRAM-SHA-256 if the server
    /// lists it for the user, SCRAM-SHA-1 otherwise.
    pub(crate) fn from_stream_description(description: &StreamDescription) -> AuthMechanism {
        let scram_sha_256_found = description
            .sasl_supported_mechs
            .as_ref()
            .map(|ms| ms.iter().any(|m| m == AuthMechanism::ScramSha256.as_str()))
            .unwrap_or(false);

        if scram_sha_256_found {
            AuthMechanism::ScramSha256
        } else {
            AuthMechanism::ScramSha1
        }
    }

    /// Determines if the provided credentials have the required information to perform
    /// authentication.
    pub fn validate_credential(&self, credential: &Credential) -> Result<()> {
        match self {
            AuthMechanism::ScramSha1 | AuthMechanism::ScramSha256 => {
                if credential.username.is_none() {
                    return Err(Error::invalid_argument(
                        "No username provided for SCRAM authentication",
                    ));
                };
                if credential.mechanism_properties.is_some() {
                    return Err(Error::invalid_argument(
                        "mechanism properties MUST NOT be specified for SCRAM authentication",
                    ));
                }
                Ok(())
            }
            AuthMechanism::MongoDbX509 => {
                if credential.password.is_some() {
                    return Err(Error::invalid_argument(
                        "A password cannot be specified with MONGODB-X509",
                    ));
                }

                if credential.source.as_deref().unwrap_or("$external") != "$external" {
                    return Err(Error::invalid_argument(
                        "only $external may be specified as an auth source for MONGODB-X509",
                    ));
                }

                Ok(())
            }
            AuthMechanism::Plain => {
                match credential.username.as_deref() {
                    None => {
                        return Err(Error::invalid_argument(
                            "No username provided for PLAIN authentication",
                        ))
                    }
                    Some("") => {
                        return Err(Error::invalid_argument(
                            "Username for PLAIN authentication must be non-empty",
                        ))
                    }
                    Some(_) => {}
                }

                match credential.password.as_deref() {
                    None => Err(Error::invalid_argument(
                        "No password provided for PLAIN authentication",
                    )),
                    Some("") => Err(Error::invalid_argument(
                        "Password for PLAIN authentication must be non-empty",
                    )),
                    Some(_) => Ok(()),
                }
            }
            AuthMechanism::MongoDbCr => {
                if credential.username.is_none() || credential.password.is_none() {
                    return Err(Error::invalid_argument(
                        "MONGODB-CR authentication requires a username and a password",
                    ));
                }
                Ok(())
            }
            #[cfg(all(feature = "gssapi-auth", not(windows)))]
            AuthMechanism::Gssapi => {
                if credential.username.is_none() {
                    return Err(Error::invalid_argument(
                        "No username provided for GSSAPI authentication",
                    ));
                }
                if credential.source.as_deref().unwrap_or("$external") != "$external" {
                    return Err(Error::invalid_argument(
                        "only $external may be specified as an auth source for GSSAPI",
                    ));
                }
                Ok(())
            }
            #[cfg(feature = "aws-auth")]
            AuthMechanism::MongoDbAws => {
                if credential.username.is_some() && credential.password.is_none() {
                    return Err(Error::invalid_argument(
                        "Username cannot be provided without password for MONGODB-AWS \
                         authentication",
                    ));
                }
                if credential.username.is_none() && credential.password.is_some() {
                    return Err(Error::invalid_argument(
                        "Password cannot be provided without username for MONGODB-AWS \
                         authentication",
                    ));
                }
                if credential.source.as_deref().unwrap_or("$external") != "$external" {
                    return Err(Error::invalid_argument(
                        "only $external may be specified as an auth source for MONGODB-AWS",
                    ));
                }
                Ok(())
            }
            AuthMechanism::MongoDbOidc => oidc::validate_credential(credential),
        }
    }

    /// Returns this `AuthMechanism` as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMechanism::ScramSha1 => SCRAM_SHA_1_STR,
            AuthMechanism::ScramSha256 => SCRAM_SHA_256_STR,
            AuthMechanism::MongoDbCr => MONGODB_CR_STR,
            AuthMechanism::MongoDbX509 => MONGODB_X509_STR,
            #[cfg(all(feature = "gssapi-auth", not(windows)))]
            AuthMechanism::Gssapi => GSSAPI_STR,
            AuthMechanism::Plain => PLAIN_STR,
            #[cfg(feature = "aws-auth")]
            AuthMechanism::MongoDbAws => MONGODB_AWS_STR,
            AuthMechanism::MongoDbOidc => MONGODB_OIDC_STR,
        }
    }

    /// Get the default authSource for a given mechanism depending on the database provided in the
    /// connection string.
    pub(crate) fn default_source<'a>(&'a self, uri_db: Option<&'a str>) -> &'a str {
        match self {
            AuthMechanism::ScramSha1 | AuthMechanism::ScramSha256 | AuthMechanism::MongoDbCr => {
                uri_db.unwrap_or("admin")
            }
            AuthMechanism::MongoDbX509 => "$external",
            AuthMechanism::Plain => uri_db.unwrap_or("$external"),
            AuthMechanism::MongoDbOidc => "$external",
            #[cfg(feature = "aws-auth")]
            AuthMechanism::MongoDbAws => "$external",
            #[cfg(all(feature = "gssapi-auth", not(windows)))]
            AuthMechanism::Gssapi => "$external",
        }
    }

    /// The provider that authenticates connections with this mechanism.
    pub fn provider(&self) -> &'static dyn AuthProvider {
        match self {
            AuthMechanism::ScramSha1 => &ScramVersion::Sha1,
            AuthMechanism::ScramSha256 => &ScramVersion::Sha256,
            AuthMechanism::MongoDbCr => &mongodb_cr::MongoDbCrProvider,
            AuthMechanism::MongoDbX509 => &x509::X509Provider,
            AuthMechanism::Plain => &plain::PlainProvider,
            AuthMechanism::MongoDbOidc => &oidc::OidcProvider,
            #[cfg(feature = "aws-auth")]
            AuthMechanism::MongoDbAws => &aws::AwsProvider,
            #[cfg(all(feature = "gssapi-auth", not(windows)))]
            AuthMechanism::Gssapi => &gssapi::GssapiProvider,
        }
    }
}

impl FromStr for AuthMechanism {
    type Err = Error;

    fn from_str(str: &str) -> Result<Self> {
        match str {
            SCRAM_SHA_1_STR => Ok(AuthMechanism::ScramSha1),
            SCRAM_SHA_256_STR => Ok(AuthMechanism::ScramSha256),
            MONGODB_CR_STR => Ok(AuthMechanism::MongoDbCr),
            MONGODB_X509_STR => Ok(AuthMechanism::MongoDbX509),
            PLAIN_STR => Ok(AuthMechanism::Plain),
            MONGODB_OIDC_STR => Ok(AuthMechanism::MongoDbOidc),
            #[cfg(all(feature = "gssapi-auth", not(windows)))]
            GSSAPI_STR => Ok(AuthMechanism::Gssapi),
            #[cfg(not(all(feature = "gssapi-auth", not(windows))))]
            GSSAPI_STR => Err(Error::invalid_argument(
                "GSSAPI auth is only supported with the gssapi-auth feature flag on non-Windows \
                 platforms",
            )),
            #[cfg(feature = "aws-auth")]
            MONGODB_AWS_STR => Ok(AuthMechanism::MongoDbAws),
            #[cfg(not(feature = "aws-auth"))]
            MONGODB_AWS_STR => Err(Error::invalid_argument(
                "MONGODB-AWS auth is only supported with the aws-auth feature flag",
            )),

            _ => Err(Error::invalid_argument(format!(
                "invalid mechanism string: {str}"
            ))),
        }
    }
}

/// A struct containing authentication information.
///
/// Some fields (mechanism and source) may be omitted and will either be negotiated or assigned a
/// default value, depending on the values of other fields in the credential.
#[derive(Clone, Default, TypedBuilder)]
#[derive_where(PartialEq)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct Credential {
    /// The username to authenticate with. This applies to all mechanisms but may be omitted when
    /// authenticating via MONGODB-X509.
    pub username: Option<String>,

    /// The database used to authenticate. This applies to all mechanisms and defaults to "admin"
    /// in SCRAM authentication mechanisms, "$external" for GSSAPI and MONGODB-X509, and the
    /// database name or "$external" for PLAIN.
    pub source: Option<String>,

    /// The password to authenticate with. This does not apply to all mechanisms.
    pub password: Option<String>,

    /// Which authentication mechanism to use. If not provided, one will be negotiated with the
    /// server.
    pub mechanism: Option<AuthMechanism>,

    /// Additional properties for the given mechanism.
    pub mechanism_properties: Option<Document>,

    /// The token callback for MONGODB-OIDC authentication, along with the tokens it has
    /// produced. Clones of a credential share the same token cache.
    #[derive_where(skip)]
    pub oidc_callback: Option<oidc::Callback>,
}

impl Credential {
    /// The database this credential authenticates against.
    pub(crate) fn resolved_source(&self) -> &str {
        self.source.as_deref().unwrap_or_else(|| {
            self.mechanism
                .as_ref()
                .map(|m| m.default_source(None))
                .unwrap_or("admin")
        })
    }

    /// If the mechanism is missing, append the appropriate mechanism negotiation key-value-pair to
    /// the provided hello or legacy hello command document.
    pub(crate) fn append_needed_mechanism_negotiation(&self, command: &mut Document) {
        if let (Some(username), None) = (self.username.as_ref(), self.mechanism.as_ref()) {
            command.insert(
                "saslSupportedMechs",
                format!("{}.{}", self.resolved_source(), username),
            );
        }
    }
}

impl Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Credential")
            .field(&"REDACTED".to_string())
            .finish()
    }
}

/// The authentication state of a single connection.
///
/// A context is created when a connection attempt starts. It carries the first step of
/// speculative authentication from the handshake to the authentication exchange, and is kept on
/// the connection afterwards so the connection can be reauthenticated.
#[derive(Debug)]
pub struct AuthContext {
    pub(crate) credential: Credential,

    /// The mechanism the connection was authenticated with, once known.
    pub(crate) mechanism: Option<AuthMechanism>,

    /// The mechanism assumed when the speculative first message was built.
    pub(crate) speculative_mechanism: Option<AuthMechanism>,

    /// The speculative first message embedded in the handshake.
    pub(crate) client_first: Option<ClientFirst>,

    /// The speculative first message together with the server's reply to it.
    pub(crate) first_round: Option<FirstRound>,

    pub(crate) reauthenticating: bool,
}

impl AuthContext {
    /// Creates the context for a new connection attempt with the given credential.
    pub fn new(credential: Credential) -> Self {
        Self {
            credential,
            mechanism: None,
            speculative_mechanism: None,
            client_first: None,
            first_round: None,
            reauthenticating: false,
        }
    }

    /// The credential this context authenticates with.
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// The mechanism the connection was authenticated with, if authentication has happened.
    pub fn mechanism(&self) -> Option<&AuthMechanism> {
        self.mechanism.as_ref()
    }

    /// Whether a reauthentication is currently running with this context.
    pub fn is_reauthenticating(&self) -> bool {
        self.reauthenticating
    }

    /// Pairs the speculative first message with the server's reply from the handshake, if the
    /// server sent one.
    pub(crate) fn record_speculative_response(&mut self, server_first: Option<Document>) {
        let client_first = self.client_first.take();
        if let (Some(client_first), Some(server_first)) = (client_first, server_first) {
            self.first_round = Some(client_first.into_first_round(server_first));
        }
    }

    fn clear_handshake_state(&mut self) {
        self.client_first = None;
        self.first_round = None;
        self.speculative_mechanism = None;
    }
}

/// The contract every authentication mechanism implements.
pub trait AuthProvider: Send + Sync {
    /// Adds the first step of authentication to the handshake document, if the mechanism
    /// supports speculative authentication, and records it in the context.
    fn prepare(&self, handshake: &mut Document, ctx: &mut AuthContext) -> Result<()> {
        let _ = (handshake, ctx);
        Ok(())
    }

    /// Authenticates the connection, resuming from the speculative first round in the context if
    /// there is one.
    fn auth<'a>(
        &'a self,
        conn: &'a mut Connection,
        ctx: &'a mut AuthContext,
    ) -> BoxFuture<'a, Result<()>>;

    /// Authenticates an already-authenticated connection again.
    ///
    /// Fails without contacting the server if a reauthentication is already running with the same
    /// context.
    fn reauth<'a>(
        &'a self,
        conn: &'a mut Connection,
        ctx: &'a mut AuthContext,
    ) -> BoxFuture<'a, Result<()>> {
        reauthenticate_guarded(self, conn, ctx).boxed()
    }
}

pub(crate) async fn reauthenticate_guarded<P: AuthProvider + ?Sized>(
    provider: &P,
    conn: &mut Connection,
    ctx: &mut AuthContext,
) -> Result<()> {
    if ctx.reauthenticating {
        return Err(ErrorKind::Authentication {
            message: "Reauthentication already in progress".to_string(),
        }
        .into());
    }

    tracing::debug!(
        target: CONNECTION_TRACING_EVENT_TARGET,
        driverConnectionId = conn.id,
        mechanism = ctx.mechanism.as_ref().map(AuthMechanism::as_str),
        "Reauthenticating connection"
    );

    ctx.reauthenticating = true;
    let result = provider.auth(conn, ctx).await;
    ctx.reauthenticating = false;

    result
}

/// Authenticates a freshly handshaked connection, negotiating a mechanism if the credential
/// doesn't name one.
pub(crate) async fn authenticate_stream(
    conn: &mut Connection,
    ctx: &mut AuthContext,
) -> Result<()> {
    let mechanism = match ctx.credential.mechanism {
        Some(ref mechanism) => mechanism.clone(),
        None => match ctx.speculative_mechanism {
            Some(ref mechanism) if ctx.first_round.is_some() => mechanism.clone(),
            _ => AuthMechanism::from_stream_description(conn.stream_description()?),
        },
    };
    mechanism.validate_credential(&ctx.credential)?;

    tracing::debug!(
        target: CONNECTION_TRACING_EVENT_TARGET,
        driverConnectionId = conn.id,
        mechanism = mechanism.as_str(),
        speculative = ctx.first_round.is_some(),
        "Authenticating connection"
    );

    ctx.mechanism = Some(mechanism.clone());
    let result = mechanism.provider().auth(conn, ctx).await;
    ctx.clear_handshake_state();

    result
}

/// Contains the first client message sent as part of the authentication handshake.
#[derive(Debug)]
pub(crate) enum ClientFirst {
    Scram(ScramVersion, scram::ClientFirst),
    X509,
    Oidc,
}

impl ClientFirst {
    pub(crate) fn into_first_round(self, server_first: Document) -> FirstRound {
        match self {
            Self::Scram(version, client_first) => FirstRound::Scram(
                version,
                scram::FirstRound {
                    client_first,
                    server_first,
                },
            ),
            Self::X509 => FirstRound::X509(server_first),
            Self::Oidc => FirstRound::Oidc(server_first),
        }
    }
}

/// Contains the complete first round of the authentication handshake, including the client message
/// and the server response.
#[derive(Debug)]
pub(crate) enum FirstRound {
    Scram(ScramVersion, scram::FirstRound),
    X509(Document),
    Oidc(Document),
}

pub(crate) fn generate_nonce_bytes() -> [u8; 32] {
    rand::rng().random()
}

pub(crate) fn generate_nonce() -> String {
    let result = generate_nonce_bytes();
    base64::encode(result)
}

fn mac<M: Mac + KeyInit>(
    key: &[u8],
    input: &[u8],
    auth_mechanism: &str,
) -> Result<impl AsRef<[u8]>> {
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|_| Error::unknown_authentication_error(auth_mechanism))?;
    mac.update(input);
    Ok(mac.finalize().into_bytes())
}
