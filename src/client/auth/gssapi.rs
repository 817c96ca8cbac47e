use cross_krb5::{ClientCtx, InitiateFlags, K5Ctx, PendingClientCtx, Step};
use futures_util::FutureExt;

use crate::{
    bson::Bson,
    client::auth::{
        sasl::{SaslContinue, SaslResponse, SaslStart},
        AuthContext,
        AuthMechanism,
        AuthProvider,
        Credential,
        GSSAPI_STR,
    },
    cmap::Connection,
    error::{Error, Result},
    BoxFuture,
};

const SERVICE_NAME: &str = "SERVICE_NAME";
const CANONICALIZE_HOST_NAME: &str = "CANONICALIZE_HOST_NAME";
const SERVICE_REALM: &str = "SERVICE_REALM";
const SERVICE_HOST: &str = "SERVICE_HOST";

const MAX_STEPS: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct GssapiProperties {
    pub(crate) service_name: String,
    pub(crate) service_realm: Option<String>,
    pub(crate) service_host: Option<String>,
}

/// Authenticates with Kerberos through the system GSSAPI library.
pub(crate) struct GssapiProvider;

impl AuthProvider for GssapiProvider {
    fn auth<'a>(
        &'a self,
        conn: &'a mut Connection,
        ctx: &'a mut AuthContext,
    ) -> BoxFuture<'a, Result<()>> {
        authenticate_stream(conn, &ctx.credential).boxed()
    }
}

async fn authenticate_stream(conn: &mut Connection, credential: &Credential) -> Result<()> {
    let properties = GssapiProperties::from_credential(credential)?;

    let hostname = properties
        .service_host
        .clone()
        .unwrap_or_else(|| conn.address.host().to_string());

    let user_principal = credential.username.clone();
    let (mut authenticator, initial_token) =
        GssapiAuthenticator::init(user_principal, &properties, &hostname)?;

    let source = credential.source.as_deref().unwrap_or("$external");

    let command = SaslStart::new(source.to_string(), AuthMechanism::Gssapi, initial_token)
        .into_command();

    let response_doc = conn.send_message(command).await?;
    let sasl_response =
        SaslResponse::parse(GSSAPI_STR, response_doc.auth_response_body(GSSAPI_STR)?)?;

    let mut conversation_id = sasl_response.conversation_id;
    let mut payload = sasl_response.payload;

    for _ in 0..MAX_STEPS {
        let output_token = authenticator.step(payload.as_slice())?;

        // An established context may have no final token; the server still expects a
        // saslContinue.
        let token = output_token.unwrap_or_default();
        let command = SaslContinue::new(source.to_string(), conversation_id, token).into_command();

        let response_doc = conn.send_message(command).await?;
        let sasl_response =
            SaslResponse::parse(GSSAPI_STR, response_doc.auth_response_body(GSSAPI_STR)?)?;

        conversation_id = sasl_response.conversation_id;
        payload = sasl_response.payload;

        if sasl_response.done {
            return Ok(());
        }

        if authenticator.is_complete() {
            break;
        }
    }

    let output_token = authenticator.do_unwrap_wrap(payload.as_slice())?;
    let command =
        SaslContinue::new(source.to_string(), conversation_id, output_token).into_command();

    let response_doc = conn.send_message(command).await?;
    let sasl_response =
        SaslResponse::parse(GSSAPI_STR, response_doc.auth_response_body(GSSAPI_STR)?)?;

    if sasl_response.done {
        Ok(())
    } else {
        Err(Error::authentication_error(
            GSSAPI_STR,
            &format!("GSSAPI authentication failed after {MAX_STEPS} attempts"),
        ))
    }
}

impl GssapiProperties {
    pub(crate) fn from_credential(credential: &Credential) -> Result<Self> {
        let mut properties = GssapiProperties {
            service_name: "mongodb".to_string(),
            service_realm: None,
            service_host: None,
        };

        if let Some(mechanism_properties) = &credential.mechanism_properties {
            if let Some(Bson::String(name)) = mechanism_properties.get(SERVICE_NAME) {
                properties.service_name = name.clone();
            }

            match mechanism_properties.get(CANONICALIZE_HOST_NAME) {
                None | Some(Bson::Boolean(false)) => {}
                Some(Bson::String(s)) if s == "none" || s == "false" => {}
                Some(other) => {
                    return Err(Error::authentication_error(
                        GSSAPI_STR,
                        &format!(
                            "unsupported CANONICALIZE_HOST_NAME value: {other}. Host name \
                             canonicalization is not supported; use SERVICE_HOST to name the \
                             service host"
                        ),
                    ))
                }
            }

            if let Some(Bson::String(realm)) = mechanism_properties.get(SERVICE_REALM) {
                properties.service_realm = Some(realm.clone());
            }

            if let Some(Bson::String(host)) = mechanism_properties.get(SERVICE_HOST) {
                properties.service_host = Some(host.clone());
            }
        }

        Ok(properties)
    }
}

struct GssapiAuthenticator {
    pending_ctx: Option<PendingClientCtx>,
    established_ctx: Option<ClientCtx>,
    user_principal: Option<String>,
    is_complete: bool,
}

impl GssapiAuthenticator {
    /// Creates the pending client context and the initial token to send to the server.
    fn init(
        user_principal: Option<String>,
        properties: &GssapiProperties,
        hostname: &str,
    ) -> Result<(Self, Vec<u8>)> {
        let service_name: &str = properties.service_name.as_ref();
        let mut service_principal = format!("{service_name}/{hostname}");
        if let Some(service_realm) = properties.service_realm.as_ref() {
            service_principal = format!("{service_principal}@{service_realm}");
        } else if let Some(user_principal) = user_principal.as_ref() {
            if let Some(idx) = user_principal.find('@') {
                // `realm` keeps its leading '@'.
                let (_, realm) = user_principal.split_at(idx);
                service_principal = format!("{service_principal}{realm}");
            }
        }

        let (pending_ctx, initial_token) = ClientCtx::new(
            InitiateFlags::empty(),
            user_principal.as_deref(),
            &service_principal,
            None, // No channel bindings
        )
        .map_err(|e| {
            Error::authentication_error(
                GSSAPI_STR,
                &format!("Failed to initialize GSSAPI context: {e}"),
            )
        })?;

        Ok((
            Self {
                pending_ctx: Some(pending_ctx),
                established_ctx: None,
                user_principal,
                is_complete: false,
            },
            initial_token.to_vec(),
        ))
    }

    /// Feeds a server challenge to the client context, returning the next token for the server.
    /// Once the context is established the returned token may be absent.
    fn step(&mut self, challenge: &[u8]) -> Result<Option<Vec<u8>>> {
        if challenge.is_empty() {
            Err(Error::authentication_error(
                GSSAPI_STR,
                "Expected challenge data for GSSAPI continuation",
            ))
        } else if let Some(pending_ctx) = self.pending_ctx.take() {
            match pending_ctx.step(challenge).map_err(|e| {
                Error::authentication_error(GSSAPI_STR, &format!("GSSAPI step failed: {e}"))
            })? {
                Step::Finished((ctx, token)) => {
                    self.is_complete = true;
                    self.established_ctx = Some(ctx);
                    Ok(token.map(|t| t.to_vec()))
                }
                Step::Continue((ctx, token)) => {
                    self.pending_ctx = Some(ctx);
                    Ok(Some(token.to_vec()))
                }
            }
        } else {
            Err(Error::authentication_error(
                GSSAPI_STR,
                "Authentication context not initialized",
            ))
        }
    }

    /// Unwraps the final server challenge and wraps the security layer bytes followed by the
    /// user principal.
    fn do_unwrap_wrap(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        if let Some(mut established_ctx) = self.established_ctx.take() {
            let _ = established_ctx.unwrap(payload).map_err(|e| {
                Error::authentication_error(GSSAPI_STR, &format!("GSSAPI unwrap failed: {e}"))
            })?;

            if let Some(user_principal) = self.user_principal.take() {
                let bytes: &[u8] = &[0x1, 0x0, 0x0, 0x0];
                let bytes = [bytes, user_principal.as_bytes()].concat();
                let output_token = established_ctx.wrap(false, bytes.as_slice()).map_err(|e| {
                    Error::authentication_error(GSSAPI_STR, &format!("GSSAPI wrap failed: {e}"))
                })?;
                Ok(output_token.to_vec())
            } else {
                Err(Error::authentication_error(
                    GSSAPI_STR,
                    "User principal not specified",
                ))
            }
        } else {
            Err(Error::authentication_error(
                GSSAPI_STR,
                "Authentication context not established",
            ))
        }
    }

    fn is_complete(&self) -> bool {
        self.is_complete
    }
}
