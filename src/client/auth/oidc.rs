//! Contains the types needed to configure MONGODB-OIDC authentication.

use std::{
    sync::{Arc, LazyLock},
    time::Duration,
};

use futures_util::FutureExt;
use serde::Deserialize;
use tokio::sync::RwLock;
use typed_builder::TypedBuilder;

use crate::{
    bson::{rawdoc, Document},
    client::auth::{
        self,
        sasl::{SaslContinue, SaslResponse, SaslStart},
        AuthContext,
        AuthMechanism,
        AuthProvider,
        Credential,
        MONGODB_OIDC_STR,
    },
    cmap::{Command, Connection},
    error::{Error, Result},
    BoxFuture,
};

const ENVIRONMENT_PROP: &str = "ENVIRONMENT";
const TEST_ENVIRONMENT: &str = "test";
const TOKEN_FILE_ENV_VAR: &str = "OIDC_TOKEN_FILE";
const API_VERSION: u32 = 1;
const MACHINE_CALLBACK_TIMEOUT: Duration = Duration::from_secs(60);
const HUMAN_CALLBACK_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const MIN_CALL_SPACING: Duration = Duration::from_millis(100);

static TEST_ENVIRONMENT_CALLBACK: LazyLock<Callback> = LazyLock::new(|| {
    Callback::machine(|_| {
        async move {
            let path = std::env::var(TOKEN_FILE_ENV_VAR).map_err(|_| {
                auth_error(format!("{TOKEN_FILE_ENV_VAR} must be set in the test environment"))
            })?;
            let token = tokio::fs::read_to_string(&path).await.map_err(|e| {
                auth_error(format!("failed to read the token file {path}: {e}"))
            })?;
            Ok(IdpServerResponse::builder()
                .access_token(token.trim())
                .build())
        }
        .boxed()
    })
});

type CallbackFn =
    dyn Fn(CallbackContext) -> BoxFuture<'static, Result<IdpServerResponse>> + Send + Sync;

#[derive(Clone, Copy, Debug, PartialEq)]
enum CallbackKind {
    Machine,
    Human,
}

impl CallbackKind {
    fn timeout(self) -> Duration {
        match self {
            Self::Machine => MACHINE_CALLBACK_TIMEOUT,
            Self::Human => HUMAN_CALLBACK_TIMEOUT,
        }
    }
}

/// A user-supplied function that produces OIDC access tokens, along with the tokens it has
/// produced so far.
///
/// Clones share the same token cache, so every connection authenticated with one credential
/// reuses the same tokens.
#[derive(Clone)]
pub struct Callback {
    kind: CallbackKind,
    f: Arc<CallbackFn>,
    cache: Arc<RwLock<Cache>>,
}

impl Callback {
    /// Create a new instance with a human token request callback.
    ///
    /// Human callbacks are given the identity provider information returned by the server and
    /// may be given a refresh token from a previous call.
    pub fn human<F>(callback: F) -> Callback
    where
        F: Fn(CallbackContext) -> BoxFuture<'static, Result<IdpServerResponse>>
            + Send
            + Sync
            + 'static,
    {
        Self::new(CallbackKind::Human, callback)
    }

    /// Create a new instance with a machine token request callback.
    pub fn machine<F>(callback: F) -> Callback
    where
        F: Fn(CallbackContext) -> BoxFuture<'static, Result<IdpServerResponse>>
            + Send
            + Sync
            + 'static,
    {
        Self::new(CallbackKind::Machine, callback)
    }

    fn new<F>(kind: CallbackKind, callback: F) -> Callback
    where
        F: Fn(CallbackContext) -> BoxFuture<'static, Result<IdpServerResponse>>
            + Send
            + Sync
            + 'static,
    {
        Callback {
            kind,
            f: Arc::new(callback),
            cache: Arc::new(RwLock::new(Cache::default())),
        }
    }

    async fn access_token(&self) -> Option<String> {
        self.cache.read().await.access_token.clone()
    }

    async fn invalidate(&self, access_token: &str) {
        let mut cache = self.cache.write().await;
        if cache.access_token.as_deref() == Some(access_token) {
            cache.access_token = None;
        }
    }

    async fn invalidate_current(&self) {
        self.cache.write().await.access_token = None;
    }

    async fn clear_refresh_token(&self) {
        self.cache.write().await.refresh_token = None;
    }

    /// Calls the user's function for a new access token and stores the result in the cache.
    ///
    /// The cache lock is held for the whole call, so at most one call is in flight per callback.
    async fn fetch(
        &self,
        username: Option<&str>,
        idp_info: Option<IdpServerInfo>,
        refresh_token: Option<String>,
    ) -> Result<String> {
        let mut cache = self.cache.write().await;

        if let Some(last_call_time) = cache.last_call_time {
            let elapsed = last_call_time.elapsed();
            if elapsed < MIN_CALL_SPACING {
                tokio::time::sleep(MIN_CALL_SPACING - elapsed).await;
            }
        }

        let timeout = self.kind.timeout();
        let context = CallbackContext {
            timeout: Some(std::time::Instant::now() + timeout),
            version: API_VERSION,
            refresh_token,
            idp_info: idp_info.clone(),
            username: username.map(String::from),
        };

        cache.last_call_time = Some(tokio::time::Instant::now());
        let response = tokio::time::timeout(timeout, (*self.f)(context))
            .await
            .map_err(|_| auth_error("the token callback timed out"))??;

        cache.access_token = Some(response.access_token.clone());
        cache.refresh_token = response.refresh_token;
        if idp_info.is_some() {
            cache.idp_info = idp_info;
        }

        Ok(response.access_token)
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callback")
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Debug, Default)]
struct Cache {
    access_token: Option<String>,
    refresh_token: Option<String>,
    idp_info: Option<IdpServerInfo>,
    last_call_time: Option<tokio::time::Instant>,
}

/// The identity provider information the server returns in a human authentication flow.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct IdpServerInfo {
    /// The URL of the identity provider.
    pub issuer: String,

    /// The client id to request tokens for.
    pub client_id: Option<String>,

    /// The scopes to request.
    pub request_scopes: Option<Vec<String>>,
}

/// The information passed to a token callback.
#[derive(Debug)]
#[non_exhaustive]
pub struct CallbackContext {
    /// The point in time after which the driver stops waiting for the callback.
    pub timeout: Option<std::time::Instant>,

    /// The version of the callback API.
    pub version: u32,

    /// The refresh token returned by a previous call, if any.
    pub refresh_token: Option<String>,

    /// The identity provider information returned by the server, for human callbacks.
    pub idp_info: Option<IdpServerInfo>,

    /// The username from the credential, if any.
    pub username: Option<String>,
}

/// The result of a token callback.
#[derive(Debug, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
#[non_exhaustive]
pub struct IdpServerResponse {
    /// The OIDC access token.
    pub access_token: String,

    /// When the access token expires.
    #[builder(default)]
    pub expires: Option<std::time::Instant>,

    /// A refresh token the next call to a human callback will be given.
    #[builder(default)]
    pub refresh_token: Option<String>,
}

pub(super) fn validate_credential(credential: &Credential) -> Result<()> {
    let environment = credential
        .mechanism_properties
        .as_ref()
        .and_then(|properties| properties.get(ENVIRONMENT_PROP));
    let environment = match environment {
        None => None,
        Some(value) => Some(value.as_str().ok_or_else(|| {
            Error::invalid_argument(format!(
                "{ENVIRONMENT_PROP} must be a string for {MONGODB_OIDC_STR}"
            ))
        })?),
    };

    if credential.password.is_some() {
        return Err(Error::invalid_argument(format!(
            "password must not be set for {MONGODB_OIDC_STR}"
        )));
    }
    if credential.source.as_deref().unwrap_or("$external") != "$external" {
        return Err(Error::invalid_argument(format!(
            "only $external may be specified as an auth source for {MONGODB_OIDC_STR}"
        )));
    }
    if let Some(environment) = environment {
        if credential.username.is_some() {
            return Err(Error::invalid_argument(format!(
                "username and {ENVIRONMENT_PROP} cannot both be set for {MONGODB_OIDC_STR}"
            )));
        }
        if credential.oidc_callback.is_some() {
            return Err(Error::invalid_argument(format!(
                "a callback and {ENVIRONMENT_PROP} cannot both be set for {MONGODB_OIDC_STR}"
            )));
        }
        if environment != TEST_ENVIRONMENT {
            return Err(Error::invalid_argument(format!(
                "unsupported {ENVIRONMENT_PROP} for {MONGODB_OIDC_STR}: {environment}"
            )));
        }
    }

    Ok(())
}

fn resolve_callback(credential: &Credential) -> Result<Callback> {
    if let Some(ref callback) = credential.oidc_callback {
        return Ok(callback.clone());
    }
    let environment = credential
        .mechanism_properties
        .as_ref()
        .and_then(|properties| properties.get_str(ENVIRONMENT_PROP).ok());
    match environment {
        Some(TEST_ENVIRONMENT) => Ok(TEST_ENVIRONMENT_CALLBACK.clone()),
        _ => Err(auth_error("no callbacks supplied")),
    }
}

/// Authenticates with OIDC access tokens obtained from a [`Callback`].
pub(crate) struct OidcProvider;

impl AuthProvider for OidcProvider {
    fn prepare(&self, handshake: &mut Document, ctx: &mut AuthContext) -> Result<()> {
        let Ok(callback) = resolve_callback(&ctx.credential) else {
            return Ok(());
        };
        let access_token = match callback.cache.try_read() {
            Ok(cache) => cache.access_token.clone(),
            Err(_) => None,
        };
        let Some(access_token) = access_token else {
            return Ok(());
        };

        let mut body = one_step_command(&ctx.credential, &access_token).body;
        body.insert("db", "$external");
        handshake.insert("speculativeAuthenticate", body);
        ctx.client_first = Some(auth::ClientFirst::Oidc);

        Ok(())
    }

    fn auth<'a>(
        &'a self,
        conn: &'a mut Connection,
        ctx: &'a mut AuthContext,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let callback = resolve_callback(&ctx.credential)?;

            if let Some(auth::FirstRound::Oidc(server_first)) = ctx.first_round.take() {
                if let Ok(response) = SaslResponse::parse(MONGODB_OIDC_STR, server_first) {
                    if response.done {
                        return Ok(());
                    }
                }
            }

            match callback.kind {
                CallbackKind::Machine => {
                    authenticate_machine(conn, &ctx.credential, &callback).await
                }
                CallbackKind::Human => authenticate_human(conn, &ctx.credential, &callback).await,
            }
        }
        .boxed()
    }

    fn reauth<'a>(
        &'a self,
        conn: &'a mut Connection,
        ctx: &'a mut AuthContext,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            if !ctx.reauthenticating {
                if let Ok(callback) = resolve_callback(&ctx.credential) {
                    callback.invalidate_current().await;
                }
            }
            auth::reauthenticate_guarded(self, conn, ctx).await
        }
        .boxed()
    }
}

/// Tries the cached access token first; if the server rejects it, fetches a new one and tries
/// once more.
async fn authenticate_machine(
    conn: &mut Connection,
    credential: &Credential,
    callback: &Callback,
) -> Result<()> {
    if let Some(access_token) = callback.access_token().await {
        match one_step(conn, credential, &access_token).await {
            Err(error) if error.is_auth_error() => callback.invalidate(&access_token).await,
            result => return result,
        }
    }

    let access_token = callback
        .fetch(credential.username.as_deref(), None, None)
        .await?;
    one_step(conn, credential, &access_token).await
}

async fn authenticate_human(
    conn: &mut Connection,
    credential: &Credential,
    callback: &Callback,
) -> Result<()> {
    if let Some(access_token) = callback.access_token().await {
        match one_step(conn, credential, &access_token).await {
            Err(error) if error.is_auth_error() => callback.invalidate(&access_token).await,
            result => return result,
        }
    }

    let (refresh_token, idp_info) = {
        let cache = callback.cache.read().await;
        (cache.refresh_token.clone(), cache.idp_info.clone())
    };
    if let (Some(refresh_token), Some(idp_info)) = (refresh_token, idp_info) {
        let username = credential.username.as_deref();
        match callback
            .fetch(username, Some(idp_info), Some(refresh_token))
            .await
        {
            Ok(access_token) => match one_step(conn, credential, &access_token).await {
                Err(error) if error.is_auth_error() => {
                    callback.invalidate(&access_token).await;
                    callback.clear_refresh_token().await;
                }
                result => return result,
            },
            Err(_) => callback.clear_refresh_token().await,
        }
    }

    two_step(conn, credential, callback).await
}

fn one_step_command(credential: &Credential, access_token: &str) -> Command {
    SaslStart::new(
        credential.resolved_source().to_string(),
        AuthMechanism::MongoDbOidc,
        rawdoc! { "jwt": access_token }.into_bytes(),
    )
    .into_command()
}

async fn one_step(conn: &mut Connection, credential: &Credential, access_token: &str) -> Result<()> {
    let response = send_sasl_command(conn, one_step_command(credential, access_token)).await?;
    if !response.done {
        return Err(invalid_auth_response());
    }
    Ok(())
}

async fn two_step(conn: &mut Connection, credential: &Credential, callback: &Callback) -> Result<()> {
    let source = credential.resolved_source();
    let mut start_doc = rawdoc! {};
    if let Some(username) = credential.username.as_deref() {
        start_doc.append("n", username);
    }
    let sasl_start = SaslStart::new(
        source.to_string(),
        AuthMechanism::MongoDbOidc,
        start_doc.into_bytes(),
    )
    .into_command();
    let response = send_sasl_command(conn, sasl_start).await?;
    if response.done {
        return Err(invalid_auth_response());
    }

    let idp_info: IdpServerInfo =
        crate::bson::from_slice(&response.payload).map_err(|_| invalid_auth_response())?;
    let access_token = callback
        .fetch(credential.username.as_deref(), Some(idp_info), None)
        .await?;

    let sasl_continue = SaslContinue::new(
        source.to_string(),
        response.conversation_id,
        rawdoc! { "jwt": access_token }.into_bytes(),
    )
    .into_command();
    let response = send_sasl_command(conn, sasl_continue).await?;
    if !response.done {
        return Err(invalid_auth_response());
    }

    Ok(())
}

fn auth_error(s: impl AsRef<str>) -> Error {
    Error::authentication_error(MONGODB_OIDC_STR, s.as_ref())
}

fn invalid_auth_response() -> Error {
    Error::invalid_authentication_response(MONGODB_OIDC_STR)
}

async fn send_sasl_command(conn: &mut Connection, command: Command) -> Result<SaslResponse> {
    let response = conn.send_message(command).await?;
    SaslResponse::parse(
        MONGODB_OIDC_STR,
        response.auth_response_body(MONGODB_OIDC_STR)?,
    )
}
