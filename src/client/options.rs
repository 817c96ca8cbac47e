#[cfg(test)]
mod test;

use std::{
    collections::HashSet,
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
    sync::LazyLock,
    time::Duration,
};

use serde::{de::Error as SerdeError, Deserialize, Deserializer};
use typed_builder::TypedBuilder;

use crate::{
    bson::Document,
    client::auth::{AuthMechanism, Credential},
    error::{Error, ErrorKind, Result},
};

pub(crate) const DEFAULT_PORT: u16 = 27017;

/// Reserved characters as defined by [Section 2.2 of RFC-3986](https://tools.ietf.org/html/rfc3986#section-2.2).
/// Usernames / passwords that contain these characters must instead include the URL encoded version
/// of them when included as part of the connection string.
static USERINFO_RESERVED_CHARACTERS: LazyLock<HashSet<char>> =
    LazyLock::new(|| [':', '/', '?', '#', '[', ']', '@'].into_iter().collect());

static ILLEGAL_DATABASE_CHARACTERS: LazyLock<HashSet<char>> =
    LazyLock::new(|| ['/', '\\', ' ', '"', '$', '.'].into_iter().collect());

/// An enum representing the address of a MongoDB server.
#[derive(Clone, Debug, Eq)]
#[non_exhaustive]
pub enum ServerAddress {
    /// A TCP/IP host and port combination.
    Tcp {
        /// The hostname or IP address where the MongoDB server can be found.
        host: String,

        /// The TCP port that the MongoDB server is listening on.
        ///
        /// The default is 27017.
        port: Option<u16>,
    },
}

impl<'de> Deserialize<'de> for ServerAddress {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::parse(s.as_str()).map_err(|e| D::Error::custom(format!("{e}")))
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::Tcp {
            host: "localhost".into(),
            port: None,
        }
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.host() == other.host() && self.port_or_default() == other.port_or_default()
    }
}

impl Hash for ServerAddress {
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        self.host().hash(state);
        self.port_or_default().hash(state);
    }
}

impl FromStr for ServerAddress {
    type Err = Error;

    fn from_str(address: &str) -> Result<Self> {
        Self::parse(address)
    }
}

impl ServerAddress {
    /// Parses an address string into a `ServerAddress`.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        let invalid = || Error::invalid_argument(format!("invalid server address: \"{address}\""));

        let (host, port) = match address.split_once(':') {
            Some((host, port)) => {
                let port = u16::from_str(port).map_err(|_| invalid())?;
                if port == 0 {
                    return Err(invalid());
                }
                (host, Some(port))
            }
            None => (address, None),
        };

        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Self::Tcp {
            host: host.to_lowercase(),
            port,
        })
    }

    /// The hostname or IP address of this server.
    pub fn host(&self) -> &str {
        match self {
            Self::Tcp { host, .. } => host.as_str(),
        }
    }

    /// The port of this server, if one was specified.
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp { port, .. } => *port,
        }
    }

    pub(crate) fn port_or_default(&self) -> u16 {
        self.port().unwrap_or(DEFAULT_PORT)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}:{}", self.host(), self.port_or_default())
    }
}

/// Contains the options used to establish authenticated connections.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ClientOptions {
    /// The servers to connect to.
    #[builder(default = vec![ServerAddress::default()])]
    pub hosts: Vec<ServerAddress>,

    /// The application name sent to the server as part of the handshake.
    pub app_name: Option<String>,

    /// The credential used to authenticate each new connection.
    pub credential: Option<Credential>,

    /// The amount of time to wait for a TCP connection to be established before timing out.
    /// A value of zero means no timeout; the default is 10 seconds.
    pub connect_timeout: Option<Duration>,

    /// The database named in the path of the connection string, if any.
    pub default_database: Option<String>,

    /// The maximum number of bytes of a command or reply document that will be included in a
    /// tracing event. Longer documents are truncated. Defaults to 1000.
    pub tracing_max_document_length_bytes: Option<usize>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ClientOptions {
    /// Parses a `mongodb://` connection string into a `ClientOptions`.
    ///
    /// Recognized options are `appName`, `authSource`, `authMechanism`,
    /// `authMechanismProperties` and `connectTimeoutMS`; any other option is ignored.
    pub fn parse(uri: impl AsRef<str>) -> Result<Self> {
        ClientOptionsParser::parse(uri.as_ref()).map(Into::into)
    }
}

#[derive(Debug, Default)]
struct ClientOptionsParser {
    hosts: Vec<ServerAddress>,
    app_name: Option<String>,
    connect_timeout: Option<Duration>,
    credential: Option<Credential>,
    default_database: Option<String>,
    auth_mechanism: Option<AuthMechanism>,
    auth_source: Option<String>,
    auth_mechanism_properties: Option<Document>,
}

impl From<ClientOptionsParser> for ClientOptions {
    fn from(parser: ClientOptionsParser) -> Self {
        Self::builder()
            .hosts(parser.hosts)
            .app_name(parser.app_name)
            .connect_timeout(parser.connect_timeout)
            .credential(parser.credential)
            .default_database(parser.default_database)
            .build()
    }
}

/// Splits a string into a section before a given index and a section exclusively after the index.
/// Empty portions are returned as `None`.
fn exclusive_split_at(s: &str, i: usize) -> (Option<&str>, Option<&str>) {
    let (l, r) = s.split_at(i);

    let lout = if !l.is_empty() { Some(l) } else { None };
    let rout = if r.len() > 1 { Some(&r[1..]) } else { None };

    (lout, rout)
}

fn percent_decode(s: &str, err_message: &str) -> Result<String> {
    match percent_encoding::percent_decode_str(s).decode_utf8() {
        Ok(result) => Ok(result.to_string()),
        Err(_) => Err(Error::invalid_argument(err_message)),
    }
}

fn validate_userinfo(s: &str, userinfo_type: &str) -> Result<()> {
    if s.chars().any(|c| USERINFO_RESERVED_CHARACTERS.contains(&c)) {
        return Err(Error::invalid_argument(format!(
            "{userinfo_type} must be URL encoded"
        )));
    }

    // Every '%' must start a percent-encoded octet.
    if s.split('%').skip(1).any(|part| {
        part.len() < 2 || !part.as_bytes()[..2].iter().all(u8::is_ascii_hexdigit)
    }) {
        return Err(Error::invalid_argument(
            "username/password cannot contain unescaped %",
        ));
    }

    Ok(())
}

impl ClientOptionsParser {
    fn parse(s: &str) -> Result<Self> {
        let Some(end_of_scheme) = s.find("://") else {
            return Err(Error::invalid_argument(
                "connection string contains no scheme",
            ));
        };

        if &s[..end_of_scheme] != "mongodb" {
            return Err(Error::invalid_argument(format!(
                "invalid connection string scheme: {}",
                &s[..end_of_scheme]
            )));
        }

        let after_scheme = &s[end_of_scheme + 3..];

        let (pre_slash, post_slash) = match after_scheme.find('/') {
            Some(slash_index) => match exclusive_split_at(after_scheme, slash_index) {
                (Some(section), o) => (section, o),
                (None, _) => return Err(Error::invalid_argument("missing hosts")),
            },
            None => {
                if after_scheme.contains('?') {
                    return Err(Error::invalid_argument(
                        "Missing delimiting slash between hosts and options",
                    ));
                }
                (after_scheme, None)
            }
        };

        let (database, options_section) = match post_slash {
            Some(section) => match section.find('?') {
                Some(index) => exclusive_split_at(section, index),
                None => (post_slash, None),
            },
            None => (None, None),
        };

        let db = match database {
            Some(db) => {
                let decoded = percent_decode(db, "database name must be URL encoded")?;
                if decoded
                    .chars()
                    .any(|c| ILLEGAL_DATABASE_CHARACTERS.contains(&c))
                {
                    return Err(Error::invalid_argument("illegal character in database name"));
                }
                Some(decoded)
            }
            None => None,
        };

        let (authentication_requested, cred_section, hosts_section) = match pre_slash.rfind('@') {
            Some(index) => {
                // An '@' in the host section is a request for authentication, even if the
                // credentials are empty.
                let (creds, hosts) = exclusive_split_at(pre_slash, index);
                match hosts {
                    Some(hs) => (true, creds, hs),
                    None => return Err(Error::invalid_argument("missing hosts")),
                }
            }
            None => (false, None, pre_slash),
        };

        let (username, password) = match cred_section {
            Some(creds) => match creds.find(':') {
                Some(index) => match exclusive_split_at(creds, index) {
                    (username, None) => (username, Some("")),
                    (username, password) => (username, password),
                },
                None => (Some(creds), None),
            },
            None => (None, None),
        };

        let hosts = hosts_section
            .split(',')
            .map(|host| {
                ServerAddress::parse(host).map_err(|_| {
                    Error::invalid_argument(format!(
                        "invalid host specified in connection string: \"{host}\""
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut options = ClientOptionsParser {
            hosts,
            default_database: db.clone(),
            ..Default::default()
        };

        if let Some(opts) = options_section {
            options.parse_options(opts)?;
        }

        if let Some(u) = username {
            let credential = options.credential.get_or_insert_with(Default::default);
            validate_userinfo(u, "username")?;
            credential.username = Some(percent_decode(u, "username must be URL encoded")?);

            if let Some(pass) = password {
                validate_userinfo(pass, "password")?;
                credential.password = Some(percent_decode(pass, "password must be URL encoded")?);
            }
        }

        if options.auth_source.as_deref() == Some("") {
            return Err(Error::invalid_argument("empty authSource provided"));
        }

        match options.auth_mechanism.take() {
            Some(mechanism) => {
                let credential = options.credential.get_or_insert_with(Default::default);

                credential.source = options
                    .auth_source
                    .clone()
                    .or_else(|| Some(mechanism.default_source(db.as_deref()).into()));
                credential.mechanism_properties = options.auth_mechanism_properties.take();

                mechanism.validate_credential(credential)?;
                credential.mechanism = Some(mechanism);
            }
            None => {
                if let Some(ref mut credential) = options.credential {
                    // Without a mechanism the source is, in order: authSource, the database in
                    // the path, "admin".
                    credential.source = options
                        .auth_source
                        .clone()
                        .or(db)
                        .or_else(|| Some("admin".into()));
                    credential.mechanism_properties = options.auth_mechanism_properties.take();
                } else if authentication_requested {
                    return Err(Error::invalid_argument(
                        "username and mechanism both not provided, but authentication was \
                         requested",
                    ));
                }
            }
        };

        Ok(options)
    }

    fn parse_options(&mut self, options: &str) -> Result<()> {
        if options.is_empty() {
            return Ok(());
        }

        let mut keys: Vec<String> = Vec::new();

        for option_pair in options.split('&') {
            let Some((key, value)) = option_pair.split_once('=') else {
                return Err(Error::invalid_argument(format!(
                    "connection string options is not a `key=value` pair: {option_pair}",
                )));
            };

            let key = key.to_lowercase();
            if keys.contains(&key) {
                return Err(Error::invalid_argument(
                    "repeated options are not allowed in the connection string",
                ));
            }

            let value = percent_encoding::percent_decode_str(value).decode_utf8_lossy();
            self.parse_option_pair(&key, value.as_ref())?;
            keys.push(key);
        }

        Ok(())
    }

    fn parse_option_pair(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "appname" => {
                self.app_name = Some(value.into());
            }
            "authmechanism" => {
                self.auth_mechanism = Some(AuthMechanism::from_str(value)?);
            }
            "authsource" => self.auth_source = Some(value.to_string()),
            "authmechanismproperties" => {
                let mut doc = Document::new();
                let err_func = || {
                    Error::from(ErrorKind::InvalidArgument {
                        message: "improperly formatted authMechanismProperties".to_string(),
                    })
                };

                for kvp in value.split(',') {
                    let (k, v) = match kvp.find(':') {
                        Some(index) => exclusive_split_at(kvp, index),
                        None => return Err(err_func()),
                    };
                    doc.insert(k.ok_or_else(err_func)?, v.ok_or_else(err_func)?);
                }
                self.auth_mechanism_properties = Some(doc);
            }
            "connecttimeoutms" => {
                let millis = value.parse::<u64>().map_err(|_| {
                    Error::invalid_argument(
                        "connection string `connectTimeoutMS` option must be a non-negative \
                         integer",
                    )
                })?;
                self.connect_timeout = Some(Duration::from_millis(millis));
            }
            other => {
                tracing::debug!(option = other, "ignoring unsupported connection string option");
            }
        }

        Ok(())
    }
}
