//! Backend session gateway.
//!
//! The backend is a SQLite database file with three services:
//!
//! * [`ServiceKind::Query`]: reading objects and enumerations.
//! * [`ServiceKind::Update`]: saving and deleting objects and registering enumeration values.
//! * [`ServiceKind::SharedResources`]: the tabular bulk-data store ([`TableService`]).
//!
//! Every logical operation runs in its own short-lived [`Session`].
//! Holding a session across unrelated operations keeps backend resources alive, so the gateway never does that.
//! A session is closed when it is dropped, which happens on every exit path of [`Gateway::perform`] and [`Gateway::with_tables`].

pub mod objects;
pub mod selector;
pub mod tables;

pub use objects::{EnumEntry, ObjectRecord};
pub use selector::Selector;
pub use tables::{Cell, Column, ColumnKind, Table, TableSchema, TableService};

use crate::error::BackendContext;
use crate::{utils, KBConfig, KBError, Result};

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OpenFlags, OptionalExtension};

use std::fmt::Display;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};


//-----------------------------------------------------------------------------

/// Service kinds exposed by a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Query,
    Update,
    SharedResources,
}

impl ServiceKind {
    /// Returns the name of the service kind.
    pub fn name(&self) -> &'static str {
        match self {
            ServiceKind::Query => "query",
            ServiceKind::Update => "update",
            ServiceKind::SharedResources => "shared_resources",
        }
    }
}

impl FromStr for ServiceKind {
    type Err = KBError;

    fn from_str(name: &str) -> Result<Self> {
        match name {
            "query" => Ok(ServiceKind::Query),
            "update" => Ok(ServiceKind::Update),
            "shared_resources" => Ok(ServiceKind::SharedResources),
            _ => Err(KBError::UnsupportedServiceKind(name.to_string())),
        }
    }
}

impl Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

//-----------------------------------------------------------------------------

/// A request to the object services.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    /// Load the object with the given VID.
    GetObject { vid: String },
    /// Find objects of a class, optionally with `field == value`.
    FindObjects { class: String, field: Option<(String, SqlValue)> },
    /// List all enumeration values.
    GetEnums,
    /// Save an object.
    SaveObject(ObjectRecord),
    /// Delete the object with the given VID.
    DeleteObject { vid: String },
    /// Add values to an enumeration.
    RegisterEnum { class: String, values: Vec<String> },
}

impl Request {
    /// Returns the name of the requested action.
    pub fn action(&self) -> &'static str {
        match self {
            Request::GetObject { .. } => "getObject",
            Request::FindObjects { .. } => "findObjects",
            Request::GetEnums => "getEnums",
            Request::SaveObject(_) => "saveObject",
            Request::DeleteObject { .. } => "deleteObject",
            Request::RegisterEnum { .. } => "registerEnum",
        }
    }
}

/// A reply from the object services.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Object(Option<ObjectRecord>),
    Objects(Vec<ObjectRecord>),
    Enums(Vec<EnumEntry>),
    Saved(String),
    Deleted(bool),
    Registered(usize),
}

impl Reply {
    fn unexpected(self, expected: &str) -> KBError {
        KBError::Invariant(format!("expected a {} reply, got {:?}", expected, self))
    }

    /// Returns the object from an [`Reply::Object`] reply.
    pub fn into_object(self) -> Result<Option<ObjectRecord>> {
        match self {
            Reply::Object(record) => Ok(record),
            _ => Err(self.unexpected("object")),
        }
    }

    /// Returns the objects from an [`Reply::Objects`] reply.
    pub fn into_objects(self) -> Result<Vec<ObjectRecord>> {
        match self {
            Reply::Objects(records) => Ok(records),
            _ => Err(self.unexpected("objects")),
        }
    }

    /// Returns the values from an [`Reply::Enums`] reply.
    pub fn into_enums(self) -> Result<Vec<EnumEntry>> {
        match self {
            Reply::Enums(entries) => Ok(entries),
            _ => Err(self.unexpected("enums")),
        }
    }

    /// Returns the VID from a [`Reply::Saved`] reply.
    pub fn into_saved(self) -> Result<String> {
        match self {
            Reply::Saved(vid) => Ok(vid),
            _ => Err(self.unexpected("saved")),
        }
    }

    /// Returns the flag from a [`Reply::Deleted`] reply.
    pub fn into_deleted(self) -> Result<bool> {
        match self {
            Reply::Deleted(deleted) => Ok(deleted),
            _ => Err(self.unexpected("deleted")),
        }
    }
}

//-----------------------------------------------------------------------------

/// A service obtained from a session.
#[derive(Debug)]
pub enum Service<'a> {
    Query(&'a Connection),
    Update(&'a mut Connection),
    SharedResources(TableService<'a>),
}

impl<'a> Service<'a> {
    /// Returns the kind of the service.
    pub fn kind(&self) -> ServiceKind {
        match self {
            Service::Query(_) => ServiceKind::Query,
            Service::Update(_) => ServiceKind::Update,
            Service::SharedResources(_) => ServiceKind::SharedResources,
        }
    }

    /// Invokes the request on the service.
    ///
    /// Fails with [`KBError::UnsupportedAction`] if the service does not expose the action.
    pub fn call(self, request: Request) -> Result<Reply> {
        let kind = self.kind();
        match (self, request) {
            (Service::Query(connection), Request::GetObject { vid }) => {
                objects::get(connection, &vid).map(Reply::Object)
            },
            (Service::Query(connection), Request::FindObjects { class, field }) => {
                objects::find(connection, &class, field.as_ref()).map(Reply::Objects)
            },
            (Service::Query(connection), Request::GetEnums) => {
                objects::enums(connection).map(Reply::Enums)
            },
            (Service::Update(connection), Request::SaveObject(record)) => {
                objects::save(connection, &record).map(Reply::Saved)
            },
            (Service::Update(connection), Request::DeleteObject { vid }) => {
                objects::delete(connection, &vid).map(Reply::Deleted)
            },
            (Service::Update(connection), Request::RegisterEnum { class, values }) => {
                objects::register_enum(connection, &class, &values).map(Reply::Registered)
            },
            (_, request) => Err(KBError::UnsupportedAction(format!("{} on the {} service", request.action(), kind))),
        }
    }
}

//-----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SessionCounters {
    opened: AtomicUsize,
    open: AtomicUsize,
}

/// A short-lived authenticated backend session.
///
/// The session is closed when dropped.
#[derive(Debug)]
pub struct Session {
    connection: Connection,
    id: usize,
    counters: Arc<SessionCounters>,
}

impl Session {
    /// Returns the identifier of the session within its gateway.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Returns the requested service.
    pub fn service(&mut self, kind: ServiceKind) -> Service<'_> {
        match kind {
            ServiceKind::Query => Service::Query(&self.connection),
            ServiceKind::Update => Service::Update(&mut self.connection),
            ServiceKind::SharedResources => Service::SharedResources(TableService::new(&mut self.connection)),
        }
    }

    /// Returns the tabular service.
    pub fn tables(&mut self) -> TableService<'_> {
        TableService::new(&mut self.connection)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.counters.open.fetch_sub(1, Ordering::SeqCst);
        debug!("Closed session {}", self.id);
    }
}

//-----------------------------------------------------------------------------

/// Gateway to a backend database.
///
/// The gateway holds the credentials and opens a fresh [`Session`] for each operation.
///
/// # Examples
///
/// ```
/// use genokb::{Gateway, KBConfig};
/// use genokb::backend::{Request, ServiceKind};
///
/// let dir = tempfile::tempdir().unwrap();
/// let config = KBConfig::new(dir.path().join("kb.db"), "root", "secret");
/// let gateway = Gateway::create(&config).unwrap();
///
/// let reply = gateway.perform(ServiceKind::Query, Request::GetObject { vid: String::from("V0") });
/// assert_eq!(reply.unwrap().into_object().unwrap(), None);
/// assert!(gateway.perform(ServiceKind::SharedResources, Request::GetEnums).is_err());
/// assert_eq!(gateway.open_sessions(), 0);
/// ```
#[derive(Debug)]
pub struct Gateway {
    config: KBConfig,
    counters: Arc<SessionCounters>,
}

impl Gateway {
    // Key for database version.
    const KEY_VERSION: &'static str = "version";

    /// Current database version.
    pub const VERSION: &'static str = "genokb v0.1.0";

    /// Creates a new backend database with the configured user and returns a gateway to it.
    ///
    /// Fails if the database already exists.
    pub fn create(config: &KBConfig) -> Result<Self> {
        Self::create_with(config, |_| Ok(()))
    }

    /// Creates a new backend database and initializes it with the given function.
    ///
    /// Fails if the database already exists.
    /// If creation or initialization fails, the database file is removed.
    pub fn create_with<F>(config: &KBConfig, init: F) -> Result<Self>
    where
        F: FnOnce(&Gateway) -> Result<()>,
    {
        info!("Creating backend database {}", config.host.display());
        if utils::file_exists(&config.host) {
            return Err(KBError::Config(format!("database {} already exists", config.host.display())));
        }

        let result = Self::create_database(config).and_then(|gateway| {
            init(&gateway)?;
            Ok(gateway)
        });
        if let Err(err) = &result {
            warn!("Failed to create backend database {}: {}", config.host.display(), err);
            if utils::file_exists(&config.host) {
                if let Err(removal) = std::fs::remove_file(&config.host) {
                    warn!("Could not remove {}: {}", config.host.display(), removal);
                }
            }
        }
        result
    }

    fn create_database(config: &KBConfig) -> Result<Self> {
        let mut connection = Connection::open(&config.host).context("creating the database")?;
        Self::create_tables(&mut connection, config).context("creating the database")?;
        drop(connection);
        Self::open(config)
    }

    fn create_tables(connection: &mut Connection, config: &KBConfig) -> rusqlite::Result<()> {
        let transaction = connection.transaction()?;
        transaction.execute(
            "CREATE TABLE Tags (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            ) STRICT",
            (),
        )?;
        transaction.execute(
            "INSERT INTO Tags(key, value) VALUES (?1, ?2)",
            (Self::KEY_VERSION, Self::VERSION),
        )?;
        transaction.execute(
            "CREATE TABLE Users (
                name TEXT PRIMARY KEY,
                password TEXT NOT NULL
            ) STRICT",
            (),
        )?;
        transaction.execute(
            "INSERT INTO Users(name, password) VALUES (?1, ?2)",
            (&config.user, utils::sha256_hex(&config.password)),
        )?;
        objects::create_store(&transaction)?;
        tables::create_catalog(&transaction)?;
        transaction.commit()
    }

    /// Returns a gateway to an existing backend database.
    ///
    /// Opens and closes one session to check the database version and the credentials.
    pub fn open(config: &KBConfig) -> Result<Self> {
        let gateway = Gateway {
            config: config.clone(),
            counters: Arc::new(SessionCounters::default()),
        };
        drop(gateway.open_session()?);
        Ok(gateway)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &KBConfig {
        &self.config
    }

    /// Opens a new authenticated session.
    pub fn open_session(&self) -> Result<Session> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let connection = Connection::open_with_flags(&self.config.host, flags).context("opening a session")?;

        let version: Option<String> = connection.query_row(
            "SELECT value FROM Tags WHERE key = ?1",
            (Self::KEY_VERSION,),
            |row| row.get(0)
        ).optional().context("checking the database version")?;
        if version.as_deref() != Some(Self::VERSION) {
            return Err(KBError::Config(format!(
                "unsupported database version {:?} (expected {})", version, Self::VERSION
            )));
        }

        let password: Option<String> = connection.query_row(
            "SELECT password FROM Users WHERE name = ?1",
            (&self.config.user,),
            |row| row.get(0)
        ).optional().context("authenticating")?;
        if password != Some(utils::sha256_hex(&self.config.password)) {
            return Err(KBError::Authentication(format!("invalid credentials for user {}", self.config.user)));
        }

        let id = self.counters.opened.fetch_add(1, Ordering::SeqCst);
        self.counters.open.fetch_add(1, Ordering::SeqCst);
        debug!("Opened session {} for user {}", id, self.config.user);
        Ok(Session { connection, id, counters: self.counters.clone() })
    }

    /// Performs one request in a fresh session.
    ///
    /// The session is closed before the result is returned, whether the request succeeded or failed.
    pub fn perform(&self, kind: ServiceKind, request: Request) -> Result<Reply> {
        let mut session = self.open_session()?;
        let result = session.service(kind).call(request);
        drop(session);
        result
    }

    /// Performs one request with the service kind given by name.
    ///
    /// Fails with [`KBError::UnsupportedServiceKind`] if the name is unknown.
    pub fn perform_named(&self, kind: &str, request: Request) -> Result<Reply> {
        let kind = ServiceKind::from_str(kind)?;
        self.perform(kind, request)
    }

    /// Runs the function with the tabular service of a fresh session.
    ///
    /// The session is closed before the result is returned.
    pub fn with_tables<T, F: FnOnce(&mut TableService) -> Result<T>>(&self, f: F) -> Result<T> {
        let mut session = self.open_session()?;
        let result = {
            let mut tables = session.tables();
            f(&mut tables)
        };
        drop(session);
        result
    }

    /// Returns the total number of sessions opened through this gateway.
    pub fn sessions_opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    /// Returns the number of sessions currently open.
    pub fn open_sessions(&self) -> usize {
        self.counters.open.load(Ordering::SeqCst)
    }

    /// Returns the size of the backend database file in a human-readable format.
    pub fn file_size(&self) -> Option<String> {
        utils::file_size(&self.config.host)
    }
}

//-----------------------------------------------------------------------------
