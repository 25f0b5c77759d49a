use std::{
    collections::BTreeSet,
    io::Read,
    net::{TcpStream, ToSocketAddrs},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::NaiveDate;
use meter_client::domain::{DayFileKey, SiteId};
use serde::Deserialize;

use crate::config::RemoteConfig;

/// libssh2's SFTP status for a missing path.
const SFTP_NO_SUCH_FILE: i32 = 2;

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("cannot reach {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("session not established within {0:?}")]
    ConnectTimeout(Duration),
    #[error("authentication rejected for site {0}")]
    Auth(SiteId),
    #[error("ssh error: {0}")]
    Ssh(#[from] ssh2::Error),
    #[error("remote i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid credentials file {path}: {reason}")]
    Credentials { path: PathBuf, reason: String },
    #[error("remote task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("session state poisoned")]
    Poisoned,
}

/// Opens a session to one site.
#[async_trait::async_trait]
pub trait RemoteConnector: Send + Sync {
    type Session: RemoteSession;

    async fn connect(&self, site_id: &SiteId, address: &str) -> Result<Self::Session, FetchError>;
}

/// An open session to one site's data directory.
#[async_trait::async_trait]
pub trait RemoteSession: Send {
    /// Days for which at least one day file of the site exists, ascending.
    async fn list_days(&mut self, site_id: &SiteId) -> Result<Vec<NaiveDate>, FetchError>;

    /// Contents of one day file, or `None` when it does not exist.
    async fn fetch_day(&mut self, key: &DayFileKey) -> Result<Option<Vec<u8>>, FetchError>;

    async fn close(&mut self) -> Result<(), FetchError>;
}

/// Keeps the day-file names that belong to `site_id`.
fn collect_days<'a, I>(site_id: &SiteId, names: I, days: &mut BTreeSet<NaiveDate>)
where
    I: IntoIterator<Item = &'a str>,
{
    for name in names {
        match DayFileKey::parse_file_name(name) {
            Ok(key) if &key.site_id == site_id => {
                days.insert(key.day);
            }
            Ok(_) => {}
            Err(_) => tracing::debug!(name, "ignoring non day-file entry"),
        }
    }
}

#[derive(Deserialize)]
struct Credentials {
    pwd: String,
}

/// Reads the shared edge password from a `{"pwd": "..."}` JSON file.
pub fn read_password(path: &Path) -> Result<String, FetchError> {
    let err = |reason: String| FetchError::Credentials {
        path: path.to_path_buf(),
        reason,
    };
    let raw = std::fs::read_to_string(path).map_err(|e| err(e.to_string()))?;
    let creds: Credentials = serde_json::from_str(&raw).map_err(|e| err(e.to_string()))?;
    Ok(creds.pwd)
}

/// SFTP over SSH with password authentication; the login name is the site id.
pub struct SftpConnector {
    port: u16,
    data_dir: PathBuf,
    password: String,
    timeout: Duration,
}

impl SftpConnector {
    pub fn new(port: u16, data_dir: PathBuf, password: String, timeout: Duration) -> Self {
        Self {
            port,
            data_dir,
            password,
            timeout,
        }
    }

    pub fn from_config(cfg: &RemoteConfig) -> Result<Self, FetchError> {
        let path = cfg.credentials_file.as_deref().ok_or_else(|| FetchError::Credentials {
            path: PathBuf::new(),
            reason: "no credentials file configured".to_string(),
        })?;
        let password = read_password(path)?;
        Ok(Self::new(cfg.port, cfg.data_dir.clone(), password, cfg.connect_timeout()))
    }
}

struct SftpInner {
    session: ssh2::Session,
    sftp: ssh2::Sftp,
}

fn open_sftp(address: &str, port: u16, user: &str, password: &str, timeout: Duration) -> Result<SftpInner, FetchError> {
    let connect_err = |source: std::io::Error| FetchError::Connect {
        address: address.to_string(),
        source,
    };
    let addr = (address, port)
        .to_socket_addrs()
        .map_err(connect_err)?
        .next()
        .ok_or_else(|| connect_err(std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved")))?;

    let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(connect_err)?;
    tcp.set_read_timeout(Some(timeout)).ok();
    tcp.set_write_timeout(Some(timeout)).ok();

    let mut session = ssh2::Session::new()?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout.as_millis().min(u128::from(u32::MAX)) as u32);
    session.handshake()?;
    session.userauth_password(user, password)?;
    if !session.authenticated() {
        return Err(FetchError::Auth(SiteId::new(user)));
    }

    let sftp = session.sftp()?;
    Ok(SftpInner { session, sftp })
}

fn entry_names(entries: &[(PathBuf, ssh2::FileStat)]) -> Vec<String> {
    let mut names: Vec<String> = entries
        .iter()
        .filter_map(|(path, _)| path.file_name().and_then(|n| n.to_str()).map(str::to_string))
        .collect();
    names.sort();
    names
}

#[async_trait::async_trait]
impl RemoteConnector for SftpConnector {
    type Session = SftpSession;

    async fn connect(&self, site_id: &SiteId, address: &str) -> Result<SftpSession, FetchError> {
        let address = address.to_string();
        let user = site_id.to_string();
        let password = self.password.clone();
        let (port, timeout) = (self.port, self.timeout);

        let inner =
            tokio::task::spawn_blocking(move || open_sftp(&address, port, &user, &password, timeout)).await??;

        Ok(SftpSession {
            inner: Arc::new(Mutex::new(inner)),
            data_dir: self.data_dir.clone(),
        })
    }
}

pub struct SftpSession {
    inner: Arc<Mutex<SftpInner>>,
    data_dir: PathBuf,
}

impl SftpSession {
    async fn blocking<T, F>(&self, op: F) -> Result<T, FetchError>
    where
        T: Send + 'static,
        F: FnOnce(&SftpInner) -> Result<T, FetchError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let guard = inner.lock().map_err(|_| FetchError::Poisoned)?;
            op(&guard)
        })
        .await?
    }
}

#[async_trait::async_trait]
impl RemoteSession for SftpSession {
    async fn list_days(&mut self, site_id: &SiteId) -> Result<Vec<NaiveDate>, FetchError> {
        let root = self.data_dir.clone();
        let site_id = site_id.clone();

        self.blocking(move |inner| {
            let mut days = BTreeSet::new();
            for year in entry_names(&inner.sftp.readdir(&root)?) {
                let year_dir = root.join(&year);
                for month in entry_names(&inner.sftp.readdir(&year_dir)?) {
                    let files = entry_names(&inner.sftp.readdir(&year_dir.join(&month))?);
                    collect_days(&site_id, files.iter().map(String::as_str), &mut days);
                }
            }
            Ok(days.into_iter().collect())
        })
        .await
    }

    async fn fetch_day(&mut self, key: &DayFileKey) -> Result<Option<Vec<u8>>, FetchError> {
        let path = self.data_dir.join(key.relative_path());

        self.blocking(move |inner| {
            let mut file = match inner.sftp.open(&path) {
                Ok(file) => file,
                Err(e) if e.code() == ssh2::ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let mut buf = Vec::new();
            file.read_to_end(&mut buf)?;
            Ok(Some(buf))
        })
        .await
    }

    async fn close(&mut self) -> Result<(), FetchError> {
        self.blocking(|inner| {
            inner.session.disconnect(None, "sync pass complete", None)?;
            Ok(())
        })
        .await
    }
}

/// Reads day files from `<root>/<site_id>/`, a locally mirrored copy of each
/// site's data directory.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    root: PathBuf,
}

impl LocalConnector {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait::async_trait]
impl RemoteConnector for LocalConnector {
    type Session = LocalSession;

    async fn connect(&self, site_id: &SiteId, address: &str) -> Result<LocalSession, FetchError> {
        let dir = self.root.join(site_id.as_str());
        let meta = tokio::fs::metadata(&dir).await.map_err(|source| FetchError::Connect {
            address: address.to_string(),
            source,
        })?;
        if !meta.is_dir() {
            return Err(FetchError::Connect {
                address: address.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "site directory missing"),
            });
        }
        Ok(LocalSession { dir })
    }
}

pub struct LocalSession {
    dir: PathBuf,
}

async fn sorted_names(dir: &Path) -> Result<Vec<String>, FetchError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

#[async_trait::async_trait]
impl RemoteSession for LocalSession {
    async fn list_days(&mut self, site_id: &SiteId) -> Result<Vec<NaiveDate>, FetchError> {
        let mut days = BTreeSet::new();
        for year in sorted_names(&self.dir).await? {
            let year_dir = self.dir.join(&year);
            if !year_dir.is_dir() {
                continue;
            }
            for month in sorted_names(&year_dir).await? {
                let month_dir = year_dir.join(&month);
                if !month_dir.is_dir() {
                    continue;
                }
                let files = sorted_names(&month_dir).await?;
                collect_days(site_id, files.iter().map(String::as_str), &mut days);
            }
        }
        Ok(days.into_iter().collect())
    }

    async fn fetch_day(&mut self, key: &DayFileKey) -> Result<Option<Vec<u8>>, FetchError> {
        match tokio::fs::read(self.dir.join(key.relative_path())).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn close(&mut self) -> Result<(), FetchError> {
        Ok(())
    }
}
