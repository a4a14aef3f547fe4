use std::fs::{self, File};
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ssh2::{ErrorCode, Session, Sftp};
use tracing::{debug, info, warn};

use crate::domain::join_remote;
use crate::error::SyncError;
use crate::retry::RetryPolicy;

// libssh2 LIBSSH2_FX_NO_SUCH_FILE / LIBSSH2_FX_NO_SUCH_PATH
const SFTP_NO_SUCH_FILE: i32 = 2;
const SFTP_NO_SUCH_PATH: i32 = 10;

#[derive(Debug, Clone)]
pub struct RemoteEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
}

/// Opens sessions against a remote file host.
pub trait RemoteFileSource {
    fn connect(&self) -> Result<Box<dyn RemoteSession>, SyncError>;
}

impl<T: RemoteFileSource + ?Sized> RemoteFileSource for Box<T> {
    fn connect(&self) -> Result<Box<dyn RemoteSession>, SyncError> {
        (**self).connect()
    }
}

/// An open connection. `exists` never fails on a missing path.
pub trait RemoteSession {
    fn exists(&self, path: &str) -> bool;
    fn list_files(&self, dir: &str) -> Result<Vec<String>, SyncError>;
    fn fetch(&self, remote_path: &str, local_path: &Path) -> Result<u64, SyncError>;
    fn close(&mut self);
}

pub struct SftpSource {
    endpoint: RemoteEndpoint,
    retry: RetryPolicy,
}

impl SftpSource {
    pub fn new(endpoint: RemoteEndpoint, retry: RetryPolicy) -> Self {
        Self { endpoint, retry }
    }
}

impl RemoteFileSource for SftpSource {
    fn connect(&self) -> Result<Box<dyn RemoteSession>, SyncError> {
        let endpoint = &self.endpoint;
        let address = format!("{}:{}", endpoint.host, endpoint.port);
        info!(host = %endpoint.host, port = endpoint.port, "connecting to SFTP server");
        let socket = address
            .to_socket_addrs()
            .map_err(|err| SyncError::Connection(format!("{address}: {err}")))?
            .next()
            .ok_or_else(|| SyncError::Connection(format!("{address}: no address resolved")))?;
        let tcp = TcpStream::connect_timeout(&socket, endpoint.timeout)
            .map_err(|err| SyncError::Connection(format!("{address}: {err}")))?;

        let mut session =
            Session::new().map_err(|err| SyncError::Connection(err.to_string()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(endpoint.timeout.as_millis().min(u32::MAX as u128) as u32);
        session
            .handshake()
            .map_err(|err| SyncError::Connection(format!("handshake with {address}: {err}")))?;
        session
            .userauth_password(&endpoint.username, &endpoint.password)
            .map_err(|err| SyncError::Connection(format!("authentication failed: {err}")))?;
        if !session.authenticated() {
            return Err(SyncError::Connection(
                "server rejected credentials".to_string(),
            ));
        }
        let sftp = session
            .sftp()
            .map_err(|err| SyncError::Connection(format!("sftp subsystem: {err}")))?;
        Ok(Box::new(SftpSession {
            session,
            sftp: Some(sftp),
            retry: self.retry.clone(),
        }))
    }
}

pub struct SftpSession {
    session: Session,
    sftp: Option<Sftp>,
    retry: RetryPolicy,
}

impl SftpSession {
    fn sftp(&self) -> Result<&Sftp, SyncError> {
        self.sftp
            .as_ref()
            .ok_or_else(|| SyncError::Connection("session already closed".to_string()))
    }

    fn fetch_once(&self, remote_path: &str, local_path: &Path) -> Result<u64, SyncError> {
        let sftp = self.sftp()?;
        let mut remote = sftp
            .open(Path::new(remote_path))
            .map_err(|err| map_sftp_error(remote_path, err))?;
        let mut file = File::create(local_path)
            .map_err(|err| SyncError::Filesystem(format!("{}: {err}", local_path.display())))?;
        io::copy(&mut remote, &mut file).map_err(|err| {
            if err.kind() == io::ErrorKind::TimedOut {
                SyncError::Timeout(format!("{remote_path}: {err}"))
            } else {
                SyncError::Transfer {
                    path: remote_path.to_string(),
                    message: err.to_string(),
                }
            }
        })
    }
}

impl RemoteSession for SftpSession {
    fn exists(&self, path: &str) -> bool {
        match self.sftp() {
            Ok(sftp) => sftp.stat(Path::new(path)).is_ok(),
            Err(_) => false,
        }
    }

    fn list_files(&self, dir: &str) -> Result<Vec<String>, SyncError> {
        let entries = self
            .sftp()?
            .readdir(Path::new(dir))
            .map_err(|err| map_sftp_error(dir, err))?;
        let mut names = entries
            .into_iter()
            .filter(|(_, stat)| stat.is_file())
            .filter_map(|(path, _)| {
                path.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .collect::<Vec<_>>();
        names.sort();
        Ok(names)
    }

    fn fetch(&self, remote_path: &str, local_path: &Path) -> Result<u64, SyncError> {
        self.retry
            .run(remote_path, || self.fetch_once(remote_path, local_path))
    }

    fn close(&mut self) {
        self.sftp.take();
        if let Err(err) = self.session.disconnect(None, "floodsync run finished", None) {
            warn!(error = %err, "error while closing SFTP session");
        } else {
            debug!("SFTP session closed");
        }
    }
}

impl Drop for SftpSession {
    fn drop(&mut self) {
        if self.sftp.is_some() {
            self.close();
        }
    }
}

fn map_sftp_error(path: &str, err: ssh2::Error) -> SyncError {
    match err.code() {
        ErrorCode::SFTP(SFTP_NO_SUCH_FILE) | ErrorCode::SFTP(SFTP_NO_SUCH_PATH) => {
            SyncError::NotFound(path.to_string())
        }
        ErrorCode::Session(-9) => SyncError::Timeout(format!("{path}: {err}")),
        _ => SyncError::Transfer {
            path: path.to_string(),
            message: err.to_string(),
        },
    }
}

/// A mirror of the remote layout on a locally mounted filesystem.
#[derive(Debug, Clone)]
pub struct LocalDirSource {
    root: PathBuf,
}

impl LocalDirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl RemoteFileSource for LocalDirSource {
    fn connect(&self) -> Result<Box<dyn RemoteSession>, SyncError> {
        if !self.root.is_dir() {
            return Err(SyncError::Connection(format!(
                "mirror root {} is not a directory",
                self.root.display()
            )));
        }
        Ok(Box::new(LocalDirSession {
            root: self.root.clone(),
        }))
    }
}

pub struct LocalDirSession {
    root: PathBuf,
}

impl LocalDirSession {
    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(join_remote("", path))
    }
}

impl RemoteSession for LocalDirSession {
    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    fn list_files(&self, dir: &str) -> Result<Vec<String>, SyncError> {
        let resolved = self.resolve(dir);
        let entries = fs::read_dir(&resolved).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                SyncError::NotFound(dir.to_string())
            } else {
                SyncError::Filesystem(err.to_string())
            }
        })?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| SyncError::Filesystem(err.to_string()))?;
            if entry.path().is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn fetch(&self, remote_path: &str, local_path: &Path) -> Result<u64, SyncError> {
        let source = self.resolve(remote_path);
        if !source.is_file() {
            return Err(SyncError::NotFound(remote_path.to_string()));
        }
        fs::copy(&source, local_path).map_err(|err| SyncError::Transfer {
            path: remote_path.to_string(),
            message: err.to_string(),
        })
    }

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn local_mirror_lists_and_fetches() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("2025/01/09/00");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("b.json"), b"[]").unwrap();
        fs::write(dir.join("a.json"), b"{}").unwrap();
        fs::create_dir_all(dir.join("HMC")).unwrap();

        let mut session = LocalDirSource::new(temp.path()).connect().unwrap();
        assert!(session.exists("2025/01/09/00/HMC"));
        assert!(!session.exists("2025/01/10/00"));
        assert_eq!(
            session.list_files("2025/01/09/00").unwrap(),
            vec!["a.json", "b.json"]
        );

        let local = temp.path().join("copy.json");
        let bytes = session.fetch("2025/01/09/00/a.json", &local).unwrap();
        assert_eq!(bytes, 2);

        let err = session
            .fetch("2025/01/09/00/missing.json", &local)
            .unwrap_err();
        assert_matches!(err, SyncError::NotFound(_));
        session.close();
    }

    #[test]
    fn missing_mirror_root_is_a_connection_error() {
        let temp = tempfile::tempdir().unwrap();
        let result = LocalDirSource::new(temp.path().join("absent")).connect();
        assert_matches!(result.err(), Some(SyncError::Connection(_)));
    }
}
