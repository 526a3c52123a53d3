//! Redirection of semihosting console and stdio traffic to a TCP client.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::host::bad_handle;

/// Which semihosting streams are served by the redirect client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedirectMode {
    /// Nothing is redirected.
    #[default]
    None,
    /// Only the console calls `SYS_READC`, `SYS_WRITEC` and `SYS_WRITE0`.
    Debug,
    /// Only `SYS_READ` and `SYS_WRITE` on the standard stream handles.
    Stdio,
    /// Both classes.
    All,
}

/// The two classes of stream traffic a [`RedirectMode`] chooses between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamClass {
    /// Console character calls.
    Debug,
    /// Buffered reads and writes on standard stream handles.
    Stdio,
}

impl RedirectMode {
    /// Whether traffic of the given class goes to the redirect client.
    pub fn redirects(self, class: StreamClass) -> bool {
        match (self, class) {
            (RedirectMode::All, _) => true,
            (RedirectMode::Debug, StreamClass::Debug) => true,
            (RedirectMode::Stdio, StreamClass::Stdio) => true,
            _ => false,
        }
    }
}

/// The given redirect mode is not known: {0}
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub struct UnknownRedirectMode(String);

impl FromStr for RedirectMode {
    type Err = UnknownRedirectMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "disable" => Ok(RedirectMode::None),
            "debug" => Ok(RedirectMode::Debug),
            "stdio" => Ok(RedirectMode::Stdio),
            "all" => Ok(RedirectMode::All),
            other => Err(UnknownRedirectMode(other.to_string())),
        }
    }
}

/// A TCP service with at most one client, standing in for the debug server's console.
#[derive(Debug)]
pub struct RedirectService {
    listener: TcpListener,
    client: Option<(SocketAddr, TcpStream)>,
}

impl RedirectService {
    /// Listen on `port` on the loopback interface. Port 0 picks a free port.
    pub fn bind(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))?;
        listener.set_nonblocking(true)?;

        tracing::info!("Semihosting redirect listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            client: None,
        })
    }

    /// The address the service listens on.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Whether a client is currently connected.
    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Address of the connected client.
    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client.as_ref().map(|(address, _)| *address)
    }

    /// Accept a waiting client and discard input nobody asked for.
    ///
    /// Call this periodically while the target runs.
    pub fn poll(&mut self) {
        self.accept();
        self.discard_input();
    }

    /// Read from the client. Blocks until data arrives.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.accept();
        let Some((address, client)) = self.client.as_mut() else {
            tracing::error!("No semihosting redirect client connected");
            return Err(bad_handle());
        };

        match client.read(buf) {
            Ok(0) if !buf.is_empty() => {
                tracing::info!("Semihosting redirect client {address} disconnected");
                self.client = None;
                Ok(0)
            }
            Ok(read) => Ok(read),
            Err(error) => {
                tracing::warn!("Failed to read from semihosting redirect client {address}: {error}");
                self.client = None;
                Err(error)
            }
        }
    }

    /// Write everything in `data` to the client.
    pub fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.accept();
        let Some((address, client)) = self.client.as_mut() else {
            tracing::error!("No semihosting redirect client connected");
            return Err(bad_handle());
        };

        if let Err(error) = client.write_all(data) {
            tracing::warn!("Failed to write to semihosting redirect client {address}: {error}");
            // Forget the client; a new one may connect later.
            self.client = None;
            return Err(error);
        }

        Ok(data.len())
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, address)) => {
                    // Some platforms hand out sockets inheriting the listener's mode.
                    if let Err(error) = stream.set_nonblocking(false) {
                        tracing::warn!("Rejecting redirect client {address}: {error}");
                        continue;
                    }
                    if let Some((previous, _)) = self.client.replace((address, stream)) {
                        tracing::info!("Redirect client {address} replaces {previous}");
                    } else {
                        tracing::info!("Redirect client {address} connected");
                    }
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => break,
                Err(error) => {
                    tracing::warn!("Failed to accept semihosting redirect client: {error}");
                    break;
                }
            }
        }
    }

    fn discard_input(&mut self) {
        let Some((address, client)) = self.client.as_mut() else {
            return;
        };

        if let Err(error) = client.set_nonblocking(true) {
            tracing::warn!("Failed to poll redirect client {address}: {error}");
            return;
        }

        let mut buf = [0u8; 256];
        let keep = loop {
            match client.read(&mut buf) {
                Ok(0) => {
                    tracing::info!("Semihosting redirect client {address} disconnected");
                    break false;
                }
                Ok(discarded) => tracing::debug!("Discarding {discarded} bytes of redirect input"),
                Err(error) if error.kind() == ErrorKind::WouldBlock => break true,
                Err(error) if error.kind() == ErrorKind::Interrupted => {}
                Err(error) => {
                    tracing::warn!("Failed to read from redirect client {address}: {error}");
                    break false;
                }
            }
        };

        if keep && client.set_nonblocking(false).is_ok() {
            return;
        }
        self.client = None;
    }
}

#[cfg(test)]
mod test {
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::{RedirectMode, RedirectService, StreamClass};

    #[test_case(RedirectMode::None, false, false)]
    #[test_case(RedirectMode::Debug, true, false)]
    #[test_case(RedirectMode::Stdio, false, true)]
    #[test_case(RedirectMode::All, true, true)]
    fn mode_selects_class(mode: RedirectMode, debug: bool, stdio: bool) {
        assert_eq!(mode.redirects(StreamClass::Debug), debug);
        assert_eq!(mode.redirects(StreamClass::Stdio), stdio);
    }

    #[test]
    fn parse_mode() {
        assert_eq!("disable".parse::<RedirectMode>().unwrap(), RedirectMode::None);
        assert_eq!("stdio".parse::<RedirectMode>().unwrap(), RedirectMode::Stdio);
        assert!("tcp".parse::<RedirectMode>().is_err());
    }

    fn connect(service: &mut RedirectService) -> TcpStream {
        let client = TcpStream::connect(service.local_addr().unwrap()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let address = client.local_addr().unwrap();
        // Accepting is nonblocking, so give the connection a moment to land.
        for _ in 0..100 {
            service.poll();
            if service.client_addr() == Some(address) {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(service.client_addr(), Some(address));
        client
    }

    #[test]
    fn without_client_is_ebadf() {
        let mut service = RedirectService::bind(0).unwrap();

        let error = service.write(b"hello").unwrap_err();
        assert_eq!(error.raw_os_error(), Some(libc::EBADF));

        let mut buf = [0u8; 4];
        let error = service.read(&mut buf).unwrap_err();
        assert_eq!(error.raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn write_reaches_client() {
        let mut service = RedirectService::bind(0).unwrap();
        let mut client = connect(&mut service);

        assert_eq!(service.write(b"hello").unwrap(), 5);

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn read_from_client() {
        let mut service = RedirectService::bind(0).unwrap();
        let mut client = connect(&mut service);

        client.write_all(b"x").unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(service.read(&mut buf).unwrap(), 1);
        assert_eq!(&buf, b"x");
    }

    #[test]
    fn unsolicited_input_is_discarded() {
        let mut service = RedirectService::bind(0).unwrap();
        let mut client = connect(&mut service);

        client.write_all(b"stale").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        service.poll();
        client.write_all(b"y").unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(service.read(&mut buf).unwrap(), 1);
        assert_eq!(&buf, b"y");
    }

    #[test]
    fn new_client_replaces_old() {
        let mut service = RedirectService::bind(0).unwrap();
        let _first = connect(&mut service);
        let mut second = connect(&mut service);

        service.write(b"z").unwrap();

        let mut buf = [0u8; 1];
        second.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"z");
    }
}
