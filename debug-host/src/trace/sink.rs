use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};

use super::{TraceError, TraceOutput};

/// TCP fan-out of trace data. Any number of clients may connect.
#[derive(Debug)]
struct TraceServer {
    listener: TcpListener,
    clients: Vec<(SocketAddr, TcpStream)>,
}

impl TraceServer {
    fn bind(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))?;
        listener.set_nonblocking(true)?;
        tracing::info!("Serving trace data on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            clients: Vec::new(),
        })
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, address)) => {
                    // Slow clients must not stall capture.
                    if let Err(error) = stream.set_nonblocking(true) {
                        tracing::warn!("Rejecting trace client {address}: {error}");
                        continue;
                    }
                    tracing::info!("Trace client {address} connected");
                    self.clients.push((address, stream));
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => break,
                Err(error) => {
                    tracing::warn!("Failed to accept trace client: {error}");
                    break;
                }
            }
        }
    }

    fn broadcast(&mut self, data: &[u8]) {
        self.clients
            .retain_mut(|(address, client)| match write_available(client, data) {
                Ok(written) if written < data.len() => {
                    tracing::warn!(
                        "Trace client {address} is too slow, dropped {} of {} bytes",
                        data.len() - written,
                        data.len()
                    );
                    true
                }
                Ok(_) => true,
                Err(error) => {
                    tracing::warn!("Dropping trace client {address}: {error}");
                    false
                }
            });
    }
}

/// Write as much of `data` as `client` takes without blocking. Returns the number of bytes written.
fn write_available(client: &mut impl Write, data: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < data.len() {
        match client.write(&data[written..]) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(count) => written += count,
            Err(error) if error.kind() == ErrorKind::WouldBlock => break,
            Err(error) if error.kind() == ErrorKind::Interrupted => {}
            Err(error) => return Err(error),
        }
    }
    Ok(written)
}

/// The file and TCP outputs of a capturing trace unit.
#[derive(Debug, Default)]
pub(crate) struct TraceSink {
    file: Option<File>,
    server: Option<TraceServer>,
}

impl TraceSink {
    pub fn open(output: &TraceOutput) -> Result<Self, TraceError> {
        let sink_error = |source| TraceError::Sink {
            output: output.clone(),
            source,
        };

        let mut sink = Self::default();
        match output {
            TraceOutput::File(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(sink_error)?;
                sink.file = Some(file);
            }
            TraceOutput::Tcp(port) => {
                sink.server = Some(TraceServer::bind(*port).map_err(sink_error)?);
            }
            TraceOutput::External | TraceOutput::Discard => {}
        }
        Ok(sink)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server
            .as_ref()
            .and_then(|server| server.listener.local_addr().ok())
    }

    pub fn accept(&mut self) {
        if let Some(server) = self.server.as_mut() {
            server.accept();
        }
    }

    /// Forward captured data. Only a failing file is an error; TCP clients are best effort.
    pub fn write(&mut self, data: &[u8]) -> Result<(), TraceError> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(data)?;
            file.flush()?;
        }
        if let Some(server) = self.server.as_mut() {
            server.accept();
            server.broadcast(data);
        }
        Ok(())
    }

    /// Close all outputs. Closing again does nothing.
    pub fn close(&mut self) {
        self.file = None;
        self.server = None;
    }
}

#[cfg(test)]
mod test {
    use std::io::Read;
    use std::net::TcpStream;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::{write_available, TraceSink};
    use crate::trace::TraceOutput;

    /// A client that takes `capacity` bytes, then would block.
    struct SlowClient {
        received: Vec<u8>,
        capacity: usize,
    }

    impl std::io::Write for SlowClient {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let count = buf.len().min(self.capacity - self.received.len()).min(2);
            if count == 0 {
                return Err(std::io::ErrorKind::WouldBlock.into());
            }
            self.received.extend_from_slice(&buf[..count]);
            Ok(count)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn slow_client_reports_partial_writes() {
        let mut client = SlowClient {
            received: Vec::new(),
            capacity: 5,
        };

        assert_eq!(write_available(&mut client, b"tpiu-frame").unwrap(), 5);
        assert_eq!(client.received, b"tpiu-".to_vec());
        assert_eq!(write_available(&mut client, b"more").unwrap(), 0);
    }

    #[test]
    fn closed_client_is_an_error() {
        let mut client: &mut [u8] = &mut [];

        assert!(write_available(&mut client, b"x").is_err());
        assert_eq!(write_available(&mut client, b"").unwrap(), 0);
    }

    #[test]
    fn file_output_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.bin");
        std::fs::write(&path, [0xaa]).unwrap();

        let mut sink = TraceSink::open(&TraceOutput::File(path.clone())).unwrap();
        sink.write(&[1, 2, 3]).unwrap();
        sink.close();
        sink.close();

        assert_eq!(std::fs::read(&path).unwrap(), vec![0xaa, 1, 2, 3]);
    }

    #[test]
    fn tcp_output_reaches_every_client() {
        let mut sink = TraceSink::open(&TraceOutput::Tcp(0)).unwrap();
        let address = sink.local_addr().unwrap();

        let mut clients: Vec<TcpStream> = (0..2)
            .map(|_| {
                let client = TcpStream::connect(address).unwrap();
                client
                    .set_read_timeout(Some(Duration::from_secs(5)))
                    .unwrap();
                client
            })
            .collect();
        std::thread::sleep(Duration::from_millis(50));

        sink.write(b"swo").unwrap();

        for client in &mut clients {
            let mut buf = [0u8; 3];
            client.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"swo");
        }
    }

    #[test]
    fn missing_directory_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("trace.bin");

        assert!(TraceSink::open(&TraceOutput::File(path)).is_err());
    }
}
