//! A single buffered TCP connection to a memcached server.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use tracing::debug;

use crate::error::{ClientError, ClientResult};
use crate::metrics;

/// Options applied when opening a socket, snapshotted from the pool config.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnectOptions {
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub nagle: bool,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// One TCP socket plus buffered line/byte I/O.
///
/// Requests on a connection are strictly serialized; the write buffer is
/// assembled in memory and pushed to the socket by `flush`.
pub(crate) struct Connection {
    id: u64,
    host: String,
    reader: BufReader<TcpStream>,
    write_buf: BytesMut,
    open: bool,
}

impl Connection {
    /// Open a connection to `host` ("host:port").
    pub fn connect(host: &str, options: ConnectOptions) -> ClientResult<Self> {
        let addr = host
            .to_socket_addrs()
            .map_err(ClientError::Io)?
            .next()
            .ok_or_else(|| ClientError::Config(format!("cannot resolve address: {host}")))?;

        let stream = match options.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout).map_err(|err| {
                if err.kind() == std::io::ErrorKind::TimedOut
                    || err.kind() == std::io::ErrorKind::WouldBlock
                {
                    ClientError::ConnectTimeout(host.to_string())
                } else {
                    ClientError::Io(err)
                }
            })?,
            None => TcpStream::connect(addr)?,
        };
        stream.set_read_timeout(options.read_timeout)?;
        stream.set_nodelay(!options.nagle)?;

        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        debug!(host, id, "connection opened");
        metrics::CONNECTIONS_OPENED.increment();

        Ok(Connection {
            id,
            host: host.to_string(),
            reader: BufReader::new(stream),
            write_buf: BytesMut::with_capacity(1024),
            open: true,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// The underlying socket, for duplicating a handle at checkout.
    pub fn stream(&self) -> &TcpStream {
        self.reader.get_ref()
    }

    /// Append bytes to the write buffer.
    pub fn write(&mut self, data: &[u8]) {
        self.write_buf.extend_from_slice(data);
    }

    /// Push the write buffer to the socket and flush it.
    pub fn flush(&mut self) -> ClientResult<()> {
        if !self.open {
            return Err(closed());
        }
        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf)?;
        stream.flush()?;
        self.write_buf.clear();
        Ok(())
    }

    /// Read one line, returning it with the trailing CRLF stripped.
    pub fn read_line(&mut self) -> ClientResult<String> {
        if !self.open {
            return Err(closed());
        }
        let mut line = Vec::with_capacity(64);
        let n = self.reader.read_until(b'\n', &mut line)?;
        if n == 0 || !line.ends_with(b"\n") {
            return Err(ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-line",
            )));
        }
        line.pop();
        if line.ends_with(b"\r") {
            line.pop();
        }
        String::from_utf8(line).map_err(|err| ClientError::Protocol(err.to_string()))
    }

    /// Fill `buf` exactly, looping over short reads.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> ClientResult<()> {
        if !self.open {
            return Err(closed());
        }
        self.reader.read_exact(buf)?;
        Ok(())
    }

    /// Drain the stream through the next CRLF, discarding the bytes.
    pub fn clear_eol(&mut self) -> ClientResult<()> {
        if !self.open {
            return Err(closed());
        }
        let mut discard = Vec::with_capacity(2);
        let n = self.reader.read_until(b'\n', &mut discard)?;
        if n == 0 {
            return Err(ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before line end",
            )));
        }
        Ok(())
    }

    /// Whether the connection has not been closed locally.
    ///
    /// A peer-side close is only discovered at the next read or write, which
    /// then destroys the connection through the io-error path.
    pub fn is_connected(&self) -> bool {
        self.open
    }

    /// Close the connection permanently.
    pub fn true_close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.write_buf.clear();
        if let Err(err) = self.reader.get_ref().shutdown(Shutdown::Both) {
            debug!(host = %self.host, id = self.id, %err, "socket shutdown failed");
        }
        metrics::CONNECTIONS_CLOSED.increment();
        debug!(host = %self.host, id = self.id, "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.true_close();
    }
}

fn closed() -> ClientError {
    ClientError::Io(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "connection is closed",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener;
    use std::thread;

    fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = thread::spawn(move || listener.accept().unwrap().0);
        let conn = Connection::connect(
            &addr.to_string(),
            ConnectOptions {
                connect_timeout: Some(Duration::from_secs(1)),
                read_timeout: Some(Duration::from_secs(1)),
                nagle: false,
            },
        )
        .unwrap();
        (conn, accept.join().unwrap())
    }

    #[test]
    fn read_line_strips_crlf() {
        let (mut conn, mut peer) = pair();
        peer.write_all(b"STORED\r\nsecond\r\n").unwrap();
        assert_eq!(conn.read_line().unwrap(), "STORED");
        assert_eq!(conn.read_line().unwrap(), "second");
    }

    #[test]
    fn read_exact_then_clear_eol() {
        let (mut conn, mut peer) = pair();
        peer.write_all(b"hello\r\nEND\r\n").unwrap();
        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        conn.clear_eol().unwrap();
        assert_eq!(conn.read_line().unwrap(), "END");
    }

    #[test]
    fn write_is_buffered_until_flush() {
        let (mut conn, mut peer) = pair();
        conn.write(b"get ");
        conn.write(b"key\r\n");
        conn.flush().unwrap();
        let mut buf = [0u8; 9];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"get key\r\n");
    }

    #[test]
    fn closed_connection_errors() {
        let (mut conn, _peer) = pair();
        conn.true_close();
        assert!(!conn.is_connected());
        assert!(conn.read_line().is_err());
        assert!(conn.flush().is_err());
    }

    #[test]
    fn eof_is_an_error() {
        let (mut conn, peer) = pair();
        drop(peer);
        assert!(conn.read_line().is_err());
    }

    #[test]
    fn connect_timeout_kind() {
        // RFC 5737 TEST-NET address, guaranteed unroutable.
        let result = Connection::connect(
            "192.0.2.1:11211",
            ConnectOptions {
                connect_timeout: Some(Duration::from_millis(50)),
                read_timeout: None,
                nagle: true,
            },
        );
        match result {
            Err(ClientError::ConnectTimeout(_)) | Err(ClientError::Io(_)) => {}
            Err(err) => panic!("unexpected error kind: {err}"),
            Ok(_) => panic!("connect to TEST-NET should not succeed"),
        }
    }
}
