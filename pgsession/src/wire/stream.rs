use std::{
    io::{self, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    os::{
        fd::{AsRawFd, RawFd},
        unix::net::UnixStream,
    },
};

use bytes::{Buf, BytesMut};

use crate::{
    Result,
    common::verbose,
    config::Config,
    driver::TraceSink,
    ext::FmtExt,
    postgres::{BackendProtocol, FrontendProtocol, ProtocolError, frontend},
};

const DEFAULT_BUF_CAPACITY: usize = 1024;
const READ_CHUNK: usize = 8 * 1024;

/// A connected byte stream the wire driver can run over.
pub trait Transport: Read + Write + AsRawFd {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;
}

/// Tcp or unix socket.
#[derive(Debug)]
pub enum Socket {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Socket {
    pub fn connect(config: &Config) -> io::Result<Socket> {
        if let Some(dir) = &config.socket {
            let path = format!("{}/.s.PGSQL.{}", dir.trim_end_matches('/'), config.port);
            return Ok(Socket::Unix(UnixStream::connect(path)?));
        }

        let Some(timeout) = config.connect_timeout else {
            let tcp = TcpStream::connect((config.host.as_str(), config.port))?;
            tcp.set_nodelay(true)?;
            return Ok(Socket::Tcp(tcp));
        };

        let mut last_err = None;
        for addr in (config.host.as_str(), config.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(tcp) => {
                    tcp.set_nodelay(true)?;
                    return Ok(Socket::Tcp(tcp));
                },
                Err(err) => last_err = Some(err),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "host resolved to no address")
        }))
    }
}

impl Transport for Socket {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Socket::Tcp(tcp) => tcp.set_nonblocking(nonblocking),
            Socket::Unix(unix) => unix.set_nonblocking(nonblocking),
        }
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(tcp) => tcp.read(buf),
            Socket::Unix(unix) => unix.read(buf),
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(tcp) => tcp.write(buf),
            Socket::Unix(unix) => unix.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Socket::Tcp(tcp) => tcp.flush(),
            Socket::Unix(unix) => unix.flush(),
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Socket::Tcp(tcp) => tcp.as_raw_fd(),
            Socket::Unix(unix) => unix.as_raw_fd(),
        }
    }
}

/// Buffered blocking connection to postgres.
pub(crate) struct PgStream<S = Socket> {
    socket: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
    trace: Option<TraceSink>,
}

impl PgStream {
    pub fn connect(config: &Config) -> io::Result<Self> {
        Ok(Self::new(Socket::connect(config)?))
    }
}

impl<S: Transport> PgStream<S> {
    /// Read whatever is available without blocking.
    pub fn fill_nonblocking(&mut self) -> Result<()> {
        self.socket.set_nonblocking(true)?;
        let result = loop {
            match self.fill() {
                Ok(()) => continue,
                Err(err) if is_would_block(&err) => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        self.socket.set_nonblocking(false)?;
        result
    }
}

fn is_would_block(err: &crate::Error) -> bool {
    matches!(err.kind(), crate::error::ErrorKind::Io(io) if io.kind() == io::ErrorKind::WouldBlock)
}

impl<S: Read + Write> PgStream<S> {
    pub fn new(socket: S) -> Self {
        Self {
            socket,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            trace: None,
        }
    }

    pub fn set_trace(&mut self, trace: Option<TraceSink>) {
        self.trace = trace;
    }

    /// Buffer a message, call [`flush`][PgStream::flush] to send it.
    pub fn send<F: FrontendProtocol>(&mut self, msg: F) {
        verbose!("send {}", F::MSGTYPE as char);
        let offset = self.write_buf.len();
        frontend::write(msg, &mut self.write_buf);
        self.trace_message("To backend>", offset);
    }

    pub fn send_startup(&mut self, msg: frontend::Startup) {
        verbose!("send Startup");
        msg.write(&mut self.write_buf);
    }

    pub fn send_cancel(&mut self, msg: frontend::CancelRequest) {
        verbose!("send CancelRequest");
        msg.write(&mut self.write_buf);
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.socket.write_all(&self.write_buf)?;
        self.write_buf.clear();
        self.socket.flush()
    }

    /// Receive a message, blocking until a complete one arrived.
    pub fn recv<B: BackendProtocol>(&mut self) -> Result<B> {
        loop {
            if let Some(msg) = self.try_recv()? {
                return Ok(msg);
            }
            self.fill()?;
        }
    }

    /// Decode a message that is already buffered.
    pub fn try_recv<B: BackendProtocol>(&mut self) -> Result<Option<B>> {
        let Some(mut header) = self.read_buf.get(..5) else {
            return Ok(None);
        };

        let msgtype = header.get_u8();
        let len = header.get_u32() as usize;

        // the length counts itself
        if len < 4 {
            return Err(ProtocolError::malformed("message length").into());
        }

        if self.read_buf.len() - 1/*msgtype*/ < len {
            self.read_buf.reserve(1 + len - self.read_buf.len());
            return Ok(None);
        }

        self.trace_incoming(1 + len);
        self.read_buf.advance(5);
        let body = self.read_buf.split_to(len - 4).freeze();

        verbose!("recv {}", msgtype as char);
        Ok(Some(B::decode(msgtype, body)?))
    }

    /// Returns `true` if a complete message is buffered.
    pub fn has_message(&self) -> bool {
        match self.read_buf.get(..5) {
            Some(mut header) => {
                header.advance(1);
                self.read_buf.len() - 1 >= header.get_u32() as usize
            },
            None => false,
        }
    }

    /// Read once from the socket, end of stream is an error.
    pub fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.socket.read(&mut chunk)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed the connection unexpectedly",
            ).into());
        }
        self.read_buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    fn trace_message(&self, prefix: &str, offset: usize) {
        if let Some(trace) = &self.trace {
            let msg = &self.write_buf[offset..];
            // tracing never fails the connection
            let _ = writeln!(trace.borrow_mut(), "{prefix} {} {}", msg[0] as char, msg[5..].lossy());
        }
    }

    fn trace_incoming(&self, len: usize) {
        if let Some(trace) = &self.trace {
            let msg = &self.read_buf[..len];
            let _ = writeln!(trace.borrow_mut(), "From backend< {} {}", msg[0] as char, msg[5..].lossy());
        }
    }
}
