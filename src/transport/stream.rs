//! Platform-specific stream and listener implementations.
//!
//! - Unix: Unix Domain Socket
//! - Windows: Named Pipe
//! - Both: TCP on IPv4
//!
//! [`PeerStream`] and [`PeerListener`] paper over the differences so
//! the transport loops are platform-independent. All construction and
//! I/O happens on the transport's loop thread.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

#[cfg(windows)]
use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions};

use super::Endpoint;

/// A connected peer stream.
pub(crate) enum PeerStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    #[cfg(windows)]
    PipeClient(NamedPipeClient),
    #[cfg(windows)]
    PipeServer(NamedPipeServer),
}

impl PeerStream {
    /// Connect to `endpoint` (non-blocking, resolves on the loop thread).
    pub async fn connect(endpoint: &Endpoint) -> io::Result<PeerStream> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let (host, port) = Endpoint::tcp_connect_addr(addr)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                Ok(PeerStream::Tcp(TcpStream::connect((host, port)).await?))
            }
            #[cfg(unix)]
            Endpoint::Local(path) => Ok(PeerStream::Unix(UnixStream::connect(path).await?)),
            #[cfg(windows)]
            Endpoint::Local(path) => Ok(PeerStream::PipeClient(ClientOptions::new().open(path)?)),
        }
    }
}

macro_rules! delegate_stream {
    ($self:ident, $inner:ident => $body:expr) => {
        match $self.get_mut() {
            PeerStream::Tcp($inner) => $body,
            #[cfg(unix)]
            PeerStream::Unix($inner) => $body,
            #[cfg(windows)]
            PeerStream::PipeClient($inner) => $body,
            #[cfg(windows)]
            PeerStream::PipeServer($inner) => $body,
        }
    };
}

impl AsyncRead for PeerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        delegate_stream!(self, inner => Pin::new(inner).poll_read(cx, buf))
    }
}

impl AsyncWrite for PeerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        delegate_stream!(self, inner => Pin::new(inner).poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate_stream!(self, inner => Pin::new(inner).poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate_stream!(self, inner => Pin::new(inner).poll_shutdown(cx))
    }
}

/// A bound listener accepting peer streams.
#[derive(Debug)]
pub(crate) enum PeerListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix { listener: UnixListener, path: String },
    #[cfg(windows)]
    Pipe {
        path: String,
        next: Option<NamedPipeServer>,
    },
}

impl PeerListener {
    /// Bind to `endpoint`.
    ///
    /// For Unix sockets, any stale socket file left by a crashed
    /// process is removed first, and `multiuser` widens the socket
    /// permissions to world read+write.
    pub async fn bind(endpoint: &Endpoint, multiuser: bool) -> io::Result<PeerListener> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let (host, port) = Endpoint::tcp_bind_addr(addr)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                Ok(PeerListener::Tcp(TcpListener::bind((host, port)).await?))
            }
            #[cfg(unix)]
            Endpoint::Local(path) => {
                if std::path::Path::new(path).exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)?;
                if multiuser {
                    use std::os::unix::fs::PermissionsExt;
                    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))?;
                }
                Ok(PeerListener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            #[cfg(windows)]
            Endpoint::Local(path) => {
                // Multiuser ACLs on named pipes need a security
                // descriptor tokio does not expose; the option is a
                // no-op here.
                let _ = multiuser;
                let first = ServerOptions::new()
                    .first_pipe_instance(true)
                    .create(path)?;
                Ok(PeerListener::Pipe {
                    path: path.clone(),
                    next: Some(first),
                })
            }
        }
    }

    /// Accept a single connection.
    pub async fn accept(&mut self) -> io::Result<PeerStream> {
        match self {
            PeerListener::Tcp(listener) => {
                let (stream, _addr) = listener.accept().await?;
                Ok(PeerStream::Tcp(stream))
            }
            #[cfg(unix)]
            PeerListener::Unix { listener, .. } => {
                let (stream, _addr) = listener.accept().await?;
                Ok(PeerStream::Unix(stream))
            }
            #[cfg(windows)]
            PeerListener::Pipe { path, next } => {
                let server = match next.take() {
                    Some(server) => server,
                    None => ServerOptions::new().create(path.as_str())?,
                };
                server.connect().await?;
                // Pre-create the next instance so there is no window
                // with no listening pipe.
                *next = Some(ServerOptions::new().create(path.as_str())?);
                Ok(PeerStream::PipeServer(server))
            }
        }
    }
}

#[cfg(unix)]
impl Drop for PeerListener {
    fn drop(&mut self) {
        if let PeerListener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn unique_endpoint(tag: &str) -> Endpoint {
        Endpoint::local(&format!("framewire-stream-test-{}-{}", std::process::id(), tag))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_bind_accept_roundtrip() {
        let endpoint = unique_endpoint("roundtrip");
        let mut listener = PeerListener::bind(&endpoint, false).await.unwrap();

        let client = PeerStream::connect(&endpoint);
        let (accepted, connected) = tokio::join!(listener.accept(), client);
        let mut accepted = accepted.unwrap();
        let mut connected = connected.unwrap();

        connected.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stale_socket_file_removed_on_bind() {
        let endpoint = unique_endpoint("stale");
        let Endpoint::Local(path) = &endpoint else {
            unreachable!()
        };

        std::fs::write(path, b"stale").unwrap();
        let listener = PeerListener::bind(&endpoint, false).await.unwrap();
        drop(listener);

        // Drop cleans the socket file up again.
        assert!(!std::path::Path::new(path).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_multiuser_widens_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let endpoint = unique_endpoint("multiuser");
        let Endpoint::Local(path) = &endpoint else {
            unreachable!()
        };

        let _listener = PeerListener::bind(&endpoint, true).await.unwrap();
        let mode = std::fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o666);
    }

    #[tokio::test]
    async fn test_tcp_bind_rejects_invalid_port() {
        let err = PeerListener::bind(&Endpoint::tcp(":0"), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
