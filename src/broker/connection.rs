//! The stream abstraction a connection task reads/writes through, so the
//! accept loop can hand the same code path a `TcpStream` or a
//! `UnixStream` (spec §1's "sockets and named pipes alike").

use tokio::io::{AsyncRead, AsyncWrite};

/// Blanket seam: anything that's a splittable duplex byte stream qualifies.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Connection for T {}
