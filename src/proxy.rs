//! Transparent TCP proxy towards the configured origin.

use std::io;

use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Proxies all traffic between the connection and the origin until both
/// directions close. The connection usually carries a replayed peek buffer,
/// so the origin sees the stream from its first byte. A failed dial is
/// reported; errors during the copy just end the session, matching how a
/// plain TCP middlebox behaves.
pub async fn proxy_connection<S>(mut conn: S, origin: &str) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut upstream = TcpStream::connect(origin).await?;
    let _ = copy_bidirectional(&mut conn, &mut upstream).await;
    Ok(())
}
