//! TCP bind/connect helpers and length-prefixed frame read/write.

use std::marker::Unpin;
use std::net::SocketAddr;

use crate::utils::KikuError;

use serde::Serialize;
use serde::de::DeserializeOwned;

use rmp_serde::encode::to_vec as encode_to_vec;
use rmp_serde::decode::from_slice as decode_from_slice;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

/// Upper bound on a single frame's body length, guarding against garbage
/// length headers from a misbehaving connection.
const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

/// Sends an object of type `T` through writable connection `conn_write` as
/// one frame: an 8-byte big-endian length header followed by the MessagePack
/// encoded body.
pub(crate) async fn write_frame<T, Conn>(
    conn_write: &mut Conn,
    obj: &T,
) -> Result<(), KikuError>
where
    T: Serialize,
    Conn: AsyncWrite + Unpin,
{
    let obj_bytes = encode_to_vec(obj)?;
    conn_write.write_u64(obj_bytes.len() as u64).await?; // send length first
    conn_write.write_all(&obj_bytes[..]).await?;
    conn_write.flush().await?;
    Ok(())
}

/// Receives an object of type `T` from readable connection `conn_read`,
/// expecting the framing produced by `write_frame()`.
pub(crate) async fn read_frame<T, Conn>(
    conn_read: &mut Conn,
) -> Result<T, KikuError>
where
    T: DeserializeOwned,
    Conn: AsyncRead + Unpin,
{
    let obj_len = conn_read.read_u64().await?; // receive length first
    if obj_len > MAX_FRAME_LEN {
        return Err(KikuError(format!("frame length {} too large", obj_len)));
    }
    let mut obj_buf: Vec<u8> = vec![0; obj_len as usize];
    conn_read.read_exact(&mut obj_buf[..]).await?;
    let obj = decode_from_slice(&obj_buf)?;
    Ok(obj)
}

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, KikuError> {
    loop {
        let socket = if bind_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;

        let bound = socket.bind(bind_addr).and_then(|_| socket.listen(1024));
        match bound {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

/// Wrapper over tokio `TcpStream::connect()` that provides a retrying logic.
pub(crate) async fn tcp_connect_with_retry(
    conn_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpStream, KikuError> {
    loop {
        match TcpStream::connect(conn_addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
