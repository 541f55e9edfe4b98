use crate::{Error, Node, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::convert::TryInto;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};

/// Refuse to allocate for absurd lengths coming off the wire.
pub const MAX_MESSAGE_LEN: u64 = 1 << 20;

pub fn read_be_u64(input: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&input[..8]);
    u64::from_be_bytes(buf)
}

// These APIs below require a socket in blocking state

pub fn read_payload_len<R: Read>(stream: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    stream.read_exact(&mut buf)?;
    Ok(read_be_u64(&buf))
}

pub fn recv_message_sync<R: Read>(stream: &mut R) -> Result<Vec<u8>> {
    let payload_len = read_payload_len(stream)?;
    if payload_len > MAX_MESSAGE_LEN {
        return Err(Error::TooLarge(payload_len));
    }
    let mut buf = vec![0u8; payload_len.try_into().map_err(|_| Error::TooLarge(payload_len))?];
    stream.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn send_message_sync<W: Write>(stream: &mut W, buf: &[u8]) -> Result<()> {
    let len_buf = (buf.len() as u64).to_be_bytes();
    stream.write_all(&len_buf)?;
    stream.write_all(buf)?;
    stream.flush()?;
    Ok(())
}

pub fn recv_cmd_sync<T: DeserializeOwned, R: Read>(stream: &mut R) -> Result<T> {
    let buf = recv_message_sync(stream)?;
    let cmd = bincode::deserialize(&buf)?;
    Ok(cmd)
}

pub fn send_cmd_sync<W: Write>(stream: &mut W, cmd: &impl Serialize) -> Result<()> {
    let buf = bincode::serialize(cmd)?;
    send_message_sync(stream, &buf)
}

/// Send one request and block for its response.
pub fn call_sync<T: DeserializeOwned>(stream: &mut TcpStream, req: &impl Serialize) -> Result<T> {
    send_cmd_sync(stream, req)?;
    recv_cmd_sync(stream)
}

/// One connection attempt to any address `node` resolves to.
pub fn connect_once(node: &Node, timeout: std::time::Duration) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in node.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err
        .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, node.to_string()))
        .into())
}
