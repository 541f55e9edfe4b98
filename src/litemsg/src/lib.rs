//! Blocking, length-prefixed message exchange between two hosts.
//!
//! Every message is an 8-byte big endian length followed by a bincode payload.
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod retry;
pub mod utils;

pub use retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialize/Deserialize failed: {0}")]
    Codec(#[from] bincode::Error),
    #[error("Message too large: {0} bytes")]
    TooLarge(u64),
    #[error("Invalid node address: {0}")]
    InvalidNode(String),
    #[error("Gave up on {what} after {attempts} attempts: {last}")]
    Exhausted {
        what: String,
        attempts: usize,
        last: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Node {
    pub addr: String,
    pub port: u16,
}

impl Node {
    pub fn new(addr: &str, port: u16) -> Self {
        Node {
            addr: addr.to_owned(),
            port,
        }
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

impl std::str::FromStr for Node {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let (addr, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidNode(s.to_owned()))?;
        let port = port
            .parse()
            .map_err(|_| Error::InvalidNode(s.to_owned()))?;
        Ok(Node {
            addr: addr.to_owned(),
            port,
        })
    }
}

impl std::net::ToSocketAddrs for Node {
    type Iter = std::vec::IntoIter<std::net::SocketAddr>;
    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        (&*self.addr, self.port).to_socket_addrs()
    }
}
