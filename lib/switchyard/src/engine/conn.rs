// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The control connection to a datapath.

use crate::ofp::CodecError;
use crate::ofp::Header;
use crate::ofp::Message;
use crate::ofp::OFP_HEADER_LEN;
use crate::sync::Mutex;
use std::io;
use std::io::BufWriter;
use std::io::Read;
use std::io::Write;
use std::net::Shutdown;
use std::net::SocketAddr;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// A received message along with the header fields handlers care about.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Envelope {
    pub version: u8,
    pub xid: u32,
    pub msg: Message,
}

/// Something that can carry OpenFlow messages to and from a switch.
///
/// Sends are buffered; nothing is guaranteed to reach the switch until
/// [`Conn::flush`]. Concurrent handlers share one connection, so a
/// handler must send and flush its own messages before it returns.
pub trait Conn: Send + Sync {
    /// Block until the next message arrives.
    fn receive(&self) -> Result<Envelope, ConnError>;

    /// Queue `msg` with an explicit transaction ID.
    fn send_xid(&self, xid: u32, msg: &Message) -> Result<(), ConnError>;

    fn flush(&self) -> Result<(), ConnError>;

    /// Allocate a fresh transaction ID.
    fn next_xid(&self) -> u32;

    /// Close the connection, unblocking any pending `receive()`.
    fn close(&self);

    fn send(&self, msg: &Message) -> Result<(), ConnError> {
        self.send_xid(self.next_xid(), msg)
    }

    /// Queue every message in `msgs` and flush.
    fn send_all(&self, msgs: &[Message]) -> Result<(), ConnError> {
        for msg in msgs {
            self.send(msg)?;
        }
        self.flush()
    }
}

/// How handlers write back to the switch.
pub type ResponseWriter = Arc<dyn Conn>;

/// Transaction ID source; zero is skipped.
#[derive(Debug, Default)]
pub struct XidGen(AtomicU32);

impl XidGen {
    pub fn next(&self) -> u32 {
        loop {
            let xid = self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if xid != 0 {
                return xid;
            }
        }
    }
}

/// Read one framed message off a byte stream.
pub fn read_message<R: Read>(rdr: &mut R) -> Result<Envelope, ConnError> {
    let mut buf = vec![0u8; OFP_HEADER_LEN];
    match rdr.read_exact(&mut buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(ConnError::Closed);
        }
        Err(e) => return Err(e.into()),
    }

    // A bad header leaves the stream unframed, so it ends the connection.
    let hdr = Header::parse(&buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    buf.resize(usize::from(hdr.length), 0);
    rdr.read_exact(&mut buf[OFP_HEADER_LEN..])?;

    let (hdr, msg) = Message::decode(&buf)?;
    Ok(Envelope { version: hdr.version, xid: hdr.xid, msg })
}

/// A switch connected over TCP.
pub struct TcpConn {
    peer: SocketAddr,
    rdr: Mutex<TcpStream>,
    wtr: Mutex<BufWriter<TcpStream>>,
    xids: XidGen,
}

impl TcpConn {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let wtr = BufWriter::new(stream.try_clone()?);

        Ok(Self {
            peer,
            rdr: Mutex::new(stream),
            wtr: Mutex::new(wtr),
            xids: XidGen::default(),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Conn for TcpConn {
    fn receive(&self) -> Result<Envelope, ConnError> {
        let mut rdr = self.rdr.lock();
        read_message(&mut *rdr)
    }

    fn send_xid(&self, xid: u32, msg: &Message) -> Result<(), ConnError> {
        let bytes = msg.encode(xid)?;
        self.wtr.lock().write_all(&bytes)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), ConnError> {
        self.wtr.lock().flush()?;
        Ok(())
    }

    fn next_xid(&self) -> u32 {
        self.xids.next()
    }

    fn close(&self) {
        // The writer's clone shares the socket, so this also unblocks
        // a reader parked in receive().
        let _ = self.wtr.lock().get_ref().shutdown(Shutdown::Both);
    }
}

/// Swallows everything sent and has nothing to receive.
#[cfg(test)]
pub(crate) struct NullConn;

#[cfg(test)]
impl Conn for NullConn {
    fn receive(&self) -> Result<Envelope, ConnError> {
        Err(ConnError::Closed)
    }

    fn send_xid(&self, _: u32, _: &Message) -> Result<(), ConnError> {
        Ok(())
    }

    fn flush(&self) -> Result<(), ConnError> {
        Ok(())
    }

    fn next_xid(&self) -> u32 {
        1
    }

    fn close(&self) {}
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn xids_skip_zero() {
        let xids = XidGen(AtomicU32::new(u32::MAX - 1));
        assert_eq!(xids.next(), u32::MAX);
        assert_eq!(xids.next(), 1);
    }

    #[test]
    fn read_framed_messages() {
        let mut stream = Message::Hello.encode(1).unwrap();
        stream.extend(Message::EchoRequest(vec![7; 4]).encode(2).unwrap());
        let mut rdr = Cursor::new(stream);

        let env = read_message(&mut rdr).unwrap();
        assert_eq!(env.xid, 1);
        assert_eq!(env.msg, Message::Hello);

        let env = read_message(&mut rdr).unwrap();
        assert_eq!(env.xid, 2);
        assert_eq!(env.msg, Message::EchoRequest(vec![7; 4]));

        assert!(matches!(read_message(&mut rdr), Err(ConnError::Closed)));
    }

    #[test]
    fn short_body_is_an_error() {
        let bytes = Message::EchoRequest(vec![7; 4]).encode(2).unwrap();
        let mut rdr = Cursor::new(bytes[..10].to_vec());
        assert!(matches!(read_message(&mut rdr), Err(ConnError::Io(_))));
    }

    #[test]
    fn bad_body_keeps_stream_in_sync() {
        // A PACKET_IN too short for its fixed fields.
        let mut stream = vec![4, 10, 0, 12, 0, 0, 0, 9, 0, 0, 0, 0];
        stream.extend(Message::EchoRequest(vec![]).encode(3).unwrap());
        let mut rdr = Cursor::new(stream);

        assert!(matches!(read_message(&mut rdr), Err(ConnError::Codec(_))));
        let env = read_message(&mut rdr).unwrap();
        assert_eq!(env.xid, 3);
        assert_eq!(env.msg, Message::EchoRequest(vec![]));
    }

    #[test]
    fn bad_header_is_fatal() {
        let mut rdr = Cursor::new(vec![4, 2, 0, 4, 0, 0, 0, 1]);
        assert!(matches!(read_message(&mut rdr), Err(ConnError::Io(_))));
    }
}
