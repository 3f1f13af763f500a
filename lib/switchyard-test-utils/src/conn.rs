// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! An in-memory controller connection.
//!
//! Messages cross as encoded bytes, so everything a test sends or
//! receives goes through the real wire codec.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::mpsc::Sender;
use std::time::Duration;
use switchyard::engine::conn::Conn;
use switchyard::engine::conn::ConnError;
use switchyard::engine::conn::Envelope;
use switchyard::engine::conn::XidGen;
use switchyard::ofp::Message;
use switchyard::sync::Mutex;

const POLL: Duration = Duration::from_millis(20);

pub(crate) fn decode(buf: &[u8]) -> Result<Envelope, ConnError> {
    let (hdr, msg) = Message::decode(buf)?;
    Ok(Envelope { version: hdr.version, xid: hdr.xid, msg })
}

/// The controller's end of a channel pair.
pub struct ChanConn {
    rx: Mutex<Receiver<Vec<u8>>>,
    tx: Mutex<Option<Sender<Vec<u8>>>>,
    queued: Mutex<Vec<Vec<u8>>>,
    closed: AtomicBool,
    xids: XidGen,
}

impl ChanConn {
    pub fn new(rx: Receiver<Vec<u8>>, tx: Sender<Vec<u8>>) -> Self {
        Self {
            rx: Mutex::new(rx),
            tx: Mutex::new(Some(tx)),
            queued: Mutex::new(vec![]),
            closed: AtomicBool::new(false),
            xids: XidGen::default(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Conn for ChanConn {
    fn receive(&self) -> Result<Envelope, ConnError> {
        let rx = self.rx.lock();
        loop {
            if self.is_closed() {
                return Err(ConnError::Closed);
            }
            match rx.recv_timeout(POLL) {
                Ok(buf) => return decode(&buf),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(ConnError::Closed),
            }
        }
    }

    fn send_xid(&self, xid: u32, msg: &Message) -> Result<(), ConnError> {
        if self.is_closed() {
            return Err(ConnError::Closed);
        }
        self.queued.lock().push(msg.encode(xid)?);
        Ok(())
    }

    fn flush(&self) -> Result<(), ConnError> {
        let queued = std::mem::take(&mut *self.queued.lock());
        let tx = self.tx.lock();
        let tx = tx.as_ref().ok_or(ConnError::Closed)?;
        for buf in queued {
            tx.send(buf).map_err(|_| ConnError::Closed)?;
        }
        Ok(())
    }

    fn next_xid(&self) -> u32 {
        self.xids.next()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.tx.lock().take();
    }
}
