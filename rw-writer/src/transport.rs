//! TCP transport for the insert stream.
//!
//! Frames from `rw-wire` over a plain `TcpStream`. The socket is split with
//! `try_clone`: the write half sits behind a mutex (one message at a time from
//! the worker), the read half is owned by the confirmation reader.

use std::net::{Shutdown, TcpStream};
use std::sync::Mutex;

use rw_wire::{decode_response, encode_request_into, read_frame, write_frame, InsertRequest};

use crate::error::Status;
use crate::stream::{Connector, InsertStream};

pub struct TcpInsertStream {
    writer: Mutex<WriteHalf>,
    reader: Mutex<TcpStream>,
}

struct WriteHalf {
    stream: TcpStream,
    scratch: Vec<u8>,
}

impl InsertStream for TcpInsertStream {
    fn write(&self, request: &InsertRequest) -> bool {
        let mut half = self.writer.lock().unwrap();
        let WriteHalf { stream, scratch } = &mut *half;
        encode_request_into(scratch, request);
        write_frame(stream, scratch).is_ok()
    }

    fn read(&self) -> Option<u64> {
        let mut stream = self.reader.lock().unwrap();
        let payload = read_frame(&mut *stream).ok()?;
        decode_response(&payload).ok().map(|response| response.key)
    }

    fn finish(&self) -> Result<(), Status> {
        // TCP carries no terminal status; a broken socket is always worth a
        // reconnect attempt.
        Err(Status::Unavailable("insert stream disconnected".to_string()))
    }

    fn abort(&self) {
        let _ = self.writer.lock().unwrap().stream.shutdown(Shutdown::Both);
    }
}

/// Reconnects to a fixed address, re-resolving it on every attempt.
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Connector for TcpConnector {
    fn connect(&mut self) -> Result<std::sync::Arc<dyn InsertStream>, Status> {
        let stream = TcpStream::connect(&self.addr)
            .map_err(|e| Status::Unavailable(format!("failed to connect to {}: {e}", self.addr)))?;
        stream.set_nodelay(true).ok();
        let reader = stream
            .try_clone()
            .map_err(|e| Status::Unavailable(format!("failed to clone stream: {e}")))?;
        Ok(std::sync::Arc::new(TcpInsertStream {
            writer: Mutex::new(WriteHalf {
                stream,
                scratch: Vec::with_capacity(512),
            }),
            reader: Mutex::new(reader),
        }))
    }
}
