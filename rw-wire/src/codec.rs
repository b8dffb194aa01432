//! Binary codec for insert-stream payloads (inside a length-delimited frame).
//!
//! Layout: 8-byte header (u32 version, u8 kind, u8 flags, u16 reserved)
//! followed by the kind-specific body. Everything is little-endian.

use rw_tensor::{Dtype, Tensor};
use thiserror::Error;

use crate::protocol::{
    CellId, ChunkData, FlatColumn, InsertRequest, InsertResponse, ItemData, MsgKind,
    PrioritizedItem, SequenceRange, PROTOCOL_VERSION,
};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload too short")]
    TooShort,
    #[error("unsupported protocol version: {0}")]
    BadVersion(u32),
    #[error("unexpected message kind: {0}")]
    BadKind(u8),
    #[error("unknown dtype code: {0}")]
    BadDtype(u8),
    #[error("invalid boolean byte: {0}")]
    BadBool(u8),
    #[error("table name is not valid utf-8")]
    BadUtf8,
    #[error("tensor body is inconsistent: {0}")]
    BadTensor(#[from] rw_tensor::TensorError),
    #[error("trailing bytes after payload")]
    TrailingBytes,
}

pub fn encode_request(req: &InsertRequest) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    encode_request_into(&mut out, req);
    out
}

pub fn encode_request_into(out: &mut Vec<u8>, req: &InsertRequest) {
    out.clear();
    match req {
        InsertRequest::Chunk(chunk) => {
            put_header(out, MsgKind::Chunk);
            put_chunk(out, chunk);
        }
        InsertRequest::Item(item) => {
            put_header(out, MsgKind::Item);
            put_item(out, item);
        }
    }
}

pub fn decode_request(bytes: &[u8]) -> Result<InsertRequest, DecodeError> {
    let mut c = Cursor::new(bytes);
    let kind = take_header(&mut c)?;
    let req = match kind {
        k if k == MsgKind::Chunk as u8 => InsertRequest::Chunk(take_chunk(&mut c)?),
        k if k == MsgKind::Item as u8 => InsertRequest::Item(take_item(&mut c)?),
        k => return Err(DecodeError::BadKind(k)),
    };
    c.finish()?;
    Ok(req)
}

pub fn encode_response(resp: &InsertResponse) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    put_header(&mut out, MsgKind::Confirmation);
    out.extend_from_slice(&resp.key.to_le_bytes());
    out
}

pub fn decode_response(bytes: &[u8]) -> Result<InsertResponse, DecodeError> {
    let mut c = Cursor::new(bytes);
    let kind = take_header(&mut c)?;
    if kind != MsgKind::Confirmation as u8 {
        return Err(DecodeError::BadKind(kind));
    }
    let key = c.read_u64()?;
    c.finish()?;
    Ok(InsertResponse { key })
}

fn put_header(out: &mut Vec<u8>, kind: MsgKind) {
    out.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    out.push(kind as u8);
    out.push(0); // flags
    out.extend_from_slice(&[0, 0]); // reserved
}

fn take_header(c: &mut Cursor<'_>) -> Result<u8, DecodeError> {
    let version = c.read_u32()?;
    if version != PROTOCOL_VERSION {
        return Err(DecodeError::BadVersion(version));
    }
    let kind = c.read_u8()?;
    let _flags = c.read_u8()?;
    c.skip(2)?;
    Ok(kind)
}

fn put_chunk(out: &mut Vec<u8>, chunk: &ChunkData) {
    out.extend_from_slice(&chunk.chunk_key.to_le_bytes());
    out.extend_from_slice(&chunk.column.to_le_bytes());
    out.extend_from_slice(&chunk.sequence_range.episode_id.to_le_bytes());
    out.extend_from_slice(&chunk.sequence_range.start.to_le_bytes());
    out.extend_from_slice(&chunk.sequence_range.end.to_le_bytes());
    out.push(chunk.sequence_range.sparse as u8);
    put_tensor(out, &chunk.data);
}

fn take_chunk(c: &mut Cursor<'_>) -> Result<ChunkData, DecodeError> {
    let chunk_key = c.read_u64()?;
    let column = c.read_u32()?;
    let episode_id = c.read_u64()?;
    let start = c.read_u64()?;
    let end = c.read_u64()?;
    let sparse = c.read_bool()?;
    let data = take_tensor(c)?;
    Ok(ChunkData {
        chunk_key,
        column,
        sequence_range: SequenceRange {
            episode_id,
            start,
            end,
            sparse,
        },
        data,
    })
}

fn put_item(out: &mut Vec<u8>, item: &ItemData) {
    out.extend_from_slice(&item.item.key.to_le_bytes());
    put_string(out, &item.item.table);
    out.extend_from_slice(&item.item.priority.to_le_bytes());

    let columns = item.item.trajectory.len() as u32;
    out.extend_from_slice(&columns.to_le_bytes());
    for column in &item.item.trajectory {
        let cells = column.cells.len() as u32;
        out.extend_from_slice(&cells.to_le_bytes());
        for cell in &column.cells {
            out.extend_from_slice(&cell.chunk_key.to_le_bytes());
            out.extend_from_slice(&cell.offset.to_le_bytes());
        }
        out.push(column.squeeze as u8);
    }

    let keep = item.item.keep_chunk_keys.len() as u32;
    out.extend_from_slice(&keep.to_le_bytes());
    for key in &item.item.keep_chunk_keys {
        out.extend_from_slice(&key.to_le_bytes());
    }

    out.push(item.send_confirmation as u8);
}

fn take_item(c: &mut Cursor<'_>) -> Result<ItemData, DecodeError> {
    let key = c.read_u64()?;
    let table = take_string(c)?;
    let priority = f64::from_le_bytes(c.take(8)?.try_into().expect("8 bytes"));

    let columns = c.read_u32()? as usize;
    let mut trajectory = Vec::with_capacity(columns);
    for _ in 0..columns {
        let cells_len = c.read_u32()? as usize;
        let mut cells = Vec::with_capacity(cells_len);
        for _ in 0..cells_len {
            let chunk_key = c.read_u64()?;
            let offset = c.read_u32()?;
            cells.push(CellId { chunk_key, offset });
        }
        let squeeze = c.read_bool()?;
        trajectory.push(FlatColumn { cells, squeeze });
    }

    let keep_len = c.read_u32()? as usize;
    let mut keep_chunk_keys = Vec::with_capacity(keep_len);
    for _ in 0..keep_len {
        keep_chunk_keys.push(c.read_u64()?);
    }

    let send_confirmation = c.read_bool()?;
    Ok(ItemData {
        item: PrioritizedItem {
            key,
            table,
            priority,
            trajectory,
            keep_chunk_keys,
        },
        send_confirmation,
    })
}

fn put_tensor(out: &mut Vec<u8>, tensor: &Tensor) {
    out.push(dtype_code(tensor.dtype()));
    out.push(tensor.shape().len() as u8);
    for &dim in tensor.shape() {
        out.extend_from_slice(&(dim as u32).to_le_bytes());
    }
    let len = tensor.byte_len() as u32;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(tensor.data());
}

fn take_tensor(c: &mut Cursor<'_>) -> Result<Tensor, DecodeError> {
    let dtype = dtype_from_code(c.read_u8()?)?;
    let rank = c.read_u8()? as usize;
    let mut shape = Vec::with_capacity(rank);
    for _ in 0..rank {
        shape.push(c.read_u32()? as usize);
    }
    let len = c.read_u32()? as usize;
    let data = c.take(len)?.to_vec();
    Ok(Tensor::from_raw(dtype, shape, data)?)
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn take_string(c: &mut Cursor<'_>) -> Result<String, DecodeError> {
    let len = c.read_u32()? as usize;
    let bytes = c.take(len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::BadUtf8)
}

fn dtype_code(dtype: Dtype) -> u8 {
    match dtype {
        Dtype::BOOL => 1,
        Dtype::U8 => 2,
        Dtype::I8 => 3,
        Dtype::U16 => 4,
        Dtype::I16 => 5,
        Dtype::U32 => 6,
        Dtype::I32 => 7,
        Dtype::U64 => 8,
        Dtype::I64 => 9,
        Dtype::F16 => 10,
        Dtype::BF16 => 11,
        Dtype::F32 => 12,
        Dtype::F64 => 13,
        _ => 0,
    }
}

fn dtype_from_code(code: u8) -> Result<Dtype, DecodeError> {
    Ok(match code {
        1 => Dtype::BOOL,
        2 => Dtype::U8,
        3 => Dtype::I8,
        4 => Dtype::U16,
        5 => Dtype::I16,
        6 => Dtype::U32,
        7 => Dtype::I32,
        8 => Dtype::U64,
        9 => Dtype::I64,
        10 => Dtype::F16,
        11 => Dtype::BF16,
        12 => Dtype::F32,
        13 => Dtype::F64,
        other => return Err(DecodeError::BadDtype(other)),
    })
}

struct Cursor<'a> {
    bytes: &'a [u8],
    off: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, off: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.off + n > self.bytes.len() {
            return Err(DecodeError::TooShort);
        }
        let s = &self.bytes[self.off..self.off + n];
        self.off += n;
        Ok(s)
    }

    fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        self.take(n).map(|_| ())
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn read_bool(&mut self) -> Result<bool, DecodeError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::BadBool(other)),
        }
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes(b.try_into().expect("4 bytes")))
    }

    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().expect("8 bytes")))
    }

    fn finish(self) -> Result<(), DecodeError> {
        if self.off != self.bytes.len() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(())
    }
}
