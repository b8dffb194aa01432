use rw_tensor::{Dtype, Tensor};

use crate::codec::{
    decode_request, decode_response, encode_request, encode_response, DecodeError,
};
use crate::protocol::{
    CellId, ChunkData, FlatColumn, InsertRequest, InsertResponse, ItemData, PrioritizedItem,
    SequenceRange,
};

fn sample_chunk() -> InsertRequest {
    InsertRequest::Chunk(ChunkData {
        chunk_key: 0xDEAD_BEEF,
        column: 3,
        sequence_range: SequenceRange {
            episode_id: 42,
            start: 0,
            end: 8,
            sparse: true,
        },
        data: Tensor::from_slice::<i32>(vec![5, 1], &[0, 2, 4, 6, 8]).unwrap(),
    })
}

fn sample_item() -> InsertRequest {
    InsertRequest::Item(ItemData {
        item: PrioritizedItem {
            key: 7,
            table: "uniform".to_string(),
            priority: 1.5,
            trajectory: vec![
                FlatColumn {
                    cells: vec![
                        CellId {
                            chunk_key: 1,
                            offset: 0,
                        },
                        CellId {
                            chunk_key: 1,
                            offset: 1,
                        },
                    ],
                    squeeze: false,
                },
                FlatColumn {
                    cells: vec![CellId {
                        chunk_key: 2,
                        offset: 0,
                    }],
                    squeeze: true,
                },
            ],
            keep_chunk_keys: vec![1, 2],
        },
        send_confirmation: true,
    })
}

#[test]
fn chunk_roundtrip() {
    let req = sample_chunk();
    let got = decode_request(&encode_request(&req)).unwrap();
    assert_eq!(got, req);
}

#[test]
fn item_roundtrip() {
    let req = sample_item();
    let got = decode_request(&encode_request(&req)).unwrap();
    assert_eq!(got, req);
}

#[test]
fn confirmation_roundtrip() {
    let resp = InsertResponse { key: 99 };
    assert_eq!(decode_response(&encode_response(&resp)).unwrap(), resp);
}

#[test]
fn rejects_bad_version() {
    let mut bytes = encode_request(&sample_chunk());
    bytes[0] = 200;
    assert!(matches!(
        decode_request(&bytes),
        Err(DecodeError::BadVersion(200))
    ));
}

#[test]
fn rejects_unknown_kind() {
    let mut bytes = encode_request(&sample_chunk());
    bytes[4] = 77;
    assert!(matches!(
        decode_request(&bytes),
        Err(DecodeError::BadKind(77))
    ));
}

#[test]
fn rejects_truncated_payload() {
    let bytes = encode_request(&sample_item());
    assert!(matches!(
        decode_request(&bytes[..bytes.len() - 3]),
        Err(DecodeError::TooShort)
    ));
}

#[test]
fn rejects_trailing_bytes() {
    let mut bytes = encode_request(&sample_chunk());
    bytes.push(0);
    assert!(matches!(
        decode_request(&bytes),
        Err(DecodeError::TrailingBytes)
    ));
}

#[test]
fn response_kind_is_checked() {
    let bytes = encode_request(&sample_chunk());
    assert!(matches!(
        decode_response(&bytes),
        Err(DecodeError::BadKind(1))
    ));
}
