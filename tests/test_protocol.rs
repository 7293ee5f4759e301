// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Header packing for the active-message protocol.

use tsbnet::protocol::{pack_header, unpack_header};

#[test]
fn pack_is_little_endian() {
    let bytes = pack_header(&[0x0102_0304_0506_0708]);
    assert_eq!(bytes, vec![0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
}

#[test]
fn round_trip_multiple_fields() {
    let fields = [42u64, u64::MAX, 0];
    let bytes = pack_header(&fields);
    assert_eq!(bytes.len(), 24);
    let decoded = unpack_header(&bytes, 3).unwrap();
    assert_eq!(decoded, fields);
}

#[test]
fn unpack_rejects_length_mismatch() {
    let bytes = pack_header(&[1, 2]);
    assert!(unpack_header(&bytes, 1).is_none());
    assert!(unpack_header(&bytes, 3).is_none());
    assert!(unpack_header(&bytes[..15], 2).is_none());
}

#[test]
fn empty_header() {
    assert_eq!(pack_header(&[]), Vec::<u8>::new());
    assert_eq!(unpack_header(&[], 0), Some(vec![]));
}
