// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Active-message IDs and header codecs for the sender / scheduler /
// builder links. Every header is a packed little-endian sequence of
// u64 fields.

// 1. tssched (listen) <-> tsc_server sender (connect)
// sender -> tssched
/// header: sender_id (utf8), data: none
pub const AM_SENDER_REGISTER: u64 = 20;
/// header: {id, desc_size, content_size}, data: StDescriptor
pub const AM_SENDER_ANNOUNCE_ST: u64 = 21;
/// header: {id}, data: none
pub const AM_SENDER_RETRACT_ST: u64 = 22;
// tssched -> sender
/// header: {id}, data: none
pub const AM_SCHED_RELEASE_ST: u64 = 30;

// 2. tssched (listen) <-> tsbuild (connect)
// tsbuild -> tssched
/// header: builder_id (utf8), data: none
pub const AM_BUILDER_REGISTER: u64 = 40;
/// header: {bytes_available, bytes_processed}, data: none
pub const AM_BUILDER_STATUS: u64 = 41;
// tssched -> tsbuild
/// header: {id, desc_size, content_size}, data: TsCollectionDescriptor
pub const AM_SCHED_SEND_TS: u64 = 50;

// 3. tsc_server sender (listen) <-> tsbuild (connect)
// tsbuild -> sender
/// header: {id}, data: none
pub const AM_BUILDER_REQUEST_ST: u64 = 60;
// sender -> tsbuild
/// header: {id, desc_size, content_size}, data: {StDescriptor, content}
pub const AM_SENDER_SEND_ST: u64 = 70;

// 4. tsbuild distributor (listen) <-> item workers (connect)
// worker -> distributor
/// header: command text (`REGISTER ...` / `COMPLETE <id>`), data: none
pub const AM_WORKER_COMMAND: u64 = 90;
// distributor -> worker
/// header: `WORK_ITEM <id>`, data: optional payload
pub const AM_WORKER_ITEM: u64 = 91;
/// header: `HEARTBEAT`, data: none
pub const AM_WORKER_HEARTBEAT: u64 = 92;
/// header: `DISCONNECT`, data: none
pub const AM_WORKER_DISCONNECT: u64 = 93;

/// Pack u64 fields into a little-endian header.
pub fn pack_header(fields: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(fields.len() * 8);
    for f in fields {
        out.extend_from_slice(&f.to_le_bytes());
    }
    out
}

/// Unpack a header of exactly `n` u64 fields. Returns `None` on a length
/// mismatch (the frame is then ignored as a protocol violation).
pub fn unpack_header(bytes: &[u8], n: usize) -> Option<Vec<u64>> {
    if bytes.len() != n * 8 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect(),
    )
}
