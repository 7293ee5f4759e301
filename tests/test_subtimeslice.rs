// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Descriptor serialization: wire round trips, forward compatibility
// (trailing bytes), flags and size accounting.

use uuid::Uuid;

use tsbnet::subtimeslice::{
    st_flags, DataDescriptor, ShmIovec, StComponentDescriptor, StComponentHandle, StDescriptor,
    SubTimesliceHandle, TsCollectionDescriptor, TsCollectionEntry, WorkItemShm,
};

fn sample_descriptor() -> StDescriptor {
    StDescriptor {
        start_time_ns: 20_000_000,
        duration_ns: 10_000_000,
        flags: st_flags::OVERFLOW_FLIM,
        components: vec![
            StComponentDescriptor {
                descriptor: DataDescriptor { offset: 0, size: 352 },
                content: DataDescriptor {
                    offset: 352,
                    size: 704,
                },
                missing_microslices: false,
            },
            StComponentDescriptor {
                descriptor: DataDescriptor {
                    offset: 1056,
                    size: 320,
                },
                content: DataDescriptor {
                    offset: 1376,
                    size: 640,
                },
                missing_microslices: true,
            },
        ],
    }
}

#[test]
fn descriptor_round_trip() {
    let desc = sample_descriptor();
    let bytes = desc.to_bytes();
    let decoded = StDescriptor::from_bytes(&bytes).unwrap();
    assert_eq!(decoded, desc);
}

#[test]
fn decoder_tolerates_trailing_bytes() {
    let desc = sample_descriptor();
    let mut bytes = desc.to_bytes();
    bytes.extend_from_slice(&[0xAB; 16]);
    let decoded = StDescriptor::from_bytes(&bytes).unwrap();
    assert_eq!(decoded, desc);
}

#[test]
fn truncated_descriptor_is_an_error() {
    let bytes = sample_descriptor().to_bytes();
    assert!(StDescriptor::from_bytes(&bytes[..bytes.len() / 2]).is_err());
}

#[test]
fn descriptor_size_sums_components() {
    let desc = sample_descriptor();
    assert_eq!(desc.size(), 352 + 704 + 320 + 640);
}

#[test]
fn handle_id_and_flags() {
    let mut st = SubTimesliceHandle {
        start_time_ns: 120_000_000,
        duration_ns: 10_000_000,
        flags: 0,
        components: Vec::new(),
    };
    assert_eq!(st.ts_id(), 12);
    assert!(!st.has_flag(st_flags::INCOMPLETE));
    st.set_flag(st_flags::INCOMPLETE);
    assert!(st.has_flag(st_flags::INCOMPLETE));
    assert!(!st.has_flag(st_flags::OVERFLOW_FLIM));
}

#[test]
fn component_handle_sizes() {
    let c = StComponentHandle {
        descriptors: vec![
            ShmIovec {
                offset: 4096,
                len: 96,
            },
            ShmIovec {
                offset: 0,
                len: 64,
            },
        ],
        contents: vec![ShmIovec {
            offset: 8192,
            len: 1234,
        }],
        missing_microslices: false,
    };
    assert_eq!(c.descriptors_size(), 160);
    assert_eq!(c.num_microslices(), 5);
    assert_eq!(c.contents_size(), 1234);
}

#[test]
fn collection_descriptor_round_trip() {
    let collection = TsCollectionDescriptor {
        ts_id: 42,
        senders: vec![
            TsCollectionEntry {
                sender_id: "nodeA:13131".to_owned(),
                desc_size: 128,
                content_size: 4096,
            },
            TsCollectionEntry {
                sender_id: "nodeB:13131".to_owned(),
                desc_size: 160,
                content_size: 8192,
            },
        ],
    };
    assert_eq!(collection.total_size(), 128 + 4096 + 160 + 8192);
    let decoded = TsCollectionDescriptor::from_bytes(&collection.to_bytes()).unwrap();
    assert_eq!(decoded, collection);
}

#[test]
fn work_item_round_trip() {
    let item = WorkItemShm {
        shm_identifier: "tsbuild".to_owned(),
        shm_uuid: Uuid::new_v4(),
        offset: 8192,
        ts_desc: sample_descriptor(),
    };
    let decoded = WorkItemShm::from_bytes(&item.to_bytes()).unwrap();
    assert_eq!(decoded, item);
}
