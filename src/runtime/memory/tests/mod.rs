//! Memory 单元测试
//!
//! 测试节点地址空间、跨步打包以及 pinned 段分配


use crate::runtime::memory::{
    pack_strided, strided_span, unpack_strided, AddressSpace, MemoryError, PinnedError,
    PinnedSegments, HEAP_BASE,
};

#[cfg(test)]
mod address_space_tests {
    use super::*;

    #[test]
    fn test_allocate_is_zeroed_and_page_aligned() {
        let space = AddressSpace::new();
        let a = space.allocate(100);
        let b = space.allocate(10);
        assert_eq!(a, HEAP_BASE);
        assert_eq!(b, HEAP_BASE + 4096);
        assert_eq!(space.read(a, 100).unwrap(), vec![0u8; 100]);
    }

    #[test]
    fn test_write_then_read() {
        let space = AddressSpace::new();
        let a = space.allocate(16);
        space.write(a + 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(space.read(a + 3, 6).unwrap(), vec![0, 1, 2, 3, 4, 0]);
    }

    #[test]
    fn test_out_of_bounds_access() {
        let space = AddressSpace::new();
        let a = space.allocate(16);
        assert_eq!(
            space.read(a + 8, 16),
            Err(MemoryError::Unmapped { addr: a + 8, len: 16 })
        );
        assert!(space.write(0x10, &[1]).is_err());
    }

    #[test]
    fn test_map_rejects_overlap() {
        let space = AddressSpace::new();
        space.map(0x8000, 0x1000).unwrap();
        assert!(space.map(0x8800, 0x100).is_err());
        assert!(space.map(0x7f00, 0x200).is_err());
        assert!(space.map(0x9000, 0x100).is_ok());
    }

    #[test]
    fn test_release() {
        let space = AddressSpace::new();
        let a = space.allocate(64);
        assert_eq!(space.release(a), Ok(64));
        assert_eq!(space.release(a), Err(MemoryError::NotAMapping(a)));
        assert!(!space.is_mapped(a, 1));
    }

    #[test]
    fn test_copy_inside_space() {
        let space = AddressSpace::new();
        let a = space.allocate(8);
        let b = space.allocate(8);
        space.write(a, b"abcdefgh").unwrap();
        space.copy(a, b, 8).unwrap();
        assert_eq!(space.read(b, 8).unwrap(), b"abcdefgh".to_vec());
    }

    #[test]
    fn test_fill_words() {
        let space = AddressSpace::new();
        let a = space.allocate(16);
        space.fill(a, 16, 4, 0xdead_beef).unwrap();
        let bytes = space.read(a, 16).unwrap();
        for word in bytes.chunks(4) {
            assert_eq!(word, 0xdead_beefu32.to_le_bytes());
        }

        space.fill(a, 3, 2, 0x0102).unwrap();
        assert_eq!(&space.read(a, 4).unwrap(), &[0x02, 0x01, 0xad, 0xde]);

        assert_eq!(space.fill(a, 16, 3, 0), Err(MemoryError::BadWordSize(3)));
    }
}

#[cfg(test)]
mod strided_tests {
    use super::*;

    #[test]
    fn test_strided_span() {
        assert_eq!(strided_span(8, 4, 16), Ok(56));
        assert_eq!(strided_span(8, 1, 0), Ok(8));
        assert_eq!(strided_span(8, 0, 16), Ok(0));
        assert!(strided_span(16, 2, 8).is_err());
    }

    #[test]
    fn test_pack_unpack_count4_size8_ld16() {
        let source: Vec<u8> = (0..64u8).collect();
        let packed = pack_strided(&source, 8, 4, 16);
        assert_eq!(packed.len(), 32);
        assert_eq!(&packed[0..8], &source[0..8]);
        assert_eq!(&packed[8..16], &source[16..24]);
        assert_eq!(&packed[24..32], &source[48..56]);

        let mut dest = vec![0xffu8; 64];
        unpack_strided(&mut dest, &packed, 8, 4, 16);
        for row in 0..4 {
            let at = row * 16;
            assert_eq!(&dest[at..at + 8], &source[at..at + 8]);
            assert!(dest[at + 8..at + 16].iter().all(|&b| b == 0xff));
        }
    }

    #[test]
    fn test_space_strided_round_trip() {
        let space = AddressSpace::new();
        let src = space.allocate(64);
        let dst = space.allocate(64);
        let pattern: Vec<u8> = (1..=64u8).collect();
        space.write(src, &pattern).unwrap();

        let packed = space.read_strided(src, 8, 4, 16).unwrap();
        space.write_strided(dst, &packed, 8, 4, 16).unwrap();

        let copied = space.read(dst, 64).unwrap();
        for (i, byte) in copied.iter().enumerate() {
            if i % 16 < 8 && i < 56 {
                assert_eq!(*byte, pattern[i]);
            } else {
                assert_eq!(*byte, 0);
            }
        }
    }

    #[test]
    fn test_write_strided_short_buffer() {
        let space = AddressSpace::new();
        let dst = space.allocate(64);
        assert_eq!(
            space.write_strided(dst, &[0u8; 8], 8, 4, 16),
            Err(MemoryError::ShortBuffer {
                expected: 32,
                actual: 8
            })
        );
    }
}

#[cfg(test)]
mod pinned_tests {
    use super::*;

    const SEGMENTS: [(u64, usize); 2] = [(0x10_0000, 0x1_0000), (0x20_0000, 0x1_0000)];

    #[test]
    fn test_master_owns_remote_halves() {
        let pinned = PinnedSegments::new(0, &SEGMENTS).unwrap();
        assert!(pinned.is_master());
        let capacity = pinned.with_remote(1, |a| (a.base(), a.capacity())).unwrap();
        assert_eq!(capacity, (0x20_0000, 0x8000));
        let pack = pinned.with_pack(|a| (a.base(), a.capacity()));
        assert_eq!(pack, (0x10_8000, 0x8000));
    }

    #[test]
    fn test_slave_has_no_remote_allocators() {
        let pinned = PinnedSegments::new(1, &SEGMENTS).unwrap();
        assert_eq!(pinned.try_allocate(0, 16), Err(PinnedError::NotMaster));
        let pack = pinned.with_pack(|a| a.base());
        assert_eq!(pack, 0x20_8000);
    }

    #[test]
    fn test_blocking_allocation_polls_until_free() {
        let pinned = PinnedSegments::new(0, &SEGMENTS).unwrap();
        let first = pinned.allocate_blocking(1, 0x8000, || {}).unwrap();

        let mut polls = 0;
        let second = pinned
            .allocate_blocking(1, 0x100, || {
                polls += 1;
                if polls == 3 {
                    pinned.free(1, first).unwrap();
                }
            })
            .unwrap();
        assert_eq!(polls, 3);
        assert_eq!(second, first);
    }

    #[test]
    fn test_impossible_requests_fail_fast() {
        let pinned = PinnedSegments::new(0, &SEGMENTS).unwrap();
        assert_eq!(
            pinned.allocate_blocking(1, 0x8001, || panic!("must not poll")),
            Err(PinnedError::TooLarge {
                size: 0x8001,
                capacity: 0x8000
            })
        );
        assert_eq!(pinned.pack_allocate_blocking(0, || {}), Err(PinnedError::Empty));
        assert_eq!(pinned.try_allocate(5, 1), Err(PinnedError::UnknownNode(5)));
    }
}
