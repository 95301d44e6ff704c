use super::{BLOCK_SIZE, FsError, MAX_FILE_SIZE, OpenFlags, UserFs};

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn open_without_create_requires_existing_file() {
    let mut fs = UserFs::new();
    assert_eq!(fs.open("missing", OpenFlags::empty()), Err(FsError::NoFile));
    let fd = fs.open("missing", OpenFlags::CREATE).unwrap();
    fs.close(fd).unwrap();
    assert!(fs.open("missing", OpenFlags::empty()).is_ok());
}

#[test]
fn write_then_reopen_roundtrip() {
    // Sizes chosen around the block boundary.
    for len in [0usize, 1, 511, 512, 513, 3 * BLOCK_SIZE + 17] {
        let mut fs = UserFs::new();
        let data = pattern(len);
        let fd = fs.open("f", OpenFlags::CREATE).unwrap();
        assert_eq!(fs.write(fd, &data), Ok(len));
        fs.close(fd).unwrap();

        let fd = fs.open("f", OpenFlags::empty()).unwrap();
        let mut back = vec![0; len + 64];
        let read = fs.read(fd, &mut back).unwrap();
        assert_eq!(read, len);
        assert_eq!(&back[..read], &data[..]);
        assert_eq!(fs.read(fd, &mut back), Ok(0), "position is at end of file");
    }
}

#[test]
fn read_crosses_block_boundaries_in_small_chunks() {
    let mut fs = UserFs::new();
    let data = pattern(2 * BLOCK_SIZE + 100);
    let fd = fs.open("f", OpenFlags::CREATE).unwrap();
    fs.write(fd, &data).unwrap();
    fs.close(fd).unwrap();

    let fd = fs.open("f", OpenFlags::empty()).unwrap();
    let mut collected = Vec::new();
    let mut chunk = [0u8; 77];
    loop {
        let n = fs.read(fd, &mut chunk).unwrap();
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(collected, data);
}

#[test]
fn descriptors_share_file_contents() {
    let mut fs = UserFs::new();
    let writer = fs.open("shared", OpenFlags::CREATE).unwrap();
    let reader = fs.open("shared", OpenFlags::empty()).unwrap();
    fs.write(writer, b"hello").unwrap();

    let mut buf = [0u8; 16];
    assert_eq!(fs.read(reader, &mut buf), Ok(5));
    assert_eq!(&buf[..5], b"hello");
}

#[test]
fn access_mode_is_enforced() {
    let mut fs = UserFs::new();
    let seed = fs.open("f", OpenFlags::CREATE).unwrap();
    fs.write(seed, b"data").unwrap();
    fs.close(seed).unwrap();

    let ro = fs.open("f", OpenFlags::READ_ONLY).unwrap();
    assert_eq!(fs.write(ro, b"x"), Err(FsError::NoPermission));
    assert_eq!(fs.resize(ro, 0), Err(FsError::NoPermission));

    let wo = fs.open("f", OpenFlags::WRITE_ONLY).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(fs.read(wo, &mut buf), Err(FsError::NoPermission));
    assert_eq!(fs.write(wo, b"x"), Ok(1));

    // Zero-length transfers short-circuit before the permission check.
    assert_eq!(fs.write(ro, b""), Ok(0));
    assert_eq!(fs.read(wo, &mut []), Ok(0));
}

#[test]
fn bad_descriptors_are_rejected() {
    let mut fs = UserFs::new();
    let mut buf = [0u8; 1];
    assert_eq!(fs.read(0, &mut buf), Err(FsError::NoFile));
    let fd = fs.open("f", OpenFlags::CREATE).unwrap();
    fs.close(fd).unwrap();
    assert_eq!(fs.write(fd, b"x"), Err(FsError::NoFile));
    assert_eq!(fs.close(fd), Err(FsError::NoFile));
}

#[test]
fn descriptor_slots_are_reused() {
    let mut fs = UserFs::new();
    let a = fs.open("a", OpenFlags::CREATE).unwrap();
    let b = fs.open("b", OpenFlags::CREATE).unwrap();
    assert_eq!((a, b), (0, 1));
    fs.close(a).unwrap();
    assert_eq!(fs.open("c", OpenFlags::CREATE), Ok(0));
    assert_eq!(fs.open("d", OpenFlags::CREATE), Ok(2));
}

#[test]
fn delete_unlinks_but_open_descriptor_survives() {
    let mut fs = UserFs::new();
    let writer = fs.open("doomed", OpenFlags::CREATE).unwrap();
    let reader = fs.open("doomed", OpenFlags::empty()).unwrap();
    fs.write(writer, b"still here").unwrap();
    fs.delete("doomed").unwrap();

    // The name is gone immediately...
    assert_eq!(fs.open("doomed", OpenFlags::empty()), Err(FsError::NoFile));
    assert_eq!(fs.delete("doomed"), Err(FsError::NoFile));

    // ...and a CREATE open produces a fresh, empty file under the old name.
    let fresh = fs.open("doomed", OpenFlags::CREATE).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(fs.read(fresh, &mut buf), Ok(0), "recreated file is empty");

    // The descriptors opened before the delete still see the old contents.
    let n = fs.read(reader, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"still here");
}

#[test]
fn write_stops_at_size_cap() {
    let mut fs = UserFs::new();
    let fd = fs.open("big", OpenFlags::CREATE).unwrap();
    let chunk = vec![0xA5u8; 1024 * 1024];
    for _ in 0..100 {
        assert_eq!(fs.write(fd, &chunk), Ok(chunk.len()));
    }
    // The file sits exactly at the cap now; one more byte is refused.
    assert_eq!(fs.write(fd, b"x"), Err(FsError::NoMem));
}

#[test]
fn straddling_write_is_truncated_at_the_cap() {
    let mut fs = UserFs::new();
    let fd = fs.open("big", OpenFlags::CREATE).unwrap();
    let fill = vec![1u8; MAX_FILE_SIZE - 10];
    assert_eq!(fs.write(fd, &fill), Ok(fill.len()));
    drop(fill);
    assert_eq!(fs.write(fd, &[2u8; 20]), Err(FsError::NoMem));

    // The ten bytes below the cap were kept: drain the file in 4 MiB
    // chunks (the cap is a whole multiple) and inspect the final chunk.
    let reader = fs.open("big", OpenFlags::empty()).unwrap();
    let mut drained = 0usize;
    let mut sink = vec![0u8; 4 * 1024 * 1024];
    loop {
        let n = fs.read(reader, &mut sink).unwrap();
        if n == 0 {
            break;
        }
        drained += n;
    }
    assert_eq!(drained, MAX_FILE_SIZE);
    assert!(sink.ends_with(&[2u8; 10]));
    assert_eq!(sink[sink.len() - 11], 1);
}

#[test]
fn resize_grow_does_not_extend_visible_size() {
    let mut fs = UserFs::new();
    let fd = fs.open("f", OpenFlags::CREATE).unwrap();
    fs.write(fd, b"0123456789").unwrap();
    fs.resize(fd, 8 * BLOCK_SIZE).unwrap();

    let reader = fs.open("f", OpenFlags::empty()).unwrap();
    let mut buf = [0u8; 64];
    assert_eq!(fs.read(reader, &mut buf), Ok(10));
    assert_eq!(fs.read(reader, &mut buf), Ok(0));

    // A write still extends the file from its logical end.
    fs.write(fd, b"ab").unwrap();
    assert_eq!(fs.read(reader, &mut buf), Ok(2));
    assert_eq!(&buf[..2], b"ab");
}

#[test]
fn resize_shrink_truncates_and_rewinds_lazily() {
    let mut fs = UserFs::new();
    let fd = fs.open("f", OpenFlags::CREATE).unwrap();
    let data = pattern(3 * BLOCK_SIZE);
    fs.write(fd, &data).unwrap();

    let reader = fs.open("f", OpenFlags::empty()).unwrap();
    fs.resize(fd, 100).unwrap();

    let mut buf = vec![0u8; 4 * BLOCK_SIZE];
    assert_eq!(fs.read(reader, &mut buf), Ok(100));
    assert_eq!(&buf[..100], &data[..100]);

    // The writer's position (3 blocks in) is rewound to the new end.
    fs.write(fd, b"xy").unwrap();
    assert_eq!(fs.read(reader, &mut buf), Ok(2));
    assert_eq!(&buf[..2], b"xy");
}

#[test]
fn resize_to_zero_then_read_returns_nothing() {
    let mut fs = UserFs::new();
    let fd = fs.open("f", OpenFlags::CREATE).unwrap();
    fs.write(fd, &pattern(1000)).unwrap();
    fs.resize(fd, 0).unwrap();

    let reader = fs.open("f", OpenFlags::empty()).unwrap();
    let mut buf = [0u8; 64];
    assert_eq!(fs.read(reader, &mut buf), Ok(0));
}

#[test]
fn resize_past_cap_is_rejected() {
    let mut fs = UserFs::new();
    let fd = fs.open("f", OpenFlags::CREATE).unwrap();
    assert_eq!(fs.resize(fd, MAX_FILE_SIZE + 1), Err(FsError::NoMem));
    assert_eq!(fs.resize(fd, MAX_FILE_SIZE), Ok(()));
}

#[test]
fn clear_drops_every_file_and_descriptor() {
    let mut fs = UserFs::new();
    let fd = fs.open("a", OpenFlags::CREATE).unwrap();
    fs.open("b", OpenFlags::CREATE).unwrap();
    fs.clear();
    assert_eq!(fs.write(fd, b"x"), Err(FsError::NoFile));
    assert_eq!(fs.open("a", OpenFlags::empty()), Err(FsError::NoFile));
}
