// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::sync::{Arc, Barrier};

use threadfs_core::{
    Bridge, FaultInjector, FaultOp, FaultPolicy, FaultRule, FaultyBackend, FsConfig, MemoryBackend,
};
use threadfs_posix::abi::unpack_dirents;
use threadfs_posix::{errno, Errno, Posix, UtimBuf, UNCHANGED_ID};

fn posix() -> Posix {
    posix_with(FsConfig::default())
}

fn posix_with(config: FsConfig) -> Posix {
    Posix::new(Bridge::spawn(config, MemoryBackend::new).expect("spawn"))
}

fn create(posix: &Posix, path: &str, mode: u32) -> i32 {
    posix.open(path, libc::O_RDWR | libc::O_CREAT, mode).expect("create")
}

fn err(code: i32) -> Errno {
    Errno(code)
}

#[test]
fn readlink_truncates_without_a_terminator() {
    let fs = posix();
    fs.symlink("abcdefgh", "/l").unwrap();

    let mut short = [0xffu8; 3];
    assert_eq!(fs.readlink("/l", &mut short), Ok(3));
    assert_eq!(&short, b"abc");

    let mut long = [0xffu8; 16];
    assert_eq!(fs.readlink("/l", &mut long), Ok(8));
    assert_eq!(&long[..8], b"abcdefgh");
    assert_eq!(long[8], 0xff);
}

#[test]
fn readlink_rejects_empty_buffers_and_non_links() {
    let fs = posix();
    fs.symlink("t", "/l").unwrap();
    fs.mkdir("/d", 0o755).unwrap();

    assert_eq!(fs.readlink("/l", &mut []), Err(err(libc::EINVAL)));
    assert_eq!(errno(), libc::EINVAL);
    assert_eq!(fs.readlink("/d", &mut [0u8; 8]), Err(err(libc::EINVAL)));
    assert_eq!(fs.readlink("/missing", &mut [0u8; 8]), Err(err(libc::ENOENT)));
    assert_eq!(errno(), libc::ENOENT);
}

#[test]
fn symlink_targets_are_stored_verbatim() {
    let fs = posix();
    let targets = ["../x/./y//z", "nowhere/../../q", "/abs/olute/", "plain"];
    for (i, target) in targets.iter().enumerate() {
        let link = format!("/link{i}");
        fs.symlink(target, &link).unwrap();
        let mut buf = [0u8; 64];
        let n = fs.readlink(&link, &mut buf).unwrap();
        assert_eq!(&buf[..n], target.as_bytes());
    }
    assert_eq!(fs.symlink("other", "/link0"), Err(err(libc::EEXIST)));
    assert_eq!(fs.stat("/link1"), Err(err(libc::ENOENT)));
}

#[test]
fn symlink_loops_report_eloop() {
    let fs = posix();
    fs.symlink("/b", "/a").unwrap();
    fs.symlink("/a", "/b").unwrap();
    assert_eq!(fs.stat("/a"), Err(err(libc::ELOOP)));
    assert!(fs.lstat("/a").is_ok());
}

#[test]
fn owner_sets_times_on_a_read_only_file() {
    let fs = posix();
    let fd = create(&fs, "/ro", 0o444);
    fs.close(fd).unwrap();

    let times = UtimBuf {
        actime: 1_234_567,
        modtime: 1_234_567,
    };
    fs.utime("/ro", Some(&times)).unwrap();
    let st = fs.stat("/ro").unwrap();
    assert_eq!(st.st_atime, 1_234_567);
    assert_eq!(st.st_mtime, 1_234_567);
    assert_eq!(st.st_mode & 0o777, 0o444);
}

#[test]
fn non_owner_needs_write_permission_for_current_time_only() {
    let mut config = FsConfig::default();
    config.security.root_uid = 0;
    config.security.root_mode = 0o777;
    let fs = posix_with(config);
    let explicit = UtimBuf {
        actime: 10,
        modtime: 20,
    };
    assert_eq!(fs.utime("/", Some(&explicit)), Err(err(libc::EACCES)));
    fs.utime("/", None).unwrap();

    let mut config = FsConfig::default();
    config.security.root_uid = 0;
    config.security.root_mode = 0o755;
    let fs = posix_with(config);
    assert_eq!(fs.utime("/", None), Err(err(libc::EACCES)));
    assert_eq!(fs.mkdir("/x", 0o755), Err(err(libc::EACCES)));
}

#[test]
fn invalid_arguments_never_reach_the_storage_thread() {
    let fs = posix();
    assert_eq!(fs.stat(""), Err(err(libc::ENOENT)));
    assert_eq!(fs.mkdir("bad\0name", 0o755), Err(err(libc::EINVAL)));
    assert_eq!(fs.read(-1, &mut [0u8; 4]), Err(err(libc::EBADF)));
    assert_eq!(fs.truncate("/f", -1), Err(err(libc::EINVAL)));
    assert_eq!(fs.pread(3, &mut [0u8; 4], -5), Err(err(libc::EINVAL)));
    assert_eq!(fs.open("/f", libc::O_ACCMODE, 0), Err(err(libc::EINVAL)));
    assert_eq!(fs.lseek(3, 0, 99), Err(err(libc::EINVAL)));
    assert_eq!(fs.access("/", 0o10), Err(err(libc::EINVAL)));
    assert_eq!(fs.getcwd(&mut []), Err(err(libc::EINVAL)));
    assert_eq!(fs.bridge().stats().submitted, 0);
}

#[test]
fn file_io_round_trip() {
    let fs = posix();
    let fd = create(&fs, "/f", 0o644);
    assert!(fd >= 3);
    assert_eq!(fs.write(fd, b"hello world"), Ok(11));
    assert_eq!(fs.lseek(fd, 0, libc::SEEK_SET), Ok(0));

    let mut buf = [0u8; 5];
    assert_eq!(fs.read(fd, &mut buf), Ok(5));
    assert_eq!(&buf, b"hello");
    assert_eq!(fs.pread(fd, &mut buf, 6), Ok(5));
    assert_eq!(&buf, b"world");
    assert_eq!(fs.pwrite(fd, b"W", 6), Ok(1));
    assert_eq!(fs.lseek(fd, 0, libc::SEEK_END), Ok(11));
    assert_eq!(fs.fstat(fd).unwrap().st_size, 11);
    fs.fsync(fd).unwrap();
    fs.close(fd).unwrap();
    assert_eq!(fs.read(fd, &mut buf), Err(err(libc::EBADF)));

    let fd = fs.open("/f", libc::O_RDONLY, 0).unwrap();
    let mut all = [0u8; 32];
    assert_eq!(fs.read(fd, &mut all), Ok(11));
    assert_eq!(&all[..11], b"hello World");
    assert_eq!(fs.write(fd, b"x"), Err(err(libc::EBADF)));
    fs.close(fd).unwrap();

    let fd = fs.open("/f", libc::O_WRONLY | libc::O_TRUNC, 0).unwrap();
    assert_eq!(fs.fstat(fd).unwrap().st_size, 0);
    fs.close(fd).unwrap();
    assert_eq!(fs.open("/f", libc::O_RDWR | libc::O_CREAT | libc::O_EXCL, 0o644), Err(err(libc::EEXIST)));
}

#[test]
fn unlinked_open_file_stays_readable_until_closed() {
    let fs = posix();
    let fd = create(&fs, "/tmpfile", 0o600);
    fs.write(fd, b"still here").unwrap();
    fs.unlink("/tmpfile").unwrap();
    assert_eq!(fs.stat("/tmpfile"), Err(err(libc::ENOENT)));

    let mut buf = [0u8; 16];
    assert_eq!(fs.pread(fd, &mut buf, 0), Ok(10));
    assert_eq!(&buf[..10], b"still here");
    assert_eq!(fs.fstat(fd).unwrap().st_nlink, 0);
    fs.close(fd).unwrap();
}

#[test]
fn namespace_errors_map_to_errno() {
    let fs = posix();
    fs.mkdir("/p", 0o755).unwrap();
    fs.mkdir("/p/q", 0o755).unwrap();
    let fd = create(&fs, "/file", 0o644);
    fs.close(fd).unwrap();

    assert_eq!(fs.mkdir("/p", 0o755), Err(err(libc::EEXIST)));
    assert_eq!(fs.rmdir("/p"), Err(err(libc::ENOTEMPTY)));
    assert_eq!(fs.mkdir("/file/sub", 0o755), Err(err(libc::ENOTDIR)));
    assert_eq!(fs.unlink("/p"), Err(err(libc::EISDIR)));
    assert_eq!(fs.rename("/p", "/p/q/inside"), Err(err(libc::EINVAL)));

    fs.rename("/file", "/p/moved").unwrap();
    assert!(fs.stat("/p/moved").is_ok());
    assert_eq!(fs.stat("/file"), Err(err(libc::ENOENT)));
}

#[test]
fn attribute_calls() {
    let fs = posix();
    let fd = create(&fs, "/f", 0o644);
    fs.write(fd, b"abcdef").unwrap();
    fs.close(fd).unwrap();

    fs.chmod("/f", 0o600).unwrap();
    assert_eq!(fs.stat("/f").unwrap().st_mode & 0o7777, 0o600);
    fs.access("/f", libc::R_OK | libc::W_OK).unwrap();
    assert_eq!(fs.access("/f", libc::X_OK), Err(err(libc::EACCES)));
    fs.access("/f", libc::F_OK).unwrap();

    fs.truncate("/f", 2).unwrap();
    assert_eq!(fs.stat("/f").unwrap().st_size, 2);

    fs.chown("/f", UNCHANGED_ID, UNCHANGED_ID).unwrap();
    assert_eq!(fs.chown("/f", 4242, UNCHANGED_ID), Err(err(libc::EACCES)));

    let fd = fs.open("/f", libc::O_RDWR, 0).unwrap();
    fs.fchmod(fd, 0o640).unwrap();
    fs.ftruncate(fd, 0).unwrap();
    let st = fs.fstat(fd).unwrap();
    assert_eq!((st.st_mode & 0o7777, st.st_size), (0o640, 0));
    fs.close(fd).unwrap();
}

#[test]
fn ownership_calls_for_links_and_descriptors() {
    let mut config = FsConfig::default();
    config.security.uid = 0;
    config.security.gid = 0;
    let fs = posix_with(config);
    let fd = create(&fs, "/f", 0o644);
    fs.symlink("/f", "/l").unwrap();

    fs.lchown("/l", 7, 8).unwrap();
    let link = fs.lstat("/l").unwrap();
    assert_eq!((link.st_uid, link.st_gid), (7, 8));
    assert_eq!(fs.stat("/l").unwrap().st_uid, 0);

    fs.fchown(fd, UNCHANGED_ID, 5).unwrap();
    let st = fs.fstat(fd).unwrap();
    assert_eq!((st.st_uid, st.st_gid), (0, 5));
    assert_eq!(fs.fchown(-1, 1, 1), Err(err(libc::EBADF)));
    assert_eq!(fs.lchown("", 1, 1), Err(err(libc::ENOENT)));
    fs.close(fd).unwrap();
}

#[test]
fn fcntl_reads_status_flags_and_toggles_append() {
    let fs = posix();
    let fd = create(&fs, "/f", 0o644);
    fs.write(fd, b"head").unwrap();
    fs.lseek(fd, 0, libc::SEEK_SET).unwrap();

    assert_eq!(fs.fcntl(fd, libc::F_GETFL, 0), Ok(libc::O_RDWR));
    assert_eq!(fs.fcntl(fd, libc::F_SETFL, libc::O_APPEND | libc::O_WRONLY), Ok(0));
    assert_eq!(fs.fcntl(fd, libc::F_GETFL, 0), Ok(libc::O_RDWR | libc::O_APPEND));
    fs.write(fd, b"tail").unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(fs.pread(fd, &mut buf, 0), Ok(8));
    assert_eq!(&buf[..8], b"headtail");

    assert_eq!(fs.fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC), Ok(0));
    assert_eq!(fs.fcntl(fd, libc::F_GETFD, 0), Ok(0));
    assert_eq!(fs.fcntl(fd, libc::F_DUPFD, 0), Err(err(libc::EINVAL)));
    fs.close(fd).unwrap();
    assert_eq!(fs.fcntl(fd, libc::F_GETFL, 0), Err(err(libc::EBADF)));
}

#[test]
fn statfs_and_fdatasync() {
    let fs = posix();
    let before = fs.statfs("/").unwrap();
    fs.mkdir("/d", 0o755).unwrap();
    let fd = create(&fs, "/d/f", 0o644);
    fs.write(fd, &[7u8; 5000]).unwrap();
    fs.fdatasync(fd).unwrap();

    let after = fs.fstatfs(fd).unwrap();
    assert_eq!(after.f_files - after.f_ffree, before.f_files - before.f_ffree + 2);
    assert_eq!(after.f_blocks - after.f_bfree, 2);
    assert_eq!(after.f_bsize, 4096);
    assert_eq!(fs.statfs("/d").unwrap(), after);
    assert_eq!(fs.statfs("/missing"), Err(err(libc::ENOENT)));
    fs.close(fd).unwrap();
    assert_eq!(fs.fdatasync(fd), Err(err(libc::EBADF)));
}

#[test]
fn mknod_makes_regular_files_only() {
    let fs = posix();
    fs.mknod("/plain", 0o600, 0).unwrap();
    fs.mknod("/typed", libc::S_IFREG | 0o644, 0).unwrap();
    assert_eq!(fs.stat("/plain").unwrap().st_mode, libc::S_IFREG | 0o600);
    assert_eq!(fs.stat("/typed").unwrap().st_size, 0);

    assert_eq!(fs.mknod("/plain", 0o600, 0), Err(err(libc::EEXIST)));
    assert_eq!(fs.mknod("/fifo", libc::S_IFIFO | 0o600, 0), Err(err(libc::EINVAL)));
    assert_eq!(fs.stat("/fifo"), Err(err(libc::ENOENT)));
}

#[test]
fn fallocate_extends_with_zeros() {
    let fs = posix();
    let fd = create(&fs, "/f", 0o644);
    fs.write(fd, b"ab").unwrap();
    fs.fallocate(fd, 0, 4, 4).unwrap();
    assert_eq!(fs.fstat(fd).unwrap().st_size, 8);
    let mut buf = [0xffu8; 8];
    assert_eq!(fs.pread(fd, &mut buf, 0), Ok(8));
    assert_eq!(&buf, b"ab\0\0\0\0\0\0");

    fs.fallocate(fd, 0, 0, 1).unwrap();
    assert_eq!(fs.fstat(fd).unwrap().st_size, 8);
    assert_eq!(fs.fallocate(fd, 0, 0, 0), Err(err(libc::EINVAL)));
    assert_eq!(fs.fallocate(fd, 0, -1, 4), Err(err(libc::EINVAL)));
    assert_eq!(fs.fallocate(fd, 1, 0, 4), Err(err(libc::EOPNOTSUPP)));
    assert_eq!(fs.fallocate(fd, 0, i64::MAX, 1), Err(err(libc::EFBIG)));
    fs.close(fd).unwrap();
}

#[test]
fn getdents_lists_a_directory_in_pieces() {
    let fs = posix();
    fs.mkdir("/dir", 0o755).unwrap();
    fs.mkdir("/dir/sub", 0o755).unwrap();
    let fd = create(&fs, "/dir/x", 0o644);
    fs.close(fd).unwrap();

    let fd = fs.open("/dir", libc::O_RDONLY | libc::O_DIRECTORY, 0).unwrap();
    let mut tiny = [0u8; 8];
    assert_eq!(fs.getdents(fd, &mut tiny), Err(err(libc::EINVAL)));

    let mut names = Vec::new();
    let mut buf = [0u8; 24];
    loop {
        let n = fs.getdents(fd, &mut buf).unwrap();
        if n == 0 {
            break;
        }
        names.extend(unpack_dirents(&buf[..n]).into_iter().map(|(_, _, name)| name));
    }
    assert_eq!(names, vec![".", "..", "sub", "x"]);

    fs.lseek(fd, 0, libc::SEEK_SET).unwrap();
    let mut big = [0u8; 256];
    let n = fs.getdents(fd, &mut big).unwrap();
    let entries = unpack_dirents(&big[..n]);
    assert_eq!(entries.len(), 4);
    assert_eq!(entries[2].1, libc::DT_DIR);
    assert_eq!(entries[3].1, libc::DT_REG);
    fs.close(fd).unwrap();

    let file = fs.open("/dir/x", libc::O_RDONLY, 0).unwrap();
    assert_eq!(fs.getdents(file, &mut big), Err(err(libc::ENOTDIR)));
    assert_eq!(fs.open("/dir/x", libc::O_RDONLY | libc::O_DIRECTORY, 0), Err(err(libc::ENOTDIR)));
    assert_eq!(fs.open("/dir", libc::O_WRONLY, 0), Err(err(libc::EISDIR)));
}

#[test]
fn working_directory_is_per_thread_and_inherited() {
    let fs = posix();
    fs.mkdir("/a", 0o755).unwrap();
    fs.mkdir("/b", 0o755).unwrap();
    fs.chdir("/a").unwrap();

    let mut buf = [0u8; 8];
    assert_eq!(fs.getcwd(&mut buf), Ok(3));
    assert_eq!(&buf[..3], b"/a\0");
    assert_eq!(fs.getcwd(&mut [0u8; 2]), Err(err(libc::ERANGE)));

    fs.mkdir("rel", 0o755).unwrap();
    assert!(fs.stat("/a/rel").is_ok());

    let (inherited, changed) = fs
        .spawn(|child| {
            let inherited = child.current_dir().unwrap();
            child.chdir("../b").unwrap();
            (inherited, child.current_dir().unwrap())
        })
        .join()
        .unwrap();
    assert_eq!(inherited, "/a");
    assert_eq!(changed, "/b");
    assert_eq!(fs.current_dir().unwrap(), "/a");

    let plain = fs.clone();
    let fresh = std::thread::spawn(move || plain.current_dir().unwrap()).join().unwrap();
    assert_eq!(fresh, "/");

    let dir = fs.open("/b", libc::O_RDONLY | libc::O_DIRECTORY, 0).unwrap();
    fs.fchdir(dir).unwrap();
    assert_eq!(fs.current_dir().unwrap(), "/b");
    assert_eq!(fs.chdir("/missing"), Err(err(libc::ENOENT)));
    assert_eq!(fs.current_dir().unwrap(), "/b");
}

#[test]
fn racing_mkdir_through_the_adapter() {
    let fs = posix();
    let threads = 6;
    let barrier = Arc::new(Barrier::new(threads));
    let workers: Vec<_> = (0..threads)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            fs.spawn(move |fs| {
                barrier.wait();
                match fs.mkdir("/contested", 0o755) {
                    Ok(()) => Ok(()),
                    Err(e) => Err((e, errno())),
                }
            })
        })
        .collect();
    let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for result in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(*result, (err(libc::EEXIST), libc::EEXIST));
    }
}

#[test]
fn backend_faults_surface_as_eio() {
    let (fs, injector) = faulty_posix(FsConfig::default());

    let fd = create(&fs, "/data", 0o644);
    fs.write(fd, b"payload").unwrap();
    injector.set_policy(write_faults(0, 1));
    assert_eq!(fs.fsync(fd), Err(err(libc::EIO)));
    assert_eq!(errno(), libc::EIO);

    fs.fsync(fd).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(fs.pread(fd, &mut buf, 0), Ok(7));
    assert_eq!(&buf[..7], b"payload");
    fs.close(fd).unwrap();
}

fn faulty_posix(config: FsConfig) -> (Posix, Arc<FaultInjector>) {
    let injector = Arc::new(FaultInjector::new());
    let faults = Arc::clone(&injector);
    let bridge =
        Bridge::spawn(config, move || FaultyBackend::new(MemoryBackend::new(), faults)).unwrap();
    (Posix::new(bridge), injector)
}

fn write_faults(start_after: u64, max_faults: u64) -> FaultPolicy {
    FaultPolicy {
        enabled: true,
        rules: vec![FaultRule {
            op: FaultOp::Write,
            start_after,
            max_faults: Some(max_faults),
            ..Default::default()
        }],
    }
}

#[test]
fn failed_fsync_keeps_earlier_writes_readable() {
    let (fs, injector) = faulty_posix(FsConfig::default());
    let fd = create(&fs, "/data", 0o644);
    fs.write(fd, b"aaaa").unwrap();
    fs.write(fd, b"bbbb").unwrap();

    injector.set_policy(write_faults(1, 1));
    assert_eq!(fs.fsync(fd), Err(err(libc::EIO)));

    let mut buf = [0u8; 8];
    assert_eq!(fs.pread(fd, &mut buf, 0), Ok(8));
    assert_eq!(&buf, b"aaaabbbb");
    fs.close(fd).unwrap();

    let fd = fs.open("/data", libc::O_RDONLY, 0).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(fs.read(fd, &mut buf), Ok(8));
    assert_eq!(&buf[..8], b"aaaabbbb");
}

#[test]
fn buffered_append_lands_once_when_a_flush_fails() {
    let mut config = FsConfig::default();
    config.limits.write_buffer_bytes = 4;
    let (fs, injector) = faulty_posix(config);
    let fd = fs.open("/log", libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND, 0o644).unwrap();

    injector.set_policy(write_faults(0, 1));
    assert_eq!(fs.write(fd, b"abcde"), Ok(5));
    fs.close(fd).unwrap();
    assert_eq!(injector.hits(), 1);

    assert_eq!(fs.stat("/log").unwrap().st_size, 5);
    let fd = fs.open("/log", libc::O_RDONLY, 0).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(fs.read(fd, &mut buf), Ok(5));
    assert_eq!(&buf[..5], b"abcde");
}

#[test]
fn calls_from_the_storage_thread_run_inline() {
    let (tx, rx) = std::sync::mpsc::channel();
    let bridge = Bridge::builder(FsConfig::default())
        .on_start(move |bridge| {
            let fs = Posix::new(bridge.clone());
            let created = fs.mkdir("/early", 0o755);
            let seen = fs.stat("/early").map(|st| st.st_mode & libc::S_IFMT as u32);
            tx.send((created, seen)).unwrap();
        })
        .spawn(MemoryBackend::new)
        .unwrap();
    let (created, seen) = rx.recv().unwrap();
    assert_eq!(created, Ok(()));
    assert_eq!(seen, Ok(libc::S_IFDIR as u32));
    assert_eq!(bridge.stats().inline, 2);
    assert!(Posix::new(bridge).stat("/early").is_ok());
}
