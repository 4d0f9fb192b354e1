use fuser::{FileAttr, FileType, TimeOrNow};
use libc::S_IFMT;
use nix::sys::time::TimeSpec;
use std::fs::Metadata;
use std::os::unix::prelude::MetadataExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub(crate) fn mode_to_filetype(mode: u32) -> FileType {
    match mode & (S_IFMT as u32) {
        x if x == libc::S_IFREG as u32 => FileType::RegularFile,
        x if x == libc::S_IFDIR as u32 => FileType::Directory,
        x if x == libc::S_IFLNK as u32 => FileType::Symlink,
        x if x == libc::S_IFBLK as u32 => FileType::BlockDevice,
        x if x == libc::S_IFCHR as u32 => FileType::CharDevice,
        x if x == libc::S_IFIFO as u32 => FileType::NamedPipe,
        x if x == libc::S_IFSOCK as u32 => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

/// Convert std::fs::FileType to fuser FileType without another stat call.
pub(crate) fn std_filetype_to_fuser(ft: std::fs::FileType) -> FileType {
    use std::os::unix::fs::FileTypeExt;

    if ft.is_file() {
        FileType::RegularFile
    } else if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else if ft.is_block_device() {
        FileType::BlockDevice
    } else if ft.is_char_device() {
        FileType::CharDevice
    } else if ft.is_fifo() {
        FileType::NamedPipe
    } else {
        FileType::Socket
    }
}

fn unix_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + Duration::from_nanos(nsecs as u64)
    }
}

pub(crate) fn metadata_to_fileattr(meta: &Metadata, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: meta.len(),
        blocks: meta.blocks(),
        atime: unix_time(meta.atime(), meta.atime_nsec()),
        mtime: unix_time(meta.mtime(), meta.mtime_nsec()),
        ctime: unix_time(meta.ctime(), meta.ctime_nsec()),
        crtime: UNIX_EPOCH,
        kind: mode_to_filetype(meta.mode()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}

/// Timestamp argument for utimensat; `None` leaves the time unchanged.
pub(crate) fn time_or_now_to_timespec(time: Option<TimeOrNow>) -> TimeSpec {
    let nsec = match time {
        None => libc::UTIME_OMIT,
        Some(TimeOrNow::Now) => libc::UTIME_NOW,
        Some(TimeOrNow::SpecificTime(t)) => {
            let since_epoch = t.duration_since(UNIX_EPOCH).unwrap_or_default();
            return TimeSpec::new(
                since_epoch.as_secs() as libc::time_t,
                since_epoch.subsec_nanos() as libc::c_long,
            );
        }
    };
    TimeSpec::from(libc::timespec {
        tv_sec: 0,
        tv_nsec: nsec,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_metadata_to_fileattr_regular_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("file");
        fs::write(&path, b"12345").unwrap();

        let attr = metadata_to_fileattr(&fs::metadata(&path).unwrap(), 42);
        assert_eq!(attr.ino, 42);
        assert_eq!(attr.size, 5);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert!(attr.mtime > UNIX_EPOCH);
    }

    #[test]
    fn test_metadata_to_fileattr_directory_and_symlink() {
        let temp_dir = tempfile::tempdir().unwrap();
        let link = temp_dir.path().join("link");
        std::os::unix::fs::symlink("target", &link).unwrap();

        let dir_attr = metadata_to_fileattr(&fs::metadata(temp_dir.path()).unwrap(), 2);
        assert_eq!(dir_attr.kind, FileType::Directory);

        let link_attr = metadata_to_fileattr(&fs::symlink_metadata(&link).unwrap(), 3);
        assert_eq!(link_attr.kind, FileType::Symlink);
    }

    #[test]
    fn test_time_or_now_to_timespec() {
        assert_eq!(time_or_now_to_timespec(None).tv_nsec(), libc::UTIME_OMIT);
        assert_eq!(
            time_or_now_to_timespec(Some(TimeOrNow::Now)).tv_nsec(),
            libc::UTIME_NOW
        );

        let t = UNIX_EPOCH + Duration::new(1_700_000_000, 5);
        let ts = time_or_now_to_timespec(Some(TimeOrNow::SpecificTime(t)));
        assert_eq!(ts.tv_sec(), 1_700_000_000);
        assert_eq!(ts.tv_nsec(), 5);
    }
}
