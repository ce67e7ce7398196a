//! Long-form directory listing rendering
//!
//! Turns raw `st_mode` / `st_mtime` values into the pieces of an `ls -l`
//! line, which SFTP clients display verbatim as the NAME longname.

use crate::files::FileStat;
use chrono::{DateTime, Datelike, Local, TimeZone};
use tracing::warn;

/// POSIX file-type field and its values
const S_IFMT: u32 = 0o170_000;
const S_IFSOCK: u32 = 0o140_000;
const S_IFLNK: u32 = 0o120_000;
const S_IFREG: u32 = 0o100_000;
const S_IFBLK: u32 = 0o060_000;
const S_IFDIR: u32 = 0o040_000;
const S_IFCHR: u32 = 0o020_000;
const S_IFIFO: u32 = 0o010_000;

const S_ISUID: u32 = 0o4000;
const S_ISGID: u32 = 0o2000;
const S_ISVTX: u32 = 0o1000;

/// Single-character file type glyph for a raw mode
///
/// Unrecognized type bits render as `?`.
pub fn file_type(mode: u32) -> char {
    match mode & S_IFMT {
        S_IFSOCK => 's',
        S_IFLNK => 'l',
        S_IFREG => '-',
        S_IFBLK => 'b',
        S_IFDIR => 'd',
        S_IFCHR => 'c',
        S_IFIFO => 'p',
        other => {
            warn!(
                event = "unknown_file_type",
                mode = %format!("{other:o}"),
                "Unrecognized file type bits"
            );
            '?'
        }
    }
}

/// Nine-character `rwxrwxrwx` permission string
///
/// Set-user-id and set-group-id take the user/group execute slot (`s` when
/// the slot is executable, `S` otherwise); the sticky bit takes the other
/// execute slot (`t` / `T`).
pub fn permissions(mode: u32) -> String {
    let triad = |shift: u32, special: u32, lower: char, upper: char| {
        let bits = (mode >> shift) & 0o7;
        let read = if bits & 0o4 != 0 { 'r' } else { '-' };
        let write = if bits & 0o2 != 0 { 'w' } else { '-' };
        let exec = bits & 0o1 != 0;
        let exec = match (mode & special != 0, exec) {
            (true, true) => lower,
            (true, false) => upper,
            (false, true) => 'x',
            (false, false) => '-',
        };
        [read, write, exec]
    };

    triad(6, S_ISUID, 's', 'S')
        .into_iter()
        .chain(triad(3, S_ISGID, 's', 'S'))
        .chain(triad(0, S_ISVTX, 't', 'T'))
        .collect()
}

/// Listing timestamp relative to the current local time
pub fn time_string(mtime: i64) -> String {
    time_string_at(mtime, Local::now())
}

/// Listing timestamp relative to `now`
///
/// Same calendar year renders `Mon DD HH:MM`, anything else `Mon DD YYYY`.
pub fn time_string_at<Tz>(mtime: i64, now: DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let Some(time) = now.timezone().timestamp_opt(mtime, 0).earliest() else {
        return "Jan 01 1970".to_string();
    };

    if time.year() == now.year() {
        time.format("%b %d %H:%M").to_string()
    } else {
        time.format("%b %d %Y").to_string()
    }
}

/// Full `ls -l` style line for a directory entry
pub fn longname(stat: &FileStat, filename: &str) -> String {
    format!(
        "{}{} {} {} {} {} {} {}",
        file_type(stat.mode),
        permissions(stat.mode),
        stat.nlink,
        stat.uid,
        stat.gid,
        stat.size,
        time_string(stat.mtime),
        filename
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};

    #[test]
    fn test_file_type_glyphs() {
        assert_eq!(file_type(0o100_644), '-');
        assert_eq!(file_type(0o040_755), 'd');
        assert_eq!(file_type(0o120_777), 'l');
        assert_eq!(file_type(0o140_755), 's');
        assert_eq!(file_type(0o060_660), 'b');
        assert_eq!(file_type(0o020_620), 'c');
        assert_eq!(file_type(0o010_644), 'p');
        assert_eq!(file_type(0o000_644), '?');
        assert_eq!(file_type(0o170_644), '?');
    }

    #[test]
    fn test_plain_permissions() {
        assert_eq!(permissions(0o644), "rw-r--r--");
        assert_eq!(permissions(0o755), "rwxr-xr-x");
        assert_eq!(permissions(0o000), "---------");
        assert_eq!(permissions(0o100_777), "rwxrwxrwx");
    }

    #[test]
    fn test_setuid_overlay() {
        // rwxr-xr-- without user execute: rw-r-xr--
        assert_eq!(permissions(0o4654), "rwSr-xr--");
        assert_eq!(permissions(0o4754), "rwsr-xr--");
    }

    #[test]
    fn test_setgid_overlay() {
        assert_eq!(permissions(0o2750), "rwxr-s---");
        assert_eq!(permissions(0o2740), "rwxr-S---");
    }

    #[test]
    fn test_sticky_overlay() {
        assert_eq!(permissions(0o1777), "rwxrwxrwt");
        assert_eq!(permissions(0o1776), "rwxrwxrwT");
    }

    #[test]
    fn test_time_string_same_year() {
        let now = Utc.with_ymd_and_hms(2024, 11, 20, 9, 0, 0).unwrap();
        let mtime = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 0).unwrap().timestamp();
        assert_eq!(time_string_at(mtime, now), "Mar 05 14:07");
    }

    #[test]
    fn test_time_string_other_year() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let mtime = Utc.with_ymd_and_hms(2019, 12, 31, 23, 59, 0).unwrap().timestamp();
        assert_eq!(time_string_at(mtime, now), "Dec 31 2019");
    }

    #[test]
    fn test_time_string_uses_timezone_of_now() {
        // 2023-12-31 23:30 UTC is already 2024 in UTC+2
        let tz = FixedOffset::east_opt(2 * 3600).unwrap();
        let now = tz.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let mtime = Utc.with_ymd_and_hms(2023, 12, 31, 23, 30, 0).unwrap().timestamp();
        assert_eq!(time_string_at(mtime, now), "Jan 01 01:30");
    }

    #[test]
    fn test_longname_layout() {
        let stat = FileStat {
            mode: 0o100_644,
            nlink: 1,
            uid: 1000,
            gid: 100,
            size: 42,
            atime: 0,
            mtime: 0,
        };
        let line = longname(&stat, "notes.txt");
        assert!(line.starts_with("-rw-r--r-- 1 1000 100 42 "));
        assert!(line.ends_with(" notes.txt"));
    }
}
