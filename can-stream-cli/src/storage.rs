//! Log file placement
//!
//! Picks the directory for a logging session: the first mounted USB drive
//! when one is present, otherwise the configured output directory.

use crate::config::StorageConfig;
use anyhow::{Context, Result};
use can_stream_logger::CsvFileSink;
use chrono::{DateTime, Local};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const SYS_BLOCK: &str = "/sys/block";
const PROC_MOUNTS: &str = "/proc/mounts";

/// A mounted removable partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    /// Device node, e.g. `/dev/sdb1`
    pub device: String,
    /// Directory the device is mounted on
    pub mount_dir: PathBuf,
}

/// Whether a resolved `/sys/block` device path hangs off a USB controller
pub fn is_usb_path(resolved: &Path) -> bool {
    resolved
        .components()
        .any(|c| c.as_os_str().to_string_lossy().starts_with("usb"))
}

/// Names (`sdb`, `sdc`, ...) of block devices attached over USB
pub fn usb_block_devices(sys_block: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(sys_block) else {
        log::debug!("Cannot list {:?}", sys_block);
        return Vec::new();
    };

    let mut devices: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("sd") {
                return None;
            }
            let resolved = fs::canonicalize(entry.path()).ok()?;
            is_usb_path(&resolved).then_some(name)
        })
        .collect();
    devices.sort();
    devices
}

/// Undo the octal escapes `/proc/mounts` uses for blanks in paths
fn unescape_mount_field(field: &str) -> String {
    field
        .replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

/// Mount table entries whose device belongs to one of `devices`
pub fn parse_mounts(table: &str, devices: &[String]) -> Vec<MountPoint> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_dir = fields.next()?;
            let name = device.strip_prefix("/dev/")?;
            devices
                .iter()
                .any(|dev| name.starts_with(dev.as_str()))
                .then(|| MountPoint {
                    device: device.to_string(),
                    mount_dir: PathBuf::from(unescape_mount_field(mount_dir)),
                })
        })
        .collect()
}

/// Mounted USB partitions, in mount table order
pub fn find_usb_mounts() -> Vec<MountPoint> {
    let devices = usb_block_devices(Path::new(SYS_BLOCK));
    if devices.is_empty() {
        return Vec::new();
    }
    match fs::read_to_string(PROC_MOUNTS) {
        Ok(table) => parse_mounts(&table, &devices),
        Err(e) => {
            log::warn!("Cannot read {}: {}", PROC_MOUNTS, e);
            Vec::new()
        }
    }
}

/// `<prefix>_<YYYYmmdd_HHMMSS>.csv`, or `<prefix>_<YYYYmmdd_HHMMSS>_<n>.csv` for `attempt` n > 0
pub fn log_file_name(prefix: &str, now: DateTime<Local>, attempt: u32) -> String {
    let stamp = now.format("%Y%m%d_%H%M%S");
    if attempt == 0 {
        format!("{}_{}.csv", prefix, stamp)
    } else {
        format!("{}_{}_{}.csv", prefix, stamp, attempt)
    }
}

const MAX_NAME_ATTEMPTS: u32 = 100;

/// Create a fresh log file in `dir`, never reopening an existing one
pub fn create_log_file(dir: &Path, prefix: &str, now: DateTime<Local>) -> Result<CsvFileSink> {
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let path = dir.join(log_file_name(prefix, now, attempt));
        match CsvFileSink::create_new(&path) {
            Ok(sink) => return Ok(sink),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("Couldn't open {:?} to store the log", path))
            }
        }
    }
    anyhow::bail!(
        "Every log file name for {} in {:?} is taken",
        now.format("%Y%m%d_%H%M%S"),
        dir
    )
}

/// Directory the next log file goes to
pub fn target_dir(storage: &StorageConfig, mounts: &[MountPoint]) -> PathBuf {
    if storage.prefer_removable {
        if let Some(mount) = mounts.first() {
            log::info!("Found USB device {} at {:?}", mount.device, mount.mount_dir);
            return mount.mount_dir.clone();
        }
        log::warn!(
            "Found no USB devices, falling back to {:?}",
            storage.output_dir
        );
    }
    storage.output_dir.clone()
}

/// Create the CSV sink for a new logging session
pub fn open_log_sink(storage: &StorageConfig) -> Result<CsvFileSink> {
    let mounts = if storage.prefer_removable {
        find_usb_mounts()
    } else {
        Vec::new()
    };
    let dir = target_dir(storage, &mounts);
    fs::create_dir_all(&dir).with_context(|| format!("Failed to create {:?}", dir))?;

    create_log_file(&dir, &storage.file_prefix, Local::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const MOUNTS: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
/dev/sda2 / ext4 rw,relatime 0 0
/dev/sdb1 /media/pi/MY\\040STICK vfat rw,nosuid,nodev 0 0
/dev/sdc1 /media/pi/BACKUP vfat rw,nosuid,nodev 0 0
";

    fn storage(dir: &Path, prefer_removable: bool) -> StorageConfig {
        StorageConfig {
            output_dir: dir.to_path_buf(),
            file_prefix: "can_log".to_string(),
            prefer_removable,
        }
    }

    #[test]
    fn test_is_usb_path() {
        assert!(is_usb_path(Path::new(
            "/sys/devices/platform/soc/3f980000.usb/usb1/1-1/1-1.3/host0/target0:0:0/0:0:0:0/block/sdb"
        )));
        assert!(!is_usb_path(Path::new(
            "/sys/devices/pci0000:00/0000:00:17.0/ata1/host0/target0:0:0/0:0:0:0/block/sda"
        )));
    }

    #[test]
    fn test_parse_mounts_filters_and_unescapes() {
        let mounts = parse_mounts(MOUNTS, &["sdb".to_string(), "sdc".to_string()]);
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].device, "/dev/sdb1");
        assert_eq!(mounts[0].mount_dir, PathBuf::from("/media/pi/MY STICK"));
        assert_eq!(mounts[1].mount_dir, PathBuf::from("/media/pi/BACKUP"));

        assert!(parse_mounts(MOUNTS, &[]).is_empty());
    }

    #[test]
    fn test_log_file_name() {
        let now = Local.with_ymd_and_hms(2024, 5, 1, 8, 3, 9).unwrap();
        assert_eq!(log_file_name("truck", now, 0), "truck_20240501_080309.csv");
        assert_eq!(log_file_name("truck", now, 2), "truck_20240501_080309_2.csv");
    }

    #[test]
    fn test_target_dir_prefers_usb() {
        let dir = tempfile::tempdir().unwrap();
        let mounts = parse_mounts(MOUNTS, &["sdb".to_string()]);

        assert_eq!(
            target_dir(&storage(dir.path(), true), &mounts),
            PathBuf::from("/media/pi/MY STICK")
        );
        assert_eq!(target_dir(&storage(dir.path(), false), &mounts), dir.path());
        assert_eq!(target_dir(&storage(dir.path(), true), &[]), dir.path());
    }

    #[test]
    fn test_usb_block_devices_missing_dir() {
        assert!(usb_block_devices(Path::new("/nonexistent/sys/block")).is_empty());
    }

    #[test]
    fn test_same_second_sessions_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let now = Local.with_ymd_and_hms(2024, 5, 1, 8, 3, 9).unwrap();

        let first = create_log_file(dir.path(), "can_log", now).unwrap();
        let second = create_log_file(dir.path(), "can_log", now).unwrap();
        assert_ne!(first.path(), second.path());
        assert!(second.path().ends_with("can_log_20240501_080309_1.csv"));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_open_log_sink_in_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("logs");
        let sink = open_log_sink(&storage(&nested, false)).unwrap();
        assert!(sink.path().starts_with(&nested));
        assert!(sink.path().exists());
    }
}
