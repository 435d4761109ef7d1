//! Volume identity independent of mount path.
//!
//! Records carry a [`VolumeId`] that survives unmount and remount. On Linux
//! the id comes from the filesystem UUID (`/dev/disk/by-uuid`), falling back
//! to the mount source and finally to a fingerprint of the mount point. On
//! other platforms the fingerprint of the path's first segment (the drive)
//! is used.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hasher;
use std::path::{Path, PathBuf};

use fnv::FnvHasher;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::path::{base_name, is_same_or_descendant, path_segments, path_to_key};

/// Stable identifier of a drive/volume.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeId(String);

impl VolumeId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Id derived from a mount point when nothing more stable is known.
    pub fn from_mount_point(mount_point: &str) -> Self {
        let mut hasher = FnvHasher::default();
        hasher.write(mount_point.as_bytes());
        Self(format!("mnt:{:016x}", hasher.finish()))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the store remembers about a volume it has crawled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub id: VolumeId,
    /// Where the volume was mounted during the last crawl.
    pub last_mount_point: String,
    /// Human label (last segment of the mount point, e.g. the drive name).
    pub label: String,
}

impl VolumeInfo {
    pub fn new(id: VolumeId, mount_point: &str) -> Self {
        let label = match base_name(mount_point) {
            "" | "/" => mount_point.to_string(),
            name => name.to_string(),
        };
        Self {
            id,
            last_mount_point: mount_point.to_string(),
            label,
        }
    }
}

/// One entry of the current mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Normalized mount point.
    pub mount_point: String,
    pub volume_id: VolumeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MountSource {
    System,
    Fixed,
}

/// Snapshot of the mounted volumes, refreshable on demand.
#[derive(Debug)]
pub struct VolumeTable {
    source: MountSource,
    /// Sorted by mount point length, longest first.
    mounts: RwLock<Vec<MountEntry>>,
}

impl VolumeTable {
    /// Reads the system mount table.
    pub fn load() -> Self {
        let table = Self {
            source: MountSource::System,
            mounts: RwLock::new(Vec::new()),
        };
        table.refresh();
        table
    }

    /// A table with a fixed set of mounts; `refresh` leaves it untouched.
    pub fn from_mounts(mounts: Vec<MountEntry>) -> Self {
        let table = Self {
            source: MountSource::Fixed,
            mounts: RwLock::new(Vec::new()),
        };
        table.replace(mounts);
        table
    }

    /// Re-reads the system mount table.
    pub fn refresh(&self) {
        if self.source == MountSource::Fixed {
            return;
        }
        match read_system_mounts() {
            Ok(mounts) => self.replace(mounts),
            Err(error) => log::warn!("volume table refresh failed: {error}"),
        }
    }

    /// Replaces the known mounts.
    pub fn replace(&self, mut mounts: Vec<MountEntry>) {
        mounts.sort_by(|a, b| {
            b.mount_point
                .len()
                .cmp(&a.mount_point.len())
                .then_with(|| a.mount_point.cmp(&b.mount_point))
        });
        *self.mounts.write() = mounts;
    }

    /// Resolves the volume owning `path` (longest mount-point prefix).
    pub fn volume_for(&self, path: &Path) -> VolumeId {
        self.mount_for(path)
            .map(|entry| entry.volume_id)
            .unwrap_or_else(|| fallback_volume(&path_to_key(path)))
    }

    /// Resolves the mount entry owning `path`.
    pub fn mount_for(&self, path: &Path) -> Option<MountEntry> {
        let key = path_to_key(path);
        self.mounts
            .read()
            .iter()
            .find(|entry| is_same_or_descendant(&key, &entry.mount_point))
            .cloned()
    }

    /// Mount point owning `path`, or the drive root when no mount covers it.
    pub fn mount_point_for(&self, path: &Path) -> String {
        self.mount_for(path)
            .map(|entry| entry.mount_point)
            .unwrap_or_else(|| fallback_anchor(&path_to_key(path)))
    }

    /// Volume mounted exactly at `path`, if `path` is a mount point.
    pub fn volume_mounted_at(&self, path: &str) -> Option<VolumeId> {
        self.mounts
            .read()
            .iter()
            .find(|entry| entry.mount_point == path)
            .map(|entry| entry.volume_id.clone())
    }

    /// Where `id` is mounted right now.
    pub fn mount_point(&self, id: &VolumeId) -> Option<String> {
        let mounts = self.mounts.read();
        if let Some(entry) = mounts.iter().find(|entry| &entry.volume_id == id) {
            return Some(entry.mount_point.clone());
        }
        drop(mounts);
        if self.source == MountSource::System && !cfg!(target_os = "linux") {
            return fallback_mount_point(id);
        }
        None
    }

    /// True if `id` currently resolves to a mount point.
    pub fn is_mounted(&self, id: &VolumeId) -> bool {
        self.mount_point(id).is_some()
    }

    pub fn mounts(&self) -> Vec<MountEntry> {
        self.mounts.read().clone()
    }
}

/// Fingerprint of the first path segment, used when no mount covers `key`.
fn fallback_volume(key: &str) -> VolumeId {
    let anchor = fallback_anchor(key);
    VolumeId::from_mount_point(&anchor)
}

fn fallback_anchor(key: &str) -> String {
    match path_segments(key).next() {
        Some(first) if first.ends_with(':') => format!("{first}/"),
        _ => "/".to_string(),
    }
}

/// Non-Linux: treat each drive root that exists as mounted.
fn fallback_mount_point(id: &VolumeId) -> Option<String> {
    let mut candidates = vec!["/".to_string()];
    candidates.extend((b'A'..=b'Z').map(|letter| format!("{}:/", letter as char)));
    candidates
        .into_iter()
        .find(|anchor| &VolumeId::from_mount_point(anchor) == id && Path::new(anchor).exists())
}

#[cfg(target_os = "linux")]
fn read_system_mounts() -> std::io::Result<Vec<MountEntry>> {
    let mountinfo = std::fs::read_to_string("/proc/self/mountinfo")?;
    let uuids = read_uuid_devices();
    Ok(parse_mountinfo(&mountinfo, &uuids))
}

#[cfg(not(target_os = "linux"))]
fn read_system_mounts() -> std::io::Result<Vec<MountEntry>> {
    Ok(Vec::new())
}

/// Maps canonical device paths to filesystem UUIDs.
#[cfg(target_os = "linux")]
fn read_uuid_devices() -> HashMap<PathBuf, String> {
    let mut devices = HashMap::new();
    let Ok(entries) = std::fs::read_dir("/dev/disk/by-uuid") else {
        return devices;
    };
    for entry in entries.filter_map(|entry| entry.ok()) {
        let Ok(device) = std::fs::canonicalize(entry.path()) else {
            continue;
        };
        devices.insert(device, entry.file_name().to_string_lossy().into_owned());
    }
    devices
}

/// Parses `/proc/self/mountinfo` lines into mount entries.
///
/// Format: `id parent major:minor root mount_point options [optional...] - fstype source super_options`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_mountinfo(contents: &str, uuids: &HashMap<PathBuf, String>) -> Vec<MountEntry> {
    let mut entries: Vec<MountEntry> = Vec::new();
    for line in contents.lines() {
        let Some((left, right)) = line.split_once(" - ") else {
            continue;
        };
        let Some(raw_mount_point) = left.split(' ').nth(4) else {
            continue;
        };
        let mut right_fields = right.split(' ');
        let _fstype = right_fields.next();
        let source = right_fields.next().unwrap_or_default();

        let mount_point = path_to_key(Path::new(&unescape_mount_field(raw_mount_point)));
        let volume_id = volume_id_for_source(source, &mount_point, uuids);

        // Later lines shadow earlier mounts at the same point.
        entries.retain(|entry| entry.mount_point != mount_point);
        entries.push(MountEntry {
            mount_point,
            volume_id,
        });
    }
    entries
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn volume_id_for_source(
    source: &str,
    mount_point: &str,
    uuids: &HashMap<PathBuf, String>,
) -> VolumeId {
    if source.starts_with("/dev/") {
        let device = std::fs::canonicalize(source).unwrap_or_else(|_| PathBuf::from(source));
        if let Some(uuid) = uuids.get(&device) {
            return VolumeId::new(format!("uuid:{uuid}"));
        }
        return VolumeId::new(format!("dev:{source}"));
    }
    VolumeId::from_mount_point(mount_point)
}

/// Decodes the octal escapes (`\040` for space) used in mountinfo.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn unescape_mount_field(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'\\' && index + 3 < bytes.len() {
            let digits = std::str::from_utf8(&bytes[index + 1..index + 4]).unwrap_or_default();
            if let Ok(value) = u8::from_str_radix(digits, 8) {
                out.push(value);
                index += 4;
                continue;
            }
        }
        out.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_table() -> VolumeTable {
        VolumeTable::from_mounts(vec![
            MountEntry {
                mount_point: "/".to_string(),
                volume_id: VolumeId::new("uuid:root"),
            },
            MountEntry {
                mount_point: "/media/me/USB".to_string(),
                volume_id: VolumeId::new("uuid:usb"),
            },
        ])
    }

    #[test]
    fn longest_mount_point_wins() {
        let table = fixed_table();
        assert_eq!(
            table.volume_for(Path::new("/media/me/USB/photos/a.jpg")),
            VolumeId::new("uuid:usb")
        );
        assert_eq!(
            table.volume_for(Path::new("/media/me/USBX/a.jpg")),
            VolumeId::new("uuid:root")
        );
        assert_eq!(
            table.volume_mounted_at("/media/me/USB"),
            Some(VolumeId::new("uuid:usb"))
        );
    }

    #[test]
    fn fixed_table_reports_mount_state() {
        let table = fixed_table();
        assert!(table.is_mounted(&VolumeId::new("uuid:usb")));
        assert!(!table.is_mounted(&VolumeId::new("uuid:gone")));
        table.refresh();
        assert_eq!(table.mounts().len(), 2);
    }

    #[test]
    fn parses_mountinfo_lines() {
        let contents = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/nonexistent-sda1 rw
40 22 0:35 / /tmp rw,nosuid shared:2 - tmpfs tmpfs rw
41 22 8:17 / /media/me/My\\040Drive rw shared:3 - vfat /dev/nonexistent-sdb1 rw
";
        let mut uuids = HashMap::new();
        uuids.insert(
            PathBuf::from("/dev/nonexistent-sdb1"),
            "ABCD-1234".to_string(),
        );
        let mounts = parse_mountinfo(contents, &uuids);
        assert_eq!(mounts.len(), 3);
        assert_eq!(mounts[0].volume_id, VolumeId::new("dev:/dev/nonexistent-sda1"));
        assert_eq!(mounts[1].volume_id, VolumeId::from_mount_point("/tmp"));
        assert_eq!(mounts[2].mount_point, "/media/me/My Drive");
        assert_eq!(mounts[2].volume_id, VolumeId::new("uuid:ABCD-1234"));
    }

    #[test]
    fn volume_info_label_is_last_segment() {
        let info = VolumeInfo::new(VolumeId::new("uuid:usb"), "/media/me/USB");
        assert_eq!(info.label, "USB");
        let root = VolumeInfo::new(VolumeId::new("uuid:root"), "/");
        assert_eq!(root.label, "/");
    }

    #[test]
    fn unmapped_paths_fall_back_to_drive_fingerprint() {
        let table = VolumeTable::from_mounts(Vec::new());
        assert_eq!(
            table.volume_for(Path::new("/home/me")),
            VolumeId::from_mount_point("/")
        );
        assert_eq!(
            table.volume_for(Path::new("D:/data")),
            VolumeId::from_mount_point("D:/")
        );
    }
}
