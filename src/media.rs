/*
 * Copyright 2026 Oxide Computer Company
 */

/*!
 * Writing an image to removable media on the operator's workstation, and the
 * checks we make before doing anything so destructive.
 */

use std::io::{BufRead, Write};
use std::path::Path;
use std::process::{Command, Stdio};

use crate::common::*;
use crate::file::{read_file, read_lines};
use crate::image::CompressionFormat;

const DD: &str = "/bin/dd";
const GZIP: &str = "/bin/gzip";
const MOUNT: &str = "/bin/mount";
const PARTPROBE: &str = "/sbin/partprobe";
const SYNC: &str = "/bin/sync";
const UMOUNT: &str = "/bin/umount";
const UNZIP: &str = "/usr/bin/unzip";
const XZ: &str = "/usr/bin/xz";

const SYS_BLOCK: &str = "/sys/block";
const SYS_CLASS_BLOCK: &str = "/sys/class/block";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub special: String,
    pub mount_point: String,
    pub fstype: String,
}

/*
 * Fields in /proc/mounts escape whitespace and backslashes as octal.
 */
fn unescape(field: &str) -> String {
    let mut out = String::new();
    let mut chars = field.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let oct: String = chars.clone().take(3).collect();
            if oct.len() == 3 {
                if let Ok(v) = u8::from_str_radix(&oct, 8) {
                    out.push(v as char);
                    chars.nth(2);
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

/**
 * Parse the contents of /proc/mounts.  The result is a list rather than a map
 * as there may be more than one mount at a particular mount point; the last
 * one wins.
 */
pub fn parse_mounts(text: &str) -> Vec<Mount> {
    text.lines()
        .filter_map(|l| {
            let t: Vec<&str> = l.split_whitespace().collect();
            if t.len() < 3 {
                return None;
            }
            Some(Mount {
                special: unescape(t[0]),
                mount_point: unescape(t[1]),
                fstype: t[2].to_string(),
            })
        })
        .collect()
}

pub fn mounts() -> Result<Vec<Mount>> {
    match read_file("/proc/mounts")? {
        Some(text) => Ok(parse_mounts(&text)),
        None => bail!("/proc/mounts not found"),
    }
}

/**
 * The device node for partition "n" of a disk.  Disks whose names end in a
 * digit (mmcblk0, nvme0n1, loop0) put a "p" before the partition number.
 */
pub fn partition_path(disk: &str, n: u32) -> String {
    if disk.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{}p{}", disk, n)
    } else {
        format!("{}{}", disk, n)
    }
}

/**
 * The whole disk a partition device belongs to.  A whole disk maps to itself.
 */
pub fn parent_disk(dev: &str) -> String {
    let name = dev.rsplit('/').next().unwrap_or(dev);
    let prefix = &dev[..dev.len() - name.len()];

    let stem = name.trim_end_matches(|c: char| c.is_ascii_digit());
    if stem.len() == name.len() {
        return dev.to_string();
    }

    /*
     * mmcblk0p1 and nvme0n1p1: the partition number follows a "p" that
     * itself follows a digit.
     */
    if let Some(base) = stem.strip_suffix('p') {
        if base.ends_with(|c: char| c.is_ascii_digit()) {
            return format!("{}{}", prefix, base);
        }
    }

    /*
     * sda1, vdb2, xvda3: letters then the partition number.  Anything else
     * ending in a digit (mmcblk0, nvme0n1, loop0) is a whole disk already.
     */
    let letters = ["sd", "vd", "hd", "xvd"];
    if letters.iter().any(|l| stem.starts_with(l)) {
        return format!("{}{}", prefix, stem);
    }

    dev.to_string()
}

/*
 * Mount points whose backing disks are never a valid target.  The root file
 * system must be found; the others only count when present.
 */
const SYSTEM_MOUNTS: &[&str] = &["/", "/boot", "/boot/efi", "/home", "/usr", "/var"];

/*
 * Stacked devices (LVM on LUKS on md, say) are followed this deep at most.
 */
const MAX_HOLDER_DEPTH: usize = 8;

/**
 * The name sysfs uses for the block device behind a mount source, if there is
 * one.  Device-mapper names like /dev/mapper/vg-root are normally symlinks to
 * a dm-N node; if not, the dm/name attribute of each dm device is checked.
 */
fn sysfs_name(class_block: &Path, special: &str) -> Result<Option<String>> {
    let dev = match std::fs::canonicalize(special) {
        Ok(p) => p.to_string_lossy().to_string(),
        Err(_) => special.to_string(),
    };
    let name = match dev.strip_prefix("/dev/") {
        Some(n) if !n.is_empty() => n.rsplit('/').next().unwrap_or(n),
        _ => return Ok(None),
    };
    if class_block.join(name).exists() {
        return Ok(Some(name.to_string()));
    }

    let mapped = special
        .strip_prefix("/dev/mapper/")
        .or_else(|| dev.strip_prefix("/dev/mapper/"));
    if let Some(mapped) = mapped {
        for ent in std::fs::read_dir(class_block)? {
            let ent = ent?;
            let dm = read_lines(ent.path().join("dm/name"))?
                .and_then(|l| l.into_iter().next());
            if dm.as_deref() == Some(mapped) {
                return Ok(Some(ent.file_name().to_string_lossy().to_string()));
            }
        }
    }

    Ok(None)
}

/**
 * The physical disks underneath a block device: a partition resolves to its
 * disk, and a device-mapper or md device to the disks under each of its
 * slaves.
 */
fn underlying_disks(class_block: &Path, name: &str, depth: usize) -> Result<Vec<String>> {
    if depth > MAX_HOLDER_DEPTH {
        bail!("{} is stacked too deeply to resolve", name);
    }
    let dir = class_block.join(name);
    if !dir.exists() {
        bail!("{} is not in {}", name, class_block.display());
    }

    let mut slaves = Vec::new();
    match std::fs::read_dir(dir.join("slaves")) {
        Ok(rd) => {
            for ent in rd {
                slaves.push(ent?.file_name().to_string_lossy().to_string());
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
        Err(e) => bail!("reading slaves of {}: {}", name, e),
    }
    if !slaves.is_empty() {
        slaves.sort();
        let mut disks = Vec::new();
        for s in slaves {
            for d in underlying_disks(class_block, &s, depth + 1)? {
                if !disks.contains(&d) {
                    disks.push(d);
                }
            }
        }
        return Ok(disks);
    }

    if dir.join("partition").exists() {
        /*
         * A partition's sysfs directory lives inside that of its disk.
         */
        let real = std::fs::canonicalize(&dir)?;
        let parent = real
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| anyhow!("no parent disk for partition {}", name))?;
        return underlying_disks(class_block, &parent, depth + 1);
    }

    Ok(vec![format!("/dev/{}", name)])
}

/**
 * Every disk that holds part of the running system.  If the root file system
 * cannot be traced back to a disk, nothing is safe to overwrite and this
 * fails.
 */
pub fn system_disks_in(class_block: &Path, mounts: &[Mount]) -> Result<Vec<String>> {
    let mut disks = Vec::new();

    for mp in SYSTEM_MOUNTS {
        let m = match mounts.iter().rev().find(|m| m.mount_point == *mp) {
            Some(m) => m,
            None if *mp == "/" => bail!("no root file system in the mount table"),
            None => continue,
        };

        let found = match sysfs_name(class_block, &m.special)? {
            Some(name) => underlying_disks(class_block, &name, 0)
                .with_context(|| format!("resolving {} ({})", mp, m.special))?,
            None if *mp == "/" => bail!(
                "cannot tell which disk holds the root file system ({} {})",
                m.special,
                m.fstype
            ),
            None if m.special.starts_with("/dev/") => {
                bail!("cannot tell which disk holds {} ({})", mp, m.special)
            }
            None => continue,
        };
        for d in found {
            if !disks.contains(&d) {
                disks.push(d);
            }
        }
    }

    if disks.is_empty() {
        bail!("could not determine the system disk");
    }
    Ok(disks)
}

pub fn system_disks(mounts: &[Mount]) -> Result<Vec<String>> {
    system_disks_in(Path::new(SYS_CLASS_BLOCK), mounts)
}

/**
 * Refuse a target disk that holds any part of the running system.
 */
pub fn refuse_system_disk(log: &Logger, disk: &str, system: &[String]) -> Result<()> {
    debug!(log, "system disks: {}", system.join(", "));
    if system.iter().any(|s| s == disk) {
        bail!("{} holds the running system; refusing to overwrite it", disk);
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub path: String,
    pub size_bytes: u64,
    pub model: Option<String>,
    pub removable: bool,
}

impl DeviceInfo {
    pub fn probe(dev: &str) -> Result<DeviceInfo> {
        DeviceInfo::probe_in(Path::new(SYS_BLOCK), dev)
    }

    /**
     * Read what sysfs knows about a disk.  The size file counts 512-byte
     * sectors regardless of the device's real sector size.
     */
    pub fn probe_in(sys_block: &Path, dev: &str) -> Result<DeviceInfo> {
        let name = dev.rsplit('/').next().unwrap_or(dev);
        let dir = sys_block.join(name);

        let sectors: u64 = match read_lines(dir.join("size"))? {
            Some(l) if !l.is_empty() => l[0]
                .parse()
                .with_context(|| format!("size of {}", name))?,
            _ => bail!("{} is not a disk known to {}", dev, sys_block.display()),
        };

        let model = read_lines(dir.join("device/model"))?
            .and_then(|l| l.into_iter().next())
            .filter(|m| !m.is_empty());
        let removable = read_lines(dir.join("removable"))?
            .map(|l| l.first().map(|s| s == "1").unwrap_or(false))
            .unwrap_or(false);

        Ok(DeviceInfo {
            path: dev.to_string(),
            size_bytes: sectors.saturating_mul(512),
            model,
            removable,
        })
    }
}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}, {}{})",
            self.path,
            self.model.as_deref().unwrap_or("unknown model"),
            human_size(self.size_bytes),
            if self.removable { ", removable" } else { "" },
        )
    }
}

pub fn human_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut v = bytes as f64;
    let mut u = 0;
    while v >= 1024.0 && u < UNITS.len() - 1 {
        v /= 1024.0;
        u += 1;
    }
    if u == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", v, UNITS[u])
    }
}

/**
 * Decide whether a device may be written to.  It must be a whole-disk block
 * device, and not the one we are running from.
 */
pub fn check_target(log: &Logger, dev: &str) -> Result<DeviceInfo> {
    use std::os::unix::fs::FileTypeExt;

    let canon = std::fs::canonicalize(dev)
        .with_context(|| format!("target device {}", dev))?
        .to_string_lossy()
        .to_string();
    if canon != dev {
        info!(log, "{} resolves to {}", dev, canon);
    }

    let md = std::fs::metadata(&canon)?;
    if !md.file_type().is_block_device() {
        bail!("{} is not a block device", canon);
    }
    if parent_disk(&canon) != canon {
        bail!("{} is a partition; name the whole disk instead", canon);
    }

    let system = system_disks(&mounts()?)
        .context("refusing to write without knowing which disk is in use")?;
    refuse_system_disk(log, &canon, &system)?;

    DeviceInfo::probe(&canon)
}

/**
 * Ask the operator to confirm a destructive write.  Only "y" or "yes" will do;
 * anything else, including no answer at all, is a refusal.
 */
pub fn confirm<R: BufRead, W: Write>(
    mut input: R,
    mut out: W,
    target: &DeviceInfo,
) -> Result<bool> {
    writeln!(out, "About to overwrite {}.", target)?;
    writeln!(out, "ALL DATA ON THIS DEVICE WILL BE LOST.")?;
    write!(out, "Continue? [y/N] ")?;
    out.flush()?;

    let mut answer = String::new();
    if input.read_line(&mut answer)? == 0 {
        writeln!(out)?;
        return Ok(false);
    }
    let answer = answer.trim().to_ascii_lowercase();
    Ok(answer == "y" || answer == "yes")
}

/**
 * Unmount anything the desktop may have mounted from the target disk.
 */
pub fn unmount_all(log: &Logger, disk: &str) -> Result<()> {
    let mut busy: Vec<Mount> = mounts()?
        .into_iter()
        .filter(|m| m.special == disk || parent_disk(&m.special) == disk)
        .collect();
    /*
     * Nested mounts must go first.
     */
    busy.sort_by(|a, b| b.mount_point.len().cmp(&a.mount_point.len()));

    for m in busy {
        umount(log, &m.mount_point)?;
    }
    Ok(())
}

fn umount(log: &Logger, dir: &str) -> Result<()> {
    info!(log, "exec: umount {}", dir);
    let output = Command::new(UMOUNT).env_clear().arg(dir).output()?;
    if !output.status.success() {
        bail!("umount {} failure: {}", dir, output.info());
    }
    Ok(())
}

/**
 * Stream an image onto a disk, decompressing as we go.
 */
pub fn write_image(
    log: &Logger,
    image: &Path,
    compression: CompressionFormat,
    disk: &str,
) -> Result<()> {
    let mut dd = Command::new(DD);
    dd.env_clear()
        .arg(format!("of={}", disk))
        .arg("bs=4M")
        .arg("conv=fsync")
        .arg("status=progress")
        .stdout(Stdio::null())
        .stderr(Stdio::inherit());

    let (prog, arg) = match compression {
        CompressionFormat::Xz => (XZ, "-dc"),
        CompressionFormat::Gzip => (GZIP, "-dc"),
        CompressionFormat::Zip => (UNZIP, "-p"),
    };

    info!(log, "exec: {} {} {} | dd of={}", prog, arg, image.display(), disk);
    let mut src = Command::new(prog)
        .env_clear()
        .arg(arg)
        .arg(image)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("could not run {}", prog))?;
    let pipe = src
        .stdout
        .take()
        .ok_or_else(|| anyhow!("{} stdout unavailable", prog))?;

    let status = dd.stdin(pipe).status()?;
    let out = src.wait_with_output()?;
    if !out.status.success() {
        bail!("{} failure: {}", prog, out.info());
    }

    if !status.success() {
        bail!("dd to {} failed: {}", disk, status);
    }

    info!(log, "exec: sync");
    let output = Command::new(SYNC).env_clear().output()?;
    if !output.status.success() {
        bail!("sync failure: {}", output.info());
    }

    /*
     * The kernel needs to notice the new partition table before we can mount
     * anything from it.  Not every system has partprobe; the partition may
     * show up on its own.
     */
    info!(log, "exec: partprobe {}", disk);
    match Command::new(PARTPROBE).env_clear().arg(disk).output() {
        Ok(o) if o.status.success() => (),
        Ok(o) => warn!(log, "partprobe failure: {}", o.info()),
        Err(e) => warn!(log, "could not run partprobe: {}", e),
    }

    Ok(())
}

/**
 * Wait for a device node to appear.
 */
pub fn wait_for_device(log: &Logger, dev: &str) -> Result<()> {
    for _ in 0..20 {
        if Path::new(dev).exists() {
            return Ok(());
        }
        info!(log, "waiting for {} to appear", dev);
        sleep(500);
    }
    bail!("{} did not appear", dev);
}

/**
 * A FAT file system mounted on a private temporary directory, unmounted again
 * when dropped.
 */
pub struct Mounted {
    log: Logger,
    dir: Option<tempfile::TempDir>,
}

impl Mounted {
    pub fn vfat(log: &Logger, dev: &str) -> Result<Mounted> {
        let dir = tempfile::Builder::new().prefix("hubprovision-boot.").tempdir()?;

        /*
         * FAT has no permission bits, and would otherwise fail every chmod;
         * "quiet" makes those succeed without effect.
         */
        info!(log, "exec: mount -t vfat -o quiet {} {}", dev, dir.path().display());
        let output = Command::new(MOUNT)
            .env_clear()
            .arg("-t")
            .arg("vfat")
            .arg("-o")
            .arg("quiet")
            .arg(dev)
            .arg(dir.path())
            .output()?;
        if !output.status.success() {
            bail!("mount {} failure: {}", dev, output.info());
        }

        Ok(Mounted { log: log.clone(), dir: Some(dir) })
    }

    pub fn path(&self) -> &Path {
        match &self.dir {
            Some(d) => d.path(),
            None => Path::new("/nonexistent"),
        }
    }

    pub fn unmount(mut self) -> Result<()> {
        self.release()
    }

    /*
     * The temporary directory is only removed once nothing is mounted on it;
     * removing it while still mounted would empty the boot partition.
     */
    fn release(&mut self) -> Result<()> {
        let dir = match self.dir.take() {
            Some(d) => d,
            None => return Ok(()),
        };
        let path = dir.path().to_string_lossy().to_string();
        match umount(&self.log, &path) {
            Ok(()) => {
                dir.close()?;
                Ok(())
            }
            Err(e) => {
                let _ = dir.into_path();
                Err(e)
            }
        }
    }
}

impl Drop for Mounted {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            error!(self.log, "could not unmount boot partition: {:?}", e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partition_names() {
        assert_eq!(partition_path("/dev/sdb", 1), "/dev/sdb1");
        assert_eq!(partition_path("/dev/mmcblk0", 1), "/dev/mmcblk0p1");
        assert_eq!(partition_path("/dev/nvme0n1", 2), "/dev/nvme0n1p2");
        assert_eq!(partition_path("/dev/loop3", 1), "/dev/loop3p1");
    }

    #[test]
    fn parent_disks() {
        assert_eq!(parent_disk("/dev/sda2"), "/dev/sda");
        assert_eq!(parent_disk("/dev/sda"), "/dev/sda");
        assert_eq!(parent_disk("/dev/xvdb12"), "/dev/xvdb");
        assert_eq!(parent_disk("/dev/mmcblk0p2"), "/dev/mmcblk0");
        assert_eq!(parent_disk("/dev/mmcblk0"), "/dev/mmcblk0");
        assert_eq!(parent_disk("/dev/nvme0n1p3"), "/dev/nvme0n1");
        assert_eq!(parent_disk("/dev/nvme0n1"), "/dev/nvme0n1");
        assert_eq!(parent_disk("/dev/loop0"), "/dev/loop0");
        assert_eq!(parent_disk("/dev/mapper/vg-root"), "/dev/mapper/vg-root");
    }

    #[test]
    fn mounts_parsed() {
        let text = "\
sysfs /sys sysfs rw,nosuid 0 0
/dev/nvme0n1p2 / ext4 rw,relatime 0 0
/dev/sdb1 /media/me/boot\\040fs vfat rw 0 0
bogus
";
        let m = parse_mounts(text);
        assert_eq!(m.len(), 3);
        assert_eq!(m[1].special, "/dev/nvme0n1p2");
        assert_eq!(m[2].mount_point, "/media/me/boot fs");
        assert_eq!(m[2].fstype, "vfat");
    }

    /*
     * A small imitation of /sys/class/block: whole disks are directories,
     * partitions are directories inside their disk with a symlink alongside,
     * and stacked devices list what they sit on in "slaves".
     */
    struct FakeSysfs {
        dir: tempfile::TempDir,
    }

    impl FakeSysfs {
        fn new() -> Result<FakeSysfs> {
            Ok(FakeSysfs { dir: tempfile::tempdir()? })
        }

        fn root(&self) -> &Path {
            self.dir.path()
        }

        fn disk(&self, name: &str) -> Result<()> {
            std::fs::create_dir_all(self.root().join(name))?;
            Ok(())
        }

        fn part(&self, disk: &str, name: &str) -> Result<()> {
            let d = self.root().join(disk).join(name);
            std::fs::create_dir_all(&d)?;
            std::fs::write(d.join("partition"), "1\n")?;
            std::os::unix::fs::symlink(&d, self.root().join(name))?;
            Ok(())
        }

        fn holder(&self, name: &str, dm_name: Option<&str>, slaves: &[&str]) -> Result<()> {
            let d = self.root().join(name);
            std::fs::create_dir_all(d.join("slaves"))?;
            for s in slaves {
                std::fs::create_dir_all(d.join("slaves").join(s))?;
            }
            if let Some(n) = dm_name {
                std::fs::create_dir_all(d.join("dm"))?;
                std::fs::write(d.join("dm/name"), format!("{}\n", n))?;
            }
            Ok(())
        }
    }

    #[test]
    fn system_disk_from_partition() -> Result<()> {
        let sys = FakeSysfs::new()?;
        sys.disk("nvme0n1")?;
        sys.part("nvme0n1", "nvme0n1p2")?;
        sys.disk("sdb")?;
        sys.part("sdb", "sdb1")?;

        let m = parse_mounts("/dev/nvme0n1p2 / ext4 rw 0 0\n/dev/sdb1 /mnt vfat rw 0 0\n");
        assert_eq!(system_disks_in(sys.root(), &m)?, vec!["/dev/nvme0n1"]);
        Ok(())
    }

    #[test]
    fn system_disk_under_lvm_and_luks() -> Result<()> {
        let sys = FakeSysfs::new()?;
        sys.disk("sda")?;
        sys.part("sda", "sda1")?;
        sys.part("sda", "sda2")?;
        sys.part("sda", "sda3")?;
        sys.disk("sdb")?;
        sys.holder("dm-0", Some("sda3_crypt"), &["sda3"])?;
        sys.holder("dm-1", Some("vg-root"), &["dm-0"])?;

        let m = parse_mounts(
            "/dev/mapper/vg-root / ext4 rw 0 0\n\
             /dev/sda2 /boot ext4 rw 0 0\n\
             /dev/sda1 /boot/efi vfat rw 0 0\n",
        );
        let disks = system_disks_in(sys.root(), &m)?;
        assert_eq!(disks, vec!["/dev/sda"]);

        let log = init_log();
        assert!(refuse_system_disk(&log, "/dev/sda", &disks).is_err());
        assert!(refuse_system_disk(&log, "/dev/sdb", &disks).is_ok());
        Ok(())
    }

    #[test]
    fn system_disks_include_boot_and_home() -> Result<()> {
        let sys = FakeSysfs::new()?;
        sys.disk("sda")?;
        sys.part("sda", "sda1")?;
        sys.disk("sdc")?;
        sys.part("sdc", "sdc1")?;
        sys.disk("sdd")?;
        sys.part("sdd", "sdd1")?;
        sys.holder("md0", None, &["sdc1", "sdd1"])?;

        let m = parse_mounts("/dev/sda1 / ext4 rw 0 0\n/dev/md0 /home ext4 rw 0 0\n");
        assert_eq!(
            system_disks_in(sys.root(), &m)?,
            vec!["/dev/sda", "/dev/sdc", "/dev/sdd"]
        );
        Ok(())
    }

    #[test]
    fn unknown_root_refuses_everything() -> Result<()> {
        let sys = FakeSysfs::new()?;
        sys.disk("sda")?;

        let m = parse_mounts("overlay / overlay rw 0 0\n");
        assert!(system_disks_in(sys.root(), &m).is_err());

        let m = parse_mounts("rpool/ROOT/debian / zfs rw 0 0\n");
        assert!(system_disks_in(sys.root(), &m).is_err());

        let m = parse_mounts("/dev/mapper/missing / ext4 rw 0 0\n");
        assert!(system_disks_in(sys.root(), &m).is_err());

        let m = parse_mounts("/dev/sda1 /mnt ext4 rw 0 0\n");
        assert!(system_disks_in(sys.root(), &m).is_err());
        Ok(())
    }

    #[test]
    fn confirmation_requires_yes() -> Result<()> {
        let dev = DeviceInfo {
            path: "/dev/sdz".into(),
            size_bytes: 32 * 1024 * 1024 * 1024,
            model: Some("SD Card Reader".into()),
            removable: true,
        };

        for (answer, expect) in [
            ("y\n", true),
            ("YES\n", true),
            ("  yes  \n", true),
            ("\n", false),
            ("n\n", false),
            ("yep\n", false),
            ("", false),
        ] {
            let mut out = Vec::new();
            let ok = confirm(answer.as_bytes(), &mut out, &dev)?;
            assert_eq!(ok, expect, "answer {:?}", answer);
            let shown = String::from_utf8(out)?;
            assert!(shown.contains("/dev/sdz (SD Card Reader, 32.0 GiB, removable)"));
        }
        Ok(())
    }

    #[test]
    fn device_probe() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sdz = dir.path().join("sdz");
        std::fs::create_dir_all(sdz.join("device"))?;
        std::fs::write(sdz.join("size"), "62333952\n")?;
        std::fs::write(sdz.join("device/model"), "Card Reader     \n")?;
        std::fs::write(sdz.join("removable"), "1\n")?;

        let info = DeviceInfo::probe_in(dir.path(), "/dev/sdz")?;
        assert_eq!(info.size_bytes, 62333952 * 512);
        assert_eq!(info.model.as_deref(), Some("Card Reader"));
        assert!(info.removable);

        assert!(DeviceInfo::probe_in(dir.path(), "/dev/sdy").is_err());
        Ok(())
    }

    #[test]
    fn sizes() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(100 * 1024 * 1024), "100.0 MiB");
        assert_eq!(human_size(3 * 1024 * 1024 * 1024 / 2), "1.5 GiB");
    }
}
