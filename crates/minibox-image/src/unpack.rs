//! Layer unpacking with AUFS-to-overlayfs whiteout translation.
//!
//! Registry layers are gzipped tar archives carrying AUFS-style deletion
//! markers (`.wh.` filename prefix, `.wh..wh..opq` opaque marker).
//! Overlayfs expects a 0/0 character device for a deleted file and a
//! `trusted.overlay.opaque` xattr for an opaque directory, so both are
//! translated while the archive is walked. The markers themselves are
//! never written out; they would show up in the merged mount.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use nix::sys::stat::{mknod, Mode, SFlag};
use nix::unistd::{chown, Gid, Uid};
use tar::{Archive, EntryType};
use tracing::debug;

use crate::error::{ImageError, Result};
use crate::store::LayerStore;

/// AUFS deletion marker prefix.
const WHITEOUT_PREFIX: &str = ".wh.";

/// AUFS opaque-directory marker.
const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

/// Overlayfs xattr marking a directory opaque.
const OVERLAY_OPAQUE_XATTR: &str = "trusted.overlay.opaque";

impl LayerStore {
    /// Unpacks a gzipped tar layer blob into `blobs/<digest>/`.
    ///
    /// Entry handling: directories are created 0755 (pre-existing is
    /// fine), regular files are whiteout-checked then written with the
    /// header mode, symlinks keep their target verbatim, hardlinks must
    /// resolve inside `blobs/`, and anything else is logged and skipped.
    ///
    /// A failure mid-archive leaves a partial layer directory behind;
    /// the presence check will trust it on the next run.
    ///
    /// # Errors
    ///
    /// [`ImageError::InvalidHardlink`], [`ImageError::Xattr`],
    /// [`ImageError::Unpack`], or I/O errors from the walk.
    pub fn unpack_layer(&self, digest: &str, blob: &[u8]) -> Result<()> {
        let layer_dir = self.layer_dir(digest);
        fs::create_dir_all(&layer_dir)?;

        let decoder = GzDecoder::new(blob);
        let mut archive = Archive::new(decoder);

        for entry in archive.entries()? {
            let mut entry = entry?;
            let rel = entry.path()?.into_owned();

            let Some(dst) = join_contained(&layer_dir, &rel) else {
                return Err(ImageError::Unpack(format!(
                    "entry path escapes layer directory: {}",
                    rel.display()
                )));
            };

            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }

            match entry.header().entry_type() {
                EntryType::Directory => {
                    if !dst.is_dir() {
                        fs::create_dir_all(&dst)?;
                        fs::set_permissions(&dst, fs::Permissions::from_mode(0o755))?;
                    }
                }
                EntryType::Regular | EntryType::Continuous => {
                    let uid = entry.header().uid().unwrap_or(0) as libc::uid_t;
                    let gid = entry.header().gid().unwrap_or(0) as libc::gid_t;
                    if apply_whiteout(&dst, uid, gid)? {
                        continue;
                    }

                    let mut file = fs::File::create(&dst)?;
                    io::copy(&mut entry, &mut file)?;
                    if let Ok(mode) = entry.header().mode() {
                        fs::set_permissions(&dst, fs::Permissions::from_mode(mode))?;
                    }
                }
                EntryType::Symlink => {
                    let target = entry.link_name()?.ok_or_else(|| {
                        ImageError::Unpack(format!("symlink without target: {}", rel.display()))
                    })?;
                    // The target is kept verbatim; it resolves inside the
                    // merged mount, not on the host.
                    let _ = fs::remove_file(&dst);
                    symlink(&target, &dst)?;
                }
                EntryType::Link => {
                    let target = entry.link_name()?.ok_or_else(|| {
                        ImageError::Unpack(format!("hardlink without target: {}", rel.display()))
                    })?;
                    let src = join_contained(&self.blobs_dir(), &Path::new(digest).join(&target))
                        .ok_or_else(|| {
                            ImageError::InvalidHardlink(format!(
                                "{} -> {}",
                                rel.display(),
                                target.display()
                            ))
                        })?;
                    fs::hard_link(&src, &dst)?;
                }
                other => {
                    debug!(
                        path = %rel.display(),
                        entry_type = ?other,
                        "skipping unsupported tar entry type"
                    );
                }
            }
        }

        Ok(())
    }
}

/// Translates an AUFS marker at `dst`, if it is one. Returns `true` when
/// the entry was consumed and must not be written as a file.
fn apply_whiteout(dst: &Path, uid: libc::uid_t, gid: libc::gid_t) -> Result<bool> {
    let Some(name) = dst.file_name().and_then(|n| n.to_str()) else {
        return Ok(false);
    };

    if name == WHITEOUT_OPAQUE {
        let parent = dst.parent().ok_or_else(|| {
            ImageError::Unpack(format!("opaque marker without parent: {}", dst.display()))
        })?;
        set_opaque(parent)?;
        return Ok(true);
    }

    if let Some(original) = name.strip_prefix(WHITEOUT_PREFIX) {
        // Overlayfs whiteout convention: a 0/0 character device shadows
        // the lower-layer file of the same name.
        let target = dst.with_file_name(original);
        mknod(&target, SFlag::S_IFCHR, Mode::empty(), 0).map_err(|e| {
            ImageError::Unpack(format!("whiteout mknod at {}: {e}", target.display()))
        })?;
        chown(&target, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))).map_err(|e| {
            ImageError::Unpack(format!("whiteout chown at {}: {e}", target.display()))
        })?;
        return Ok(true);
    }

    Ok(false)
}

/// Marks `dir` opaque for overlayfs.
fn set_opaque(dir: &Path) -> Result<()> {
    let path = CString::new(dir.as_os_str().as_bytes())
        .map_err(|e| ImageError::Xattr(e.to_string()))?;
    let name = CString::new(OVERLAY_OPAQUE_XATTR)
        .map_err(|e| ImageError::Xattr(e.to_string()))?;

    let rc = unsafe {
        libc::setxattr(
            path.as_ptr(),
            name.as_ptr(),
            b"y".as_ptr().cast::<libc::c_void>(),
            1,
            0,
        )
    };
    if rc != 0 {
        return Err(ImageError::Xattr(format!(
            "setting {OVERLAY_OPAQUE_XATTR} on {}: {}",
            dir.display(),
            io::Error::last_os_error()
        )));
    }

    Ok(())
}

/// Joins `rel` onto `base`, resolving `.` and `..` lexically. Returns
/// `None` when the result would escape `base`.
fn join_contained(base: &Path, rel: &Path) -> Option<PathBuf> {
    let mut out = base.to_path_buf();
    let mut depth = 0usize;

    for component in rel.components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                out.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::{FileTypeExt, MetadataExt};
    use tempfile::tempdir;

    /// One entry of a synthetic layer.
    enum TestEntry<'a> {
        File(&'a str, &'a [u8], u32),
        Dir(&'a str),
        Symlink(&'a str, &'a str),
        Hardlink(&'a str, &'a str),
        Fifo(&'a str),
    }

    /// Writes `path` directly into the header's name field, bypassing the
    /// `tar` crate's own path validation so tests can construct the kind of
    /// malicious archives (e.g. containing `..`) a hostile registry might
    /// serve.
    fn set_raw_path(header: &mut tar::Header, path: &str) {
        let name = &mut header.as_old_mut().name;
        let bytes = path.as_bytes();
        name[..bytes.len()].copy_from_slice(bytes);
        name[bytes.len()..].fill(0);
    }

    fn build_layer(entries: &[TestEntry<'_>]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());

        for entry in entries {
            let mut header = tar::Header::new_gnu();
            match entry {
                TestEntry::File(path, content, mode) => {
                    set_raw_path(&mut header, path);
                    header.set_size(content.len() as u64);
                    header.set_mode(*mode);
                    header.set_cksum();
                    builder.append(&header, *content).unwrap();
                }
                TestEntry::Dir(path) => {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_path(path).unwrap();
                    header.set_size(0);
                    header.set_mode(0o755);
                    header.set_cksum();
                    builder.append(&header, &[][..]).unwrap();
                }
                TestEntry::Symlink(path, target) => {
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_path(path).unwrap();
                    header.set_link_name(target).unwrap();
                    header.set_size(0);
                    header.set_cksum();
                    builder.append(&header, &[][..]).unwrap();
                }
                TestEntry::Hardlink(path, target) => {
                    header.set_entry_type(tar::EntryType::Link);
                    header.set_path(path).unwrap();
                    header.set_link_name(target).unwrap();
                    header.set_size(0);
                    header.set_cksum();
                    builder.append(&header, &[][..]).unwrap();
                }
                TestEntry::Fifo(path) => {
                    header.set_entry_type(tar::EntryType::Fifo);
                    header.set_path(path).unwrap();
                    header.set_size(0);
                    header.set_cksum();
                    builder.append(&header, &[][..]).unwrap();
                }
            }
        }

        let tar_data = builder.into_inner().unwrap();
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(&tar_data).unwrap();
        encoder.finish().unwrap()
    }

    fn store() -> (tempfile::TempDir, LayerStore) {
        let dir = tempdir().unwrap();
        let store = LayerStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_unpack_regular_files() {
        let (_dir, store) = store();
        let blob = build_layer(&[
            TestEntry::Dir("etc"),
            TestEntry::File("etc/hostname", b"box\n", 0o644),
            TestEntry::File("bin-true", b"#!/bin/sh\n", 0o755),
        ]);

        store.unpack_layer("sha256:l0", &blob).unwrap();

        let layer = store.layer_dir("sha256:l0");
        assert_eq!(fs::read(layer.join("etc/hostname")).unwrap(), b"box\n");
        let mode = fs::metadata(layer.join("bin-true")).unwrap().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert!(store.layer_present("sha256:l0"));
    }

    #[test]
    fn test_unpack_symlink_kept_verbatim() {
        let (_dir, store) = store();
        let blob = build_layer(&[TestEntry::Symlink("bin/sh", "/bin/busybox")]);

        store.unpack_layer("sha256:l0", &blob).unwrap();

        let link = store.layer_dir("sha256:l0").join("bin/sh");
        assert_eq!(
            fs::read_link(&link).unwrap(),
            PathBuf::from("/bin/busybox")
        );
    }

    #[test]
    fn test_unpack_hardlink_within_layer() {
        let (_dir, store) = store();
        let blob = build_layer(&[
            TestEntry::File("busybox", b"binary", 0o755),
            TestEntry::Hardlink("links/true", "busybox"),
        ]);

        store.unpack_layer("sha256:l0", &blob).unwrap();

        let layer = store.layer_dir("sha256:l0");
        let a = fs::metadata(layer.join("busybox")).unwrap();
        let b = fs::metadata(layer.join("links/true")).unwrap();
        assert_eq!(a.ino(), b.ino());
    }

    #[test]
    fn test_unpack_hardlink_escape_rejected() {
        let (_dir, store) = store();
        let blob = build_layer(&[TestEntry::Hardlink("evil", "../../../etc/passwd")]);

        let err = store.unpack_layer("sha256:l0", &blob).unwrap_err();
        assert!(matches!(err, ImageError::InvalidHardlink(_)), "{err}");
    }

    #[test]
    fn test_unpack_entry_path_escape_rejected() {
        let (_dir, store) = store();
        let blob = build_layer(&[TestEntry::File("../evil", b"x", 0o644)]);

        let err = store.unpack_layer("sha256:l0", &blob).unwrap_err();
        assert!(matches!(err, ImageError::Unpack(_)), "{err}");
    }

    #[test]
    fn test_unpack_skips_unsupported_types() {
        let (_dir, store) = store();
        let blob = build_layer(&[
            TestEntry::Fifo("some-fifo"),
            TestEntry::File("after", b"still unpacked", 0o644),
        ]);

        store.unpack_layer("sha256:l0", &blob).unwrap();

        let layer = store.layer_dir("sha256:l0");
        assert!(!layer.join("some-fifo").exists());
        assert!(layer.join("after").exists());
    }

    #[test]
    fn test_whiteout_becomes_char_device() {
        if unsafe { libc::geteuid() } != 0 {
            eprintln!("Skipping test: requires root privileges");
            return;
        }

        let (_dir, store) = store();
        let blob = build_layer(&[
            TestEntry::Dir("foo"),
            TestEntry::File("foo/.wh.bar", b"", 0o644),
        ]);

        store.unpack_layer("sha256:l0", &blob).unwrap();

        let foo = store.layer_dir("sha256:l0").join("foo");
        assert!(!foo.join(".wh.bar").exists(), "marker must not be written");

        let meta = fs::metadata(foo.join("bar")).unwrap();
        assert!(meta.file_type().is_char_device());
        assert_eq!(meta.rdev(), 0);
    }

    #[test]
    fn test_opaque_marker_sets_xattr() {
        if unsafe { libc::geteuid() } != 0 {
            eprintln!("Skipping test: requires root privileges");
            return;
        }

        let (_dir, store) = store();
        let blob = build_layer(&[
            TestEntry::Dir("foo"),
            TestEntry::File("foo/.wh..wh..opq", b"", 0o644),
        ]);

        store.unpack_layer("sha256:l0", &blob).unwrap();

        let foo = store.layer_dir("sha256:l0").join("foo");
        assert!(
            !foo.join(".wh..wh..opq").exists(),
            "marker must not be written"
        );

        let path = CString::new(foo.as_os_str().as_bytes()).unwrap();
        let name = CString::new(OVERLAY_OPAQUE_XATTR).unwrap();
        let mut value = [0u8; 1];
        let len = unsafe {
            libc::getxattr(
                path.as_ptr(),
                name.as_ptr(),
                value.as_mut_ptr().cast::<libc::c_void>(),
                1,
            )
        };
        assert_eq!(len, 1);
        assert_eq!(&value, b"y");
    }

    #[test]
    fn test_join_contained() {
        let base = Path::new("/store/blobs");
        assert_eq!(
            join_contained(base, Path::new("sha256:x/etc/passwd")),
            Some(PathBuf::from("/store/blobs/sha256:x/etc/passwd"))
        );
        assert_eq!(
            join_contained(base, Path::new("sha256:x/../sha256:y/f")),
            Some(PathBuf::from("/store/blobs/sha256:y/f"))
        );
        assert_eq!(join_contained(base, Path::new("../outside")), None);
        assert_eq!(join_contained(base, Path::new("/absolute")), None);
        assert_eq!(
            join_contained(base, Path::new("./a/./b")),
            Some(PathBuf::from("/store/blobs/a/b"))
        );
    }
}
