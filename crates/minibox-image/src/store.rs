//! On-disk layer store.
//!
//! Storage layout:
//! ```text
//! <root>/
//! ├── manifests/                   one JSON per pulled image, named
//! │                                base64(registry ‖ repository ‖ tag).json
//! ├── blobs/
//! │   └── sha256:<digest>/         unpacked layer contents (colon literal)
//! └── containers/
//!     └── <name>/
//!         ├── rootfs/              overlay merged mount point
//!         ├── upper/               overlay upper dir (container writes)
//!         └── workdir/             overlay work dir
//! ```
//!
//! A layer directory's existence is authoritative for "already
//! materialized"; there is no integrity re-check of unpacked layers.

use std::fs;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use nix::mount::{mount, umount, MsFlags};
use tracing::{debug, info};

use crate::error::{ImageError, Result};
use crate::manifest::ImageManifest;
use crate::ImageRef;

/// Handle to a storage root.
pub struct LayerStore {
    root: PathBuf,
}

impl LayerStore {
    /// Opens the store at `root`, creating the directory skeleton if
    /// needed. A pre-existing, correctly shaped root is a no-op success.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for sub in ["manifests", "blobs", "containers"] {
            fs::create_dir_all(root.join(sub))?;
        }
        debug!(root = %root.display(), "storage root ready");
        Ok(Self { root })
    }

    /// Returns the storage root path.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the directory holding unpacked layers.
    #[must_use]
    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    /// Returns the directory for one unpacked layer. The digest's colon
    /// is part of the directory name.
    #[must_use]
    pub fn layer_dir(&self, digest: &str) -> PathBuf {
        self.blobs_dir().join(digest)
    }

    /// Whether `digest` is already materialized on disk.
    ///
    /// Only directory presence is checked; a partially unpacked layer
    /// from an interrupted run is indistinguishable from a complete one.
    #[must_use]
    pub fn layer_present(&self, digest: &str) -> bool {
        self.layer_dir(digest).is_dir()
    }

    /// Returns the per-container directory under `containers/`.
    #[must_use]
    pub fn container_dir(&self, name: &str) -> PathBuf {
        self.root.join("containers").join(name)
    }

    /// Cache filename for an image's manifest. The encoding is stable
    /// across runs; changing it would orphan every cached manifest.
    #[must_use]
    pub fn manifest_key(image: &ImageRef) -> String {
        let raw = format!("{}{}{}", image.registry, image.repository, image.tag);
        format!("{}.json", STANDARD.encode(raw))
    }

    fn manifest_path(&self, image: &ImageRef) -> PathBuf {
        self.root.join("manifests").join(Self::manifest_key(image))
    }

    /// Loads a cached manifest. Any read or parse failure is an error;
    /// callers treat it as a refetch trigger.
    ///
    /// # Errors
    ///
    /// I/O or JSON errors from the cache file.
    pub fn load_manifest(&self, image: &ImageRef) -> Result<ImageManifest> {
        let data = fs::read(self.manifest_path(image))?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Persists a manifest to the cache.
    ///
    /// # Errors
    ///
    /// I/O or JSON errors; callers log these without aborting the run.
    pub fn save_manifest(&self, image: &ImageRef, manifest: &ImageManifest) -> Result<()> {
        let data = serde_json::to_vec(manifest)?;
        fs::write(self.manifest_path(image), data)?;
        Ok(())
    }

    /// Builds the overlay mount options string for `name`.
    ///
    /// The manifest lists layers topmost-first while `lowerdir` stacks
    /// from the rightmost entry up, so the layer list is reversed. The
    /// digest colon inside each path is escaped as `\:` to survive
    /// option splitting.
    #[must_use]
    pub fn overlay_options(&self, manifest: &ImageManifest, name: &str) -> String {
        let container = self.container_dir(name);
        let lowers: Vec<String> = manifest
            .layers
            .iter()
            .rev()
            .map(|layer| {
                self.layer_dir(&layer.digest)
                    .to_string_lossy()
                    .replacen(':', "\\:", 1)
            })
            .collect();

        format!(
            "lowerdir={},upperdir={},workdir={}",
            lowers.join(":"),
            container.join("upper").display(),
            container.join("workdir").display()
        )
    }

    /// Assembles and mounts the overlay for container `name`, returning
    /// the merged rootfs path.
    ///
    /// All layers named by the manifest must already be unpacked, with
    /// whiteout xattrs and character devices in place.
    ///
    /// # Errors
    ///
    /// [`ImageError::Mount`] if the overlay mount fails; I/O errors from
    /// directory creation.
    pub fn mount_overlay(&self, manifest: &ImageManifest, name: &str) -> Result<PathBuf> {
        let container = self.container_dir(name);
        let rootfs = container.join("rootfs");
        for dir in [&rootfs, &container.join("upper"), &container.join("workdir")] {
            fs::create_dir_all(dir)?;
        }

        let options = self.overlay_options(manifest, name);
        debug!(options = %options, "mounting overlay");

        mount(
            Some("overlay"),
            &rootfs,
            Some("overlay"),
            MsFlags::empty(),
            Some(options.as_str()),
        )
        .map_err(|e| {
            ImageError::Mount(format!("overlay mount at {} failed: {e}", rootfs.display()))
        })?;

        info!(rootfs = %rootfs.display(), layers = manifest.layers.len(), "overlay mounted");
        Ok(rootfs)
    }

    /// Unmounts a previously mounted container rootfs.
    ///
    /// # Errors
    ///
    /// [`ImageError::Mount`] if the unmount fails.
    pub fn unmount(rootfs: &Path) -> Result<()> {
        umount(rootfs)
            .map_err(|e| ImageError::Mount(format!("unmounting {}: {e}", rootfs.display())))
    }
}
