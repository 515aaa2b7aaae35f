//! # minibox-image
//!
//! Image acquisition and layered storage for minibox.
//!
//! This crate covers the registry-facing half of the runtime:
//!
//! - Image reference parsing (Docker naming compatible)
//! - Docker Registry HTTP API V2 client with bearer-token auth
//! - Content-addressed layer store with manifest caching
//! - Layer unpacking with AUFS-to-overlayfs whiteout translation
//! - Overlayfs mount assembly for container root filesystems
//!
//! The entry point for callers is [`pull_image`], which drives the
//! cache-or-fetch path, followed by [`LayerStore::mount_overlay`].

pub mod error;
pub mod manifest;
pub mod pull;
pub mod registry;
pub mod store;
mod unpack;

pub use error::{ImageError, Result};
pub use manifest::{Descriptor, ImageManifest};
pub use pull::pull_image;
pub use registry::RegistryClient;
pub use store::LayerStore;

/// Registry used when a reference names no host.
pub const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

/// Parsed image reference (e.g. `docker.io/library/nginx:latest`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ImageRef {
    /// Registry host, possibly with a port (e.g. `somehost.domain:5000`).
    pub registry: String,
    /// Repository path (e.g. `library/nginx`).
    pub repository: String,
    /// Tag, `latest` when the reference names none.
    pub tag: String,
}

impl ImageRef {
    /// Parses a reference of the form `[host[:port]/][path/]name[:tag]`.
    ///
    /// The first `/`-separated segment is taken as the registry host iff
    /// it contains a `.`; otherwise the whole string is a repository
    /// against `default_registry`. The tag is split off the right-hand
    /// `:` of the repository part and defaults to `latest`. Single-segment
    /// names on the default registry get the Docker Hub `library/` prefix.
    ///
    /// # Errors
    ///
    /// [`ImageError::NoDefaultRegistry`] when no host can be resolved and
    /// `default_registry` is empty; [`ImageError::InvalidReference`] when
    /// the repository comes out empty.
    pub fn parse(input: &str, default_registry: &str) -> Result<Self> {
        let (registry, remainder) = match input.split_once('/') {
            Some((first, rest)) if first.contains('.') => (first.to_string(), rest.to_string()),
            _ => {
                if default_registry.is_empty() {
                    return Err(ImageError::NoDefaultRegistry);
                }
                (default_registry.to_string(), input.to_string())
            }
        };

        let (repository, tag) = match remainder.rsplit_once(':') {
            Some((name, tag)) => (name.to_string(), tag.to_string()),
            None => (remainder, "latest".to_string()),
        };

        if repository.is_empty() {
            return Err(ImageError::InvalidReference(input.to_string()));
        }

        // Docker Hub rewrites single-segment names into the library/ space.
        let repository = if registry == default_registry && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };

        Ok(Self {
            registry,
            repository,
            tag,
        })
    }

    /// Returns the full image name, `registry/repository:tag`.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> ImageRef {
        ImageRef::parse(s, DEFAULT_REGISTRY).unwrap()
    }

    #[test]
    fn test_parse_bare_name() {
        let r = parse("busybox");
        assert_eq!(r.registry, "registry-1.docker.io");
        assert_eq!(r.repository, "library/busybox");
        assert_eq!(r.tag, "latest");
    }

    #[test]
    fn test_parse_user_repo() {
        let r = parse("odk/busybox");
        assert_eq!(r.registry, "registry-1.docker.io");
        assert_eq!(r.repository, "odk/busybox");
        assert_eq!(r.tag, "latest");
    }

    #[test]
    fn test_parse_bare_name_with_tag() {
        let r = parse("busybox:v1");
        assert_eq!(r.registry, "registry-1.docker.io");
        assert_eq!(r.repository, "library/busybox");
        assert_eq!(r.tag, "v1");
    }

    #[test]
    fn test_parse_user_repo_with_tag() {
        let r = parse("odk/busybox:v1");
        assert_eq!(r.registry, "registry-1.docker.io");
        assert_eq!(r.repository, "odk/busybox");
        assert_eq!(r.tag, "v1");
    }

    #[test]
    fn test_parse_custom_host() {
        let r = parse("somehost.domain/busybox");
        assert_eq!(r.registry, "somehost.domain");
        assert_eq!(r.repository, "busybox");
        assert_eq!(r.tag, "latest");
    }

    #[test]
    fn test_parse_custom_host_nested_repo() {
        let r = parse("somehost.domain/odk/busybox");
        assert_eq!(r.registry, "somehost.domain");
        assert_eq!(r.repository, "odk/busybox");
        assert_eq!(r.tag, "latest");
    }

    #[test]
    fn test_parse_custom_host_with_port_and_tag() {
        let r = parse("somehost.domain:5000/odk/busybox:v1");
        assert_eq!(r.registry, "somehost.domain:5000");
        assert_eq!(r.repository, "odk/busybox");
        assert_eq!(r.tag, "v1");
    }

    #[test]
    fn test_parse_empty_name() {
        assert!(matches!(
            ImageRef::parse("", DEFAULT_REGISTRY),
            Err(ImageError::InvalidReference(_))
        ));
        assert!(matches!(
            ImageRef::parse("somehost.domain/", DEFAULT_REGISTRY),
            Err(ImageError::InvalidReference(_))
        ));
    }

    #[test]
    fn test_parse_no_default_registry() {
        assert!(matches!(
            ImageRef::parse("busybox", ""),
            Err(ImageError::NoDefaultRegistry)
        ));
    }

    #[test]
    fn test_full_name_reparses() {
        let r = parse("busybox:v1");
        let again = parse(&r.full_name());
        assert_eq!(r, again);
    }
}
