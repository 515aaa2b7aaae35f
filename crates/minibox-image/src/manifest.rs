//! Docker image manifest (schema version 2) types.

use serde::{Deserialize, Serialize};

// Well-known media types, from the Docker distribution spec.
pub const MEDIA_TYPE_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_IMAGE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const MEDIA_TYPE_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const MEDIA_TYPE_FOREIGN_LAYER: &str =
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";
pub const MEDIA_TYPE_UNCOMPRESSED_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";

/// The only manifest schema version this runtime understands.
pub const SUPPORTED_SCHEMA_VERSION: u32 = 2;

/// Docker V2 image manifest.
///
/// Layer order is significant: index 0 is the topmost layer. Overlay
/// assembly reverses the list so the rightmost `lowerdir` entry is the
/// bottom of the stack (see `LayerStore::overlay_options`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Schema version (must be 2).
    pub schema_version: u32,
    /// Media type.
    #[serde(default)]
    pub media_type: String,
    /// Config descriptor.
    pub config: Descriptor,
    /// Layer descriptors, topmost first.
    pub layers: Vec<Descriptor>,
}

/// Content descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type.
    #[serde(default)]
    pub media_type: String,
    /// Content size in bytes.
    #[serde(default)]
    pub size: u64,
    /// Content digest, `<algorithm>:<hex>`. The colon is literal in
    /// on-disk layer directory names.
    pub digest: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_decode_camel_case() {
        let raw = r#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
            "config": {
                "mediaType": "application/vnd.docker.container.image.v1+json",
                "size": 1469,
                "digest": "sha256:3f57d9401f8d42f986df300f0c69192fc41da28ccc8d797829467780db3dd741"
            },
            "layers": [
                {
                    "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                    "size": 2220094,
                    "digest": "sha256:9ad63333ebc97e32b987ae66aa3cff81300e4c2e6d2f2395cef8a3ae18b249fe"
                }
            ]
        }"#;

        let manifest: ImageManifest = serde_json::from_str(raw).unwrap();
        assert_eq!(manifest.schema_version, SUPPORTED_SCHEMA_VERSION);
        assert_eq!(manifest.media_type, MEDIA_TYPE_MANIFEST_V2);
        assert_eq!(manifest.layers.len(), 1);
        assert_eq!(manifest.layers[0].media_type, MEDIA_TYPE_LAYER);
        assert!(manifest.layers[0].digest.starts_with("sha256:"));
    }

    #[test]
    fn test_manifest_roundtrip() {
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: MEDIA_TYPE_MANIFEST_V2.to_string(),
            config: Descriptor {
                media_type: MEDIA_TYPE_IMAGE_CONFIG.to_string(),
                size: 42,
                digest: "sha256:aaaa".to_string(),
            },
            layers: vec![],
        };

        let json = serde_json::to_string(&manifest).unwrap();
        assert!(json.contains("schemaVersion"));
        assert!(json.contains("mediaType"));

        let back: ImageManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.config.digest, "sha256:aaaa");
    }
}
