//! OCI document assembly: descriptors, image config, manifests, index,
//! image layout output and structural validation.

pub mod config;
pub mod descriptor;
pub mod index;
pub mod layout;
pub mod manifest;
pub mod validate;

pub use config::ImageConfig;
pub use descriptor::{
    Descriptor, Platform, MEDIA_TYPE_IMAGE_CONFIG, MEDIA_TYPE_IMAGE_INDEX,
    MEDIA_TYPE_IMAGE_MANIFEST, MEDIA_TYPE_LAYER_GZIP,
};
pub use index::Index;
pub use layout::LayoutWriter;
pub use manifest::Manifest;
pub use validate::{validate_index, validate_manifest};
