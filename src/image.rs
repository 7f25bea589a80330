//! Registry of loaded images.
//!
//! The registry backs the planner's block classification: a basic block is
//! traced in full only when it lies inside an image the user declared
//! interesting. Images are appended in load order during the prefix phase
//! and live for the whole process.

use serde::{Deserialize, Serialize};

/// Metadata of one loaded image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Whether the image name matched the user-supplied substring list.
    pub interesting: bool,
    /// The image path as reported by the host.
    pub name: String,
    /// Lowest mapped address over all regions.
    pub start_address: u64,
    /// Highest mapped address over all regions.
    pub end_address: u64,
}

impl ImageInfo {
    /// Checks whether a basic block spanning `[first_address, last_address]`
    /// lies entirely inside this image.
    #[must_use]
    pub fn contains_block(&self, first_address: u64, last_address: u64) -> bool {
        self.start_address <= first_address && last_address <= self.end_address
    }
}

/// Ordered collection of loaded images.
///
/// Lookup is a linear scan in insertion order with first match winning. This
/// runs at translation time only, so even processes with hundreds of images
/// stay cheap.
#[derive(Debug, Default)]
pub struct ImageRegistry {
    images: Vec<ImageInfo>,
}

impl ImageRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an image record.
    pub fn insert(&mut self, image: ImageInfo) {
        self.images.push(image);
    }

    /// Finds the first image containing the given basic block bounds.
    #[must_use]
    pub fn find_containing(&self, first_address: u64, last_address: u64) -> Option<&ImageInfo> {
        self.images
            .iter()
            .find(|image| image.contains_block(first_address, last_address))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.images.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ImageInfo> {
        self.images.iter()
    }
}

/// Case-insensitive substring match of an image name against the
/// user-supplied pattern list. Patterns are expected pre-lowercased.
#[must_use]
pub fn image_is_interesting(name: &str, patterns: &[String]) -> bool {
    let name = name.to_lowercase();
    patterns.iter().any(|pattern| name.contains(pattern))
}
