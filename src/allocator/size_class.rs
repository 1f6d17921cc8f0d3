//! Size-class ladders
//!
//! A ladder is a sorted list of object sizes. Requests map to the smallest
//! class that fits via binary search.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Powers of two from 8B to 64KB
pub const STANDARD_CLASSES: [usize; 14] = [
    8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768, 65536,
];

/// Finer steps (1.5x between powers of two) for general-purpose heaps
pub const FINE_CLASSES: [usize; 24] = [
    8, 16, 24, 32, 48, 64, 96, 128, 192, 256, 384, 512, 768, 1024, 1536, 2048, 3072, 4096,
    6144, 8192, 12288, 16384, 24576, 32768,
];

/// Objects carved per slab never drop below this
pub const MIN_OBJECTS_PER_SLAB: usize = 8;

/// Which ladder a slab allocator uses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClassLadder {
    Standard,
    Fine,
    Custom(Vec<usize>),
}

impl Default for SizeClassLadder {
    fn default() -> Self {
        SizeClassLadder::Standard
    }
}

/// Validated, immutable ladder
#[derive(Debug, Clone)]
pub struct SizeClasses {
    sizes: Arc<[usize]>,
}

impl SizeClasses {
    /// Validate and freeze a ladder.
    ///
    /// Sizes must be non-empty, strictly increasing, and multiples of 8.
    pub fn new(ladder: &SizeClassLadder) -> Result<Self, ConfigError> {
        let sizes: &[usize] = match ladder {
            SizeClassLadder::Standard => &STANDARD_CLASSES,
            SizeClassLadder::Fine => &FINE_CLASSES,
            SizeClassLadder::Custom(sizes) => sizes,
        };

        if sizes.is_empty() {
            return Err(ConfigError::invalid("size_classes", "ladder is empty"));
        }
        if let Some(bad) = sizes.iter().find(|&&s| s == 0 || s % 8 != 0) {
            return Err(ConfigError::invalid(
                "size_classes",
                format!("class {} is not a non-zero multiple of 8", bad),
            ));
        }
        if sizes.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::invalid(
                "size_classes",
                "classes must be strictly increasing",
            ));
        }

        Ok(Self {
            sizes: sizes.into(),
        })
    }

    pub fn standard() -> Self {
        Self {
            sizes: STANDARD_CLASSES.as_slice().into(),
        }
    }

    /// Index of the smallest class holding `size` bytes
    #[inline]
    pub fn class_for(&self, size: usize) -> Option<usize> {
        if size == 0 {
            return None;
        }
        let idx = self.sizes.partition_point(|&class| class < size);
        (idx < self.sizes.len()).then_some(idx)
    }

    #[inline]
    pub fn size_of(&self, class: usize) -> usize {
        self.sizes[class]
    }

    #[inline]
    pub fn max_size(&self) -> usize {
        self.sizes[self.sizes.len() - 1]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }
}

/// Objects carved from one page-sized slab of `object_size`
#[inline]
pub fn objects_per_slab(object_size: usize, page_size: usize) -> usize {
    (page_size / object_size).max(MIN_OBJECTS_PER_SLAB)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_standard_lookup() {
        let classes = SizeClasses::standard();
        assert_eq!(classes.class_for(1), Some(0));
        assert_eq!(classes.class_for(8), Some(0));
        assert_eq!(classes.class_for(9), Some(1));
        assert_eq!(classes.size_of(classes.class_for(40).unwrap()), 64);
        assert_eq!(classes.class_for(65536), Some(13));
        assert_eq!(classes.class_for(65537), None);
        assert_eq!(classes.class_for(0), None);
    }

    #[test]
    fn test_fine_lookup() {
        let classes = SizeClasses::new(&SizeClassLadder::Fine).unwrap();
        assert_eq!(classes.size_of(classes.class_for(40).unwrap()), 48);
        assert_eq!(classes.size_of(classes.class_for(100).unwrap()), 192);
        assert_eq!(classes.max_size(), 32768);
    }

    #[test]
    fn test_custom_ladder_validation() {
        assert!(SizeClasses::new(&SizeClassLadder::Custom(vec![])).is_err());
        assert!(SizeClasses::new(&SizeClassLadder::Custom(vec![8, 12])).is_err());
        assert!(SizeClasses::new(&SizeClassLadder::Custom(vec![16, 8])).is_err());
        assert!(SizeClasses::new(&SizeClassLadder::Custom(vec![16, 16])).is_err());
        let ok = SizeClasses::new(&SizeClassLadder::Custom(vec![16, 40, 96])).unwrap();
        assert_eq!(ok.max_size(), 96);
    }

    #[test]
    fn test_objects_per_slab() {
        assert_eq!(objects_per_slab(64, 4096), 64);
        assert_eq!(objects_per_slab(4096, 4096), 8);
        assert_eq!(objects_per_slab(65536, 4096), 8);
    }

    proptest! {
        #[test]
        fn class_is_smallest_fit(size in 1usize..=65536) {
            let classes = SizeClasses::standard();
            let idx = classes.class_for(size).unwrap();
            prop_assert!(classes.size_of(idx) >= size);
            if idx > 0 {
                prop_assert!(classes.size_of(idx - 1) < size);
            }
        }
    }
}
