//! Detection class set → image category.

use std::collections::BTreeSet;

use crate::ImageCategory;

pub const COCO_PERSON: u32 = 0;
pub const COCO_HANDBAG: u32 = 26;
pub const COCO_BOTTLE: u32 = 39;
pub const COCO_CUP: u32 = 41;
pub const COCO_BOWL: u32 = 45;
pub const COCO_BOOK: u32 = 73;

/// Which detector classes count as a person and which as a product-like
/// container. Fixed at construction; never discovered at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassTaxonomy {
    person: u32,
    product_like: BTreeSet<u32>,
}

impl Default for ClassTaxonomy {
    fn default() -> Self {
        // Boxed products are routinely detected as books or handbags.
        Self::new(
            COCO_PERSON,
            [COCO_BOTTLE, COCO_CUP, COCO_BOWL, COCO_HANDBAG, COCO_BOOK],
        )
    }
}

impl ClassTaxonomy {
    pub fn new(person: u32, product_like: impl IntoIterator<Item = u32>) -> Self {
        Self {
            person,
            product_like: product_like.into_iter().collect(),
        }
    }

    pub fn is_product_like(&self, class: u32) -> bool {
        self.product_like.contains(&class)
    }

    pub fn classify(&self, detected: &[u32]) -> ImageCategory {
        let has_person = detected.contains(&self.person);
        let has_product = detected.iter().any(|c| self.is_product_like(*c));

        match (has_person, has_product) {
            (true, true) => ImageCategory::Promotional,
            (false, true) => ImageCategory::ProductDisplay,
            (true, false) => ImageCategory::Lifestyle,
            (false, false) => ImageCategory::Other,
        }
    }
}

/// Classify with the default COCO taxonomy.
pub fn classify(detected: &[u32]) -> ImageCategory {
    ClassTaxonomy::default().classify(detected)
}

/// Highest per-box confidence, or 0.0 when nothing was detected.
pub fn best_confidence(scores: &[f64]) -> f64 {
    scores
        .iter()
        .copied()
        .filter(|s| !s.is_nan())
        .fold(None, |best: Option<f64>, s| Some(best.map_or(s, |b| b.max(s))))
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documented_examples() {
        assert_eq!(classify(&[0, 39]), ImageCategory::Promotional);
        assert_eq!(classify(&[39]), ImageCategory::ProductDisplay);
        assert_eq!(classify(&[0]), ImageCategory::Lifestyle);
        assert_eq!(classify(&[]), ImageCategory::Other);
        // dining table is not a product
        assert_eq!(classify(&[0, 67]), ImageCategory::Lifestyle);
        assert_eq!(classify(&[67]), ImageCategory::Other);
    }

    #[test]
    fn order_and_duplicates_do_not_matter() {
        let a = classify(&[73, 0, 0, 2]);
        let b = classify(&[2, 0, 73]);
        assert_eq!(a, ImageCategory::Promotional);
        assert_eq!(a, b);
    }

    #[test]
    fn every_product_like_class_counts() {
        for class in [COCO_BOTTLE, COCO_CUP, COCO_BOWL, COCO_HANDBAG, COCO_BOOK] {
            assert_eq!(classify(&[class]), ImageCategory::ProductDisplay, "class {class}");
            assert_eq!(classify(&[COCO_PERSON, class]), ImageCategory::Promotional);
        }
    }

    #[test]
    fn custom_taxonomy_is_respected() {
        let taxonomy = ClassTaxonomy::new(1, [67]);
        assert_eq!(taxonomy.classify(&[0, 67]), ImageCategory::ProductDisplay);
        assert_eq!(taxonomy.classify(&[1]), ImageCategory::Lifestyle);
    }

    #[test]
    fn best_confidence_is_max_or_zero() {
        assert_eq!(best_confidence(&[]), 0.0);
        assert_eq!(best_confidence(&[0.3, 0.91, 0.5]), 0.91);
        assert_eq!(best_confidence(&[f64::NAN, 0.2]), 0.2);
    }
}
