//! Region cropping: cut every detected region out of the page bitmap.
//!
//! The Nth crop corresponds to the Nth region box and therefore to the Nth
//! placeholder in the transcript. Nothing here sorts, deduplicates or drops
//! boxes. A box that cannot be projected still yields an image (a 1×1 white
//! PNG flagged as `placeholder`) so the count never shifts.

use crate::geometry::{PixelRect, RegionBox};
use crate::pipeline::encode;
use crate::store::{content_hash, BlobRef, BlobStore, StoreError};
use image::{DynamicImage, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// One cropped region of a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CroppedImage {
    pub page_number: usize,
    /// 1-based, dense, in region order.
    pub index: usize,
    /// PNG bytes.
    #[serde(skip)]
    pub bytes: Vec<u8>,
    /// Pixel bounds on the rendered page; zeroed for placeholder crops.
    pub bounds: PixelRect,
    /// `true` when the region was unusable and a blank image stands in.
    pub placeholder: bool,
    /// Where the crop was stored, once it has been.
    pub reference: Option<BlobRef>,
}

#[derive(Debug, Error)]
pub enum CropError {
    #[error("page {page}, region {index}: PNG encoding failed: {source}")]
    Encode {
        page: usize,
        index: usize,
        #[source]
        source: image::ImageError,
    },

    #[error("cropping task failed: {0}")]
    Join(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Hex digits of the content digest embedded in artifact keys.
const ARTIFACT_DIGEST_LEN: usize = 16;

/// Whether `png` is the content an artifact key was written for.
pub fn artifact_matches(key: &str, png: &[u8]) -> bool {
    key.strip_suffix(".png")
        .and_then(|stem| stem.rsplit_once('-'))
        .is_some_and(|(_, digest)| {
            digest.len() == ARTIFACT_DIGEST_LEN && content_hash(png).starts_with(digest)
        })
}

fn blank() -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(1, 1, Rgb([255, 255, 255])))
}

/// Crop `boxes` out of `bitmap`, one image per box, in input order.
pub fn crop_regions(
    page_number: usize,
    bitmap: &DynamicImage,
    boxes: &[RegionBox],
) -> Result<Vec<CroppedImage>, CropError> {
    let (width, height) = (bitmap.width(), bitmap.height());

    boxes
        .iter()
        .enumerate()
        .map(|(i, region)| {
            let index = i + 1;
            let (image, bounds, placeholder) = match region.to_pixels(width, height) {
                Ok(rect) => {
                    if let Err(e) = region.validate() {
                        debug!("Page {}: region {} clamped ({})", page_number, index, e);
                    }
                    let crop = bitmap.crop_imm(rect.x1, rect.y1, rect.width(), rect.height());
                    (crop, rect, false)
                }
                Err(e) => {
                    warn!(
                        "Page {}: region {} unusable ({}), substituting blank image",
                        page_number, index, e
                    );
                    (blank(), PixelRect::default(), true)
                }
            };
            let bytes = encode::encode_png(&image).map_err(|source| CropError::Encode {
                page: page_number,
                index,
                source,
            })?;
            Ok(CroppedImage {
                page_number,
                index,
                bytes,
                bounds,
                placeholder,
                reference: None,
            })
        })
        .collect()
}

/// Crops regions and writes them to the artifact store.
#[derive(Clone)]
pub struct RegionCropper {
    store: Arc<dyn BlobStore>,
}

impl RegionCropper {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    /// Store key of one crop: `(cache_key, page_number, index)` plus a
    /// digest of the PNG bytes. Create-if-absent can therefore only skip a
    /// write of identical pixels; a rerun that yields different boxes gets
    /// fresh keys.
    pub fn artifact_key(cache_key: &str, page_number: usize, index: usize, png: &[u8]) -> String {
        let digest = content_hash(png);
        format!(
            "artifacts/{cache_key}/page-{page_number:04}/image-{index:03}-{}.png",
            &digest[..ARTIFACT_DIGEST_LEN]
        )
    }

    /// Crop on the blocking pool, then store every crop with create-if-absent.
    ///
    /// Takes the bitmap by value: it is not needed after this stage.
    pub async fn crop(
        &self,
        cache_key: &str,
        page_number: usize,
        bitmap: DynamicImage,
        boxes: Vec<RegionBox>,
    ) -> Result<Vec<CroppedImage>, CropError> {
        let mut crops = tokio::task::spawn_blocking(move || crop_regions(page_number, &bitmap, &boxes))
            .await
            .map_err(|e| CropError::Join(e.to_string()))??;

        for crop in &mut crops {
            let key = Self::artifact_key(cache_key, page_number, crop.index, &crop.bytes);
            let mut reference = self.store.put_if_absent(&key, crop.bytes.clone()).await?;
            // An existing blob under a content key must hold that content.
            if !artifact_matches(&key, &self.store.get(&key).await?) {
                warn!("Page {}: replacing damaged artifact {}", page_number, key);
                reference = self.store.put(&key, crop.bytes.clone()).await?;
            }
            crop.reference = Some(reference);
        }

        debug!("Page {}: stored {} crops", page_number, crops.len());
        Ok(crops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBlobStore;
    use image::RgbaImage;

    fn page(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::new(width, height))
    }

    fn boxes() -> Vec<RegionBox> {
        vec![
            RegionBox::new(0.0, 0.0, 100.0, 100.0),
            RegionBox::new(500.0, 500.0, 900.0, 700.0),
            RegionBox::new(200.0, 800.0, 300.0, 999.0),
        ]
    }

    #[test]
    fn one_crop_per_box() {
        let crops = crop_regions(1, &page(1000, 1000), &boxes()).unwrap();
        assert_eq!(crops.len(), 3);
        assert_eq!(crops.iter().map(|c| c.index).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(crops.iter().all(|c| !c.placeholder && c.page_number == 1));
        assert_eq!((crops[1].bounds.width(), crops[1].bounds.height()), (400, 200));
    }

    #[test]
    fn crop_order_follows_box_order() {
        let bitmap = page(1000, 1000);
        let forward = crop_regions(1, &bitmap, &boxes()).unwrap();

        let mut shuffled = boxes();
        shuffled.rotate_left(1);
        let rotated = crop_regions(1, &bitmap, &shuffled).unwrap();

        assert_eq!(rotated[0].bounds, forward[1].bounds);
        assert_eq!(rotated[1].bounds, forward[2].bounds);
        assert_eq!(rotated[2].bounds, forward[0].bounds);
    }

    #[test]
    fn degenerate_box_yields_blank_placeholder() {
        let mut regions = boxes();
        regions.insert(1, RegionBox::new(400.0, 400.0, 300.0, 500.0));
        let crops = crop_regions(2, &page(600, 800), &regions).unwrap();

        assert_eq!(crops.len(), 4);
        assert!(crops[1].placeholder);
        assert_eq!(crops[1].bounds, PixelRect::default());
        let decoded = image::load_from_memory(&crops[1].bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (1, 1));
        assert!(!crops[2].placeholder);
    }

    #[test]
    fn no_boxes_no_crops() {
        assert!(crop_regions(1, &page(10, 10), &[]).unwrap().is_empty());
    }

    #[tokio::test]
    async fn cropper_stores_each_crop_under_its_own_key() {
        let store = Arc::new(MemoryBlobStore::new());
        let cropper = RegionCropper::new(store.clone());

        let crops = cropper.crop("abc", 3, page(1000, 1000), boxes()).await.unwrap();

        assert_eq!(store.len(), 3);
        for crop in &crops {
            let key = RegionCropper::artifact_key("abc", 3, crop.index, &crop.bytes);
            assert!(key.starts_with(&format!("artifacts/abc/page-0003/image-{:03}-", crop.index)));
            assert_eq!(crop.reference, Some(BlobRef::new(format!("mem://{key}"))));
            assert!(artifact_matches(&key, &store.get(&key).await.unwrap()));
        }
    }

    #[tokio::test]
    async fn different_pixels_never_share_a_key() {
        let store = Arc::new(MemoryBlobStore::new());
        let cropper = RegionCropper::new(store.clone());

        let small = cropper
            .crop("abc", 1, page(1000, 1000), vec![RegionBox::new(0.0, 0.0, 100.0, 100.0)])
            .await
            .unwrap();
        let large = cropper
            .crop("abc", 1, page(1000, 1000), vec![RegionBox::new(0.0, 0.0, 500.0, 300.0)])
            .await
            .unwrap();

        assert_ne!(small[0].reference, large[0].reference);
        let key = store.key_of(large[0].reference.as_ref().unwrap()).unwrap();
        let stored = image::load_from_memory(&store.get(&key).await.unwrap()).unwrap();
        assert_eq!((stored.width(), stored.height()), (501, 300));
    }

    #[tokio::test]
    async fn damaged_artifact_is_rewritten() {
        let store = Arc::new(MemoryBlobStore::new());
        let cropper = RegionCropper::new(store.clone());

        let first = cropper.crop("abc", 1, page(1000, 1000), boxes()).await.unwrap();
        let key = store.key_of(first[0].reference.as_ref().unwrap()).unwrap();
        store.put(&key, b"garbage".to_vec()).await.unwrap();

        let again = cropper.crop("abc", 1, page(1000, 1000), boxes()).await.unwrap();
        assert_eq!(again[0].reference, first[0].reference);
        assert_eq!(store.get(&key).await.unwrap(), again[0].bytes);
    }

    #[test]
    fn artifact_digest_detects_foreign_content() {
        let key = RegionCropper::artifact_key("abc", 1, 1, b"png bytes");
        assert!(artifact_matches(&key, b"png bytes"));
        assert!(!artifact_matches(&key, b"garbage"));
        assert!(!artifact_matches("artifacts/abc/page-0001/image-001.png", b"png bytes"));
    }

    #[tokio::test]
    async fn repeated_crop_keeps_first_artifact() {
        let store = Arc::new(MemoryBlobStore::new());
        let cropper = RegionCropper::new(store.clone());

        let first = cropper.crop("abc", 1, page(1000, 1000), boxes()).await.unwrap();
        let second = cropper.crop("abc", 1, page(1000, 1000), boxes()).await.unwrap();

        assert_eq!(store.len(), 3);
        assert_eq!(first[0].reference, second[0].reference);
    }
}
