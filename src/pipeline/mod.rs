//! Pipeline stages for scanned-PDF conversion.
//!
//! Each submodule implements exactly one transformation step; the page and
//! document orchestrators ([`crate::page`], [`crate::document`]) drive them.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ ocr ──────────▶ crop ──▶ reconcile
//! (bytes)   (pdfium)   (http | vision)  (png)    (crate::reconcile)
//!                       └ cleanup + placeholder/region check
//! ```
//!
//! 1. [`input`]: read a local path or download a URL, check `%PDF`
//! 2. [`render`]: rasterise selected pages; runs in `spawn_blocking` because
//!    pdfium is not async-safe
//! 3. [`ocr`]: the gateway, one backend call per attempt, verified
//!    placeholder/region correspondence. Backends: [`http_ocr`], [`vision`]
//! 4. [`cleanup`]: deterministic Markdown fixes applied to OCR output
//! 5. [`crop`]: cut regions out of the bitmap and store them
//!
//! [`encode`] holds the PNG/base64 helpers shared by the stages.

pub mod cleanup;
pub mod crop;
pub mod encode;
pub mod http_ocr;
pub mod input;
pub mod ocr;
pub mod render;
pub mod vision;
