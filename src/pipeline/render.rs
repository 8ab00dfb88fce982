//! PDF rasterisation: render selected pages to fixed-resolution bitmaps.
//!
//! `pdfium-render` wraps the pdfium C++ library, which is not async-safe, so
//! callers run [`PageRenderer::render`] inside `spawn_blocking`. Every page is
//! rendered to the same longest-edge budget (`max_rendered_pixels`) so the
//! OCR service sees comparable input whatever the physical page size.

use crate::config::PageSelection;
use crate::error::{Ocr2MdError, PageError};
use image::DynamicImage;
use pdfium_render::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Document-level metadata, available without rendering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub producer: Option<String>,
    pub page_count: usize,
    pub pdf_version: String,
}

/// One selected page after rasterisation.
#[derive(Debug)]
pub struct RenderedPage {
    /// 1-indexed.
    pub page_number: usize,
    pub bitmap: Result<DynamicImage, PageError>,
}

/// All selected pages of a document, in page order.
#[derive(Debug)]
pub struct RenderedDocument {
    pub total_pages: usize,
    pub pages: Vec<RenderedPage>,
}

/// Rasterises PDF bytes. Blocking; call from `spawn_blocking`.
pub trait PageRenderer: Send + Sync {
    /// Render the selected pages. Unreadable documents are fatal; a single
    /// page that fails to rasterise is reported in its [`RenderedPage`].
    fn render(
        &self,
        pdf: &[u8],
        selection: &PageSelection,
        password: Option<&str>,
    ) -> Result<RenderedDocument, Ocr2MdError>;

    /// Read metadata without rendering.
    fn inspect(&self, pdf: &[u8], password: Option<&str>) -> Result<DocumentMetadata, Ocr2MdError>;
}

/// [`PageRenderer`] backed by pdfium.
#[derive(Debug, Clone)]
pub struct PdfiumRenderer {
    max_rendered_pixels: u32,
}

impl PdfiumRenderer {
    pub fn new(max_rendered_pixels: u32) -> Self {
        Self { max_rendered_pixels }
    }
}

fn load_error(err: PdfiumError, password: Option<&str>) -> Ocr2MdError {
    let err_str = format!("{err:?}");
    if err_str.contains("Password") || err_str.contains("password") {
        if password.is_some() {
            Ocr2MdError::WrongPassword
        } else {
            Ocr2MdError::PasswordRequired
        }
    } else {
        Ocr2MdError::CorruptPdf { detail: err_str }
    }
}

fn render_one(
    pages: &PdfPages<'_>,
    idx: usize,
    config: &PdfRenderConfig,
) -> Result<DynamicImage, PdfiumError> {
    let page = pages.get(idx as u16)?;
    let bitmap = page.render_with_config(config)?;
    Ok(bitmap.as_image())
}

impl PageRenderer for PdfiumRenderer {
    fn render(
        &self,
        pdf: &[u8],
        selection: &PageSelection,
        password: Option<&str>,
    ) -> Result<RenderedDocument, Ocr2MdError> {
        let pdfium = Pdfium::default();
        let document = pdfium
            .load_pdf_from_byte_slice(pdf, password)
            .map_err(|e| load_error(e, password))?;

        let pages = document.pages();
        let total_pages = pages.len() as usize;
        let indices = selection.to_indices(total_pages);
        info!("PDF loaded: {} pages, {} selected", total_pages, indices.len());

        let render_config = PdfRenderConfig::new()
            .set_target_width(self.max_rendered_pixels as i32)
            .set_maximum_height(self.max_rendered_pixels as i32);

        let rendered = indices
            .into_iter()
            .map(|idx| {
                let page_number = idx + 1;
                let bitmap = render_one(&pages, idx, &render_config).map_err(|e| PageError::RenderFailed {
                    page: page_number,
                    detail: format!("{e:?}"),
                });
                if let Ok(ref img) = bitmap {
                    debug!("Rendered page {} → {}x{} px", page_number, img.width(), img.height());
                }
                RenderedPage { page_number, bitmap }
            })
            .collect();

        Ok(RenderedDocument {
            total_pages,
            pages: rendered,
        })
    }

    fn inspect(&self, pdf: &[u8], password: Option<&str>) -> Result<DocumentMetadata, Ocr2MdError> {
        let pdfium = Pdfium::default();
        let document = pdfium
            .load_pdf_from_byte_slice(pdf, password)
            .map_err(|e| load_error(e, password))?;

        let metadata = document.metadata();
        let get_meta = |tag: PdfDocumentMetadataTagType| -> Option<String> {
            metadata
                .get(tag)
                .map(|t| t.value().to_string())
                .filter(|v| !v.is_empty())
        };

        Ok(DocumentMetadata {
            title: get_meta(PdfDocumentMetadataTagType::Title),
            author: get_meta(PdfDocumentMetadataTagType::Author),
            producer: get_meta(PdfDocumentMetadataTagType::Producer),
            page_count: document.pages().len() as usize,
            pdf_version: format!("{:?}", document.version()),
        })
    }
}
