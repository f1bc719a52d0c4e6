//! Rasterisation: document bytes → ordered page images.
//!
//! ## Push, not pull
//!
//! pdfium documents borrow the library binding and their pages borrow the
//! document, so a page iterator cannot outlive the stack frame that opened
//! the file. A [`Rasterizer`] therefore pushes pages into a [`PageSink`]
//! from one blocking call, and the sink decides whether to continue. The
//! pipeline's sink feeds a bounded channel, which callers see as a lazy
//! stream; dropping the stream makes the next push return `Break`.
//!
//! ## Why cap pixels as well as DPI?
//!
//! Page sizes vary wildly: an A0 poster at 300 DPI would produce a
//! 10 000 × 14 000 px bitmap. `max_rendered_pixels` caps the longest edge
//! regardless of physical size, keeping memory bounded per page.

use crate::error::{InputError, RasterError};
use crate::pipeline::input::{sniff_format, DocumentFormat};
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::io::Write;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Per-document rendering parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterOptions {
    pub dpi: u32,
    pub max_rendered_pixels: u32,
    pub max_pages: usize,
}

impl RasterOptions {
    /// Reject empty documents and page counts above `max_pages`.
    pub fn check_page_count(&self, declared: usize) -> Result<(), InputError> {
        if declared > self.max_pages {
            return Err(InputError::ResourceExhausted {
                declared,
                max: self.max_pages,
            });
        }
        if declared == 0 {
            return Err(InputError::EmptyDocument);
        }
        Ok(())
    }
}

/// One rendered page. Owned by exactly one task at a time.
#[derive(Debug)]
pub struct PageImage {
    /// 0-based, contiguous, in document order.
    pub index: usize,
    pub image: DynamicImage,
}

/// Receiver of rendered pages.
pub trait PageSink {
    /// Called once with the declared page count before any page is rendered.
    /// An `Err` must be returned from `rasterize` unchanged.
    fn begin(&mut self, page_count: usize) -> Result<(), RasterError>;

    /// Called before page `index` is rendered. `Break` ends rasterisation
    /// without an error.
    fn before_page(&mut self, index: usize) -> ControlFlow<()>;

    /// Hand over a rendered page. `Break` ends rasterisation.
    fn page(&mut self, page: PageImage) -> ControlFlow<()>;
}

/// Converts a whole document into page images.
///
/// Implementations block; call them from a blocking thread.
pub trait Rasterizer: Send + Sync {
    /// Render every page of `bytes` into `sink` in document order.
    ///
    /// Returns the number of pages handed to the sink. Temporary storage is
    /// released before returning on every path.
    fn rasterize(
        &self,
        bytes: &[u8],
        options: &RasterOptions,
        sink: &mut dyn PageSink,
    ) -> Result<usize, RasterError>;
}

/// The bundled rasteriser: PDF through pdfium, common image formats through
/// `image` as single-page documents.
#[derive(Debug, Clone, Default)]
pub struct StandardRasterizer {
    pdfium_lib_path: Option<PathBuf>,
}

impl StandardRasterizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind pdfium from an explicit library file or directory.
    pub fn with_pdfium_library(path: impl Into<PathBuf>) -> Self {
        Self {
            pdfium_lib_path: Some(path.into()),
        }
    }

    /// Bind pdfium: explicit path, then `PDFIUM_LIB_PATH`, then the system
    /// library search path.
    fn bind_pdfium(&self) -> Result<Pdfium, RasterError> {
        let explicit = self
            .pdfium_lib_path
            .clone()
            .or_else(|| std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from));

        let bindings = match explicit {
            Some(path) => {
                let file = if path.is_dir() {
                    Pdfium::pdfium_platform_library_name_at_path(&path)
                } else {
                    path.clone()
                };
                Pdfium::bind_to_library(&file).map_err(|e| {
                    RasterError::Backend(format!(
                        "Failed to bind pdfium at {}: {e:?}",
                        file.display()
                    ))
                })?
            }
            None => Pdfium::bind_to_system_library().map_err(|e| {
                RasterError::Backend(format!(
                    "pdfium not found on the library path (set PDFIUM_LIB_PATH): {e:?}"
                ))
            })?,
        };
        Ok(Pdfium::new(bindings))
    }

    fn rasterize_pdf(
        &self,
        bytes: &[u8],
        options: &RasterOptions,
        sink: &mut dyn PageSink,
    ) -> Result<usize, RasterError> {
        let pdfium = self.bind_pdfium()?;

        // pdfium reads lazily from the file as pages are rendered; the
        // tempfile is removed when `spill` drops, on every return path.
        let spill = spill_to_tempfile(bytes)?;
        rasterize_pdf_file(&pdfium, spill.path(), options, sink)
    }

    fn rasterize_image(
        &self,
        bytes: &[u8],
        options: &RasterOptions,
        sink: &mut dyn PageSink,
    ) -> Result<usize, RasterError> {
        sink.begin(1)?;
        if sink.before_page(0).is_break() {
            return Ok(0);
        }
        let image = image::load_from_memory(bytes).map_err(|e| InputError::CorruptDocument {
            detail: format!("image decode failed: {e}"),
        })?;
        let image = cap_dimensions(image, options.max_rendered_pixels);
        debug!("Decoded image page → {}x{} px", image.width(), image.height());
        // Last page, so Break and Continue end the same way.
        let _ = sink.page(PageImage { index: 0, image });
        Ok(1)
    }
}

impl Rasterizer for StandardRasterizer {
    fn rasterize(
        &self,
        bytes: &[u8],
        options: &RasterOptions,
        sink: &mut dyn PageSink,
    ) -> Result<usize, RasterError> {
        match sniff_format(bytes)? {
            DocumentFormat::Pdf => self.rasterize_pdf(bytes, options, sink),
            DocumentFormat::Image(_) => self.rasterize_image(bytes, options, sink),
        }
    }
}

fn spill_to_tempfile(bytes: &[u8]) -> Result<tempfile::NamedTempFile, RasterError> {
    let mut tmp = tempfile::Builder::new()
        .prefix("edgequake-ocr-")
        .suffix(".pdf")
        .tempfile()
        .map_err(|e| RasterError::Backend(format!("tempfile: {e}")))?;
    tmp.write_all(bytes)
        .and_then(|()| tmp.flush())
        .map_err(|e| RasterError::Backend(format!("tempfile write: {e}")))?;
    Ok(tmp)
}

fn rasterize_pdf_file(
    pdfium: &Pdfium,
    path: &Path,
    options: &RasterOptions,
    sink: &mut dyn PageSink,
) -> Result<usize, RasterError> {
    let document = pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| InputError::CorruptDocument {
            detail: load_error_detail(&e),
        })?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    info!("PDF loaded: {} pages", total_pages);

    options.check_page_count(total_pages)?;
    sink.begin(total_pages)?;

    let scale = options.dpi as f32 / 72.0;
    let cap = options.max_rendered_pixels as i32;
    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(scale)
        .set_maximum_width(cap)
        .set_maximum_height(cap);

    let mut produced = 0;
    for idx in 0..total_pages {
        if sink.before_page(idx).is_break() {
            debug!("Rasterisation stopped by consumer before page {}", idx + 1);
            break;
        }

        let page = pages
            .get(idx as u16)
            .map_err(|e| InputError::CorruptDocument {
                detail: format!("page {}: {e:?}", idx + 1),
            })?;

        let bitmap =
            page.render_with_config(&render_config)
                .map_err(|e| InputError::CorruptDocument {
                    detail: format!("page {}: render failed: {e:?}", idx + 1),
                })?;

        let image = bitmap.as_image();
        debug!(
            "Rendered page {} → {}x{} px",
            idx + 1,
            image.width(),
            image.height()
        );

        produced += 1;
        if sink.page(PageImage { index: idx, image }).is_break() {
            break;
        }
    }

    Ok(produced)
}

fn load_error_detail(e: &PdfiumError) -> String {
    let detail = format!("{e:?}");
    if detail.to_ascii_lowercase().contains("password") {
        "document is password-protected".to_string()
    } else {
        detail
    }
}

/// Shrink `image` so neither edge exceeds `max_edge`, keeping aspect ratio.
fn cap_dimensions(image: DynamicImage, max_edge: u32) -> DynamicImage {
    if image.width().max(image.height()) <= max_edge {
        return image;
    }
    image.resize(max_edge, max_edge, image::imageops::FilterType::Triangle)
}
