use anyhow::{bail, Context, Result};
use std::io::Write;
use std::path::Path;
use std::process::Command;
use tracing::{debug, warn};

use crate::app::ports::PdfTextExtractor;
use crate::constants::OCR_DPI;

/// PDF text via poppler's `pdftotext`, with `pdftoppm` + `tesseract` for pages
/// that carry no text layer.
pub struct PopplerPdfExtractor {
    ocr_lang: String,
}

impl PopplerPdfExtractor {
    pub fn new(ocr_lang: impl Into<String>) -> Self {
        Self {
            ocr_lang: ocr_lang.into(),
        }
    }
}

impl PdfTextExtractor for PopplerPdfExtractor {
    fn extract(&self, bytes: &[u8], max_pages: usize) -> Result<String> {
        let mut tmp = tempfile::Builder::new()
            .prefix("sourcewatch-")
            .suffix(".pdf")
            .tempfile()
            .context("failed to create temp file for PDF")?;
        tmp.write_all(bytes).context("failed to write PDF bytes")?;
        tmp.flush()?;

        let pages = extract_pages_with_pdftotext(tmp.path(), max_pages)?;
        let mut texts = Vec::with_capacity(pages.len());
        for (idx, page) in pages.iter().enumerate() {
            let page_number = idx + 1;
            if !page.trim().is_empty() {
                texts.push(page.trim().to_string());
                continue;
            }
            debug!("page {} has no text layer, running OCR", page_number);
            match extract_page_with_ocr(tmp.path(), page_number, &self.ocr_lang) {
                Ok(text) => texts.push(text),
                Err(e) => {
                    warn!("OCR failed for page {}: {:#}", page_number, e);
                    texts.push(format!("[OCR failed: {e}]"));
                }
            }
        }
        Ok(texts.join("\n").trim().to_string())
    }
}

fn extract_pages_with_pdftotext(pdf_path: &Path, max_pages: usize) -> Result<Vec<String>> {
    let output = Command::new("pdftotext")
        .arg("-enc")
        .arg("UTF-8")
        .arg("-f")
        .arg("1")
        .arg("-l")
        .arg(max_pages.max(1).to_string())
        .arg(pdf_path)
        .arg("-")
        .output()
        .with_context(|| format!("failed to execute pdftotext for {}", pdf_path.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("pdftotext returned non-zero exit status: {}", stderr.trim());
    }

    let raw = String::from_utf8_lossy(&output.stdout);
    let mut pages: Vec<String> = raw
        .split('\u{000C}')
        .map(|chunk| chunk.replace('\u{0000}', ""))
        .collect();
    // pdftotext terminates the last page with a form feed too
    if pages.last().map(|p| p.trim().is_empty()).unwrap_or(false) && pages.len() > 1 {
        pages.pop();
    }
    pages.truncate(max_pages.max(1));
    Ok(pages)
}

fn extract_page_with_ocr(pdf_path: &Path, page_number: usize, ocr_lang: &str) -> Result<String> {
    let scratch = tempfile::tempdir().context("failed to create OCR scratch dir")?;
    let output_root = scratch.path().join(format!("page_{page_number}"));
    let png_path = output_root.with_extension("png");

    let pdftoppm_output = Command::new("pdftoppm")
        .arg("-f")
        .arg(page_number.to_string())
        .arg("-l")
        .arg(page_number.to_string())
        .arg("-r")
        .arg(OCR_DPI.to_string())
        .arg("-singlefile")
        .arg("-png")
        .arg(pdf_path)
        .arg(&output_root)
        .output()
        .context("failed to execute pdftoppm")?;

    if !pdftoppm_output.status.success() {
        let stderr = String::from_utf8_lossy(&pdftoppm_output.stderr);
        bail!("pdftoppm failed on page {}: {}", page_number, stderr.trim());
    }
    if !png_path.exists() {
        bail!("pdftoppm did not produce an image for page {}", page_number);
    }

    let tesseract_output = Command::new("tesseract")
        .arg(&png_path)
        .arg("stdout")
        .arg("-l")
        .arg(ocr_lang)
        .output()
        .context("failed to execute tesseract")?;

    if !tesseract_output.status.success() {
        let stderr = String::from_utf8_lossy(&tesseract_output.stderr);
        bail!("tesseract failed on page {}: {}", page_number, stderr.trim());
    }

    Ok(String::from_utf8_lossy(&tesseract_output.stdout)
        .replace('\u{0000}', "")
        .trim()
        .to_string())
}
