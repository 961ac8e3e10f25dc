use std::path::{Path, PathBuf};
use std::process::Command;

use crate::{sibling_filename, ArtifactError};

pub const THUMBNAIL_WIDTH: u32 = 600;

/// First-page PNG next to the PDF it was rendered from.
pub fn thumbnail_filename(pdf_filename: &str) -> Result<String, ArtifactError> {
    sibling_filename(pdf_filename, ".pdf", ".png")
}

/// Renders the first page of a PDF to a fixed-width PNG.
pub trait Rasterizer: Send + Sync {
    fn render_first_page(&self, pdf: &Path, png: &Path) -> Result<(), ArtifactError>;
}

/// Shells out to poppler's `pdftoppm`.
#[derive(Debug, Clone)]
pub struct PdftoppmRasterizer {
    pub program: PathBuf,
    pub width: u32,
}

impl Default for PdftoppmRasterizer {
    fn default() -> Self {
        Self {
            program: PathBuf::from("pdftoppm"),
            width: THUMBNAIL_WIDTH,
        }
    }
}

impl PdftoppmRasterizer {
    fn command(&self, pdf: &Path, prefix: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["-png", "-singlefile", "-scale-to-x"])
            .arg(self.width.to_string())
            .args(["-scale-to-y", "-1"])
            .arg(pdf)
            .arg(prefix);
        cmd
    }
}

impl Rasterizer for PdftoppmRasterizer {
    fn render_first_page(&self, pdf: &Path, png: &Path) -> Result<(), ArtifactError> {
        // pdftoppm appends ".png" to the prefix itself.
        let prefix = png.with_extension("");
        let status = self.command(pdf, &prefix).status()?;
        if !status.success() {
            return Err(ArtifactError::Command {
                program: self.program.display().to_string(),
                status: status.to_string(),
            });
        }
        if !png.exists() {
            return Err(ArtifactError::MissingOutput(png.to_path_buf()));
        }
        Ok(())
    }
}
