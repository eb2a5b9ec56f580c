use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use image::ImageFormat;
use tokio::process::Command;
use tracing::debug;

use super::{Bitmap, RasterError, Rasterizer};

pub const DEFAULT_DPI: u32 = 200;

/// Rasterizer backed by the poppler command line tools.
///
/// Each call stages the PDF bytes in a private temp directory, so the
/// watched file is never opened by the tools.
#[derive(Clone, Debug)]
pub struct PopplerRasterizer {
    pdfinfo: PathBuf,
    pdftoppm: PathBuf,
    dpi: u32,
}

impl Default for PopplerRasterizer {
    fn default() -> Self {
        Self::new("pdfinfo", "pdftoppm", DEFAULT_DPI)
    }
}

impl PopplerRasterizer {
    pub fn new(
        pdfinfo: impl Into<PathBuf>,
        pdftoppm: impl Into<PathBuf>,
        dpi: u32,
    ) -> Self {
        Self {
            pdfinfo: pdfinfo.into(),
            pdftoppm: pdftoppm.into(),
            dpi: dpi.max(1),
        }
    }

    pub fn dpi(&self) -> u32 {
        self.dpi
    }
}

#[async_trait]
impl Rasterizer for PopplerRasterizer {
    async fn page_count(&self, pdf: &[u8]) -> Result<usize, RasterError> {
        let staging = tempfile::tempdir()?;
        let input = stage_pdf(staging.path(), pdf).await?;

        let output = run(Command::new(&self.pdfinfo).arg(&input), &self.pdfinfo)
            .await?;
        if !output.status.success() {
            return Err(tool_failed(&self.pdfinfo, &output));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_page_count(&stdout).ok_or_else(|| {
            RasterError::InvalidOutput("pdfinfo reported no page count".into())
        })
    }

    async fn render(
        &self,
        pdf: &[u8],
        page_index: usize,
    ) -> Result<Bitmap, RasterError> {
        let staging = tempfile::tempdir()?;
        let input = stage_pdf(staging.path(), pdf).await?;
        let root = staging.path().join("page");
        let page = (page_index + 1).to_string();

        let mut command = Command::new(&self.pdftoppm);
        command
            .args(["-f", &page, "-l", &page])
            .args(["-r", &self.dpi.to_string()])
            .args(["-png", "-singlefile"])
            .arg(&input)
            .arg(&root);
        let output = run(&mut command, &self.pdftoppm).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("Wrong page range") {
                return Err(RasterError::PageOutOfRange(page_index));
            }
            return Err(tool_failed(&self.pdftoppm, &output));
        }

        let png = tokio::fs::read(root.with_extension("png")).await?;
        debug!(page = page_index + 1, bytes = png.len(), dpi = self.dpi, "page rendered");
        image::load_from_memory_with_format(&png, ImageFormat::Png)
            .map_err(|err| RasterError::InvalidOutput(err.to_string()))
    }
}

async fn stage_pdf(dir: &Path, pdf: &[u8]) -> Result<PathBuf, RasterError> {
    let input = dir.join("document.pdf");
    tokio::fs::write(&input, pdf).await?;
    Ok(input)
}

async fn run(command: &mut Command, tool: &Path) -> Result<Output, RasterError> {
    command
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| RasterError::Spawn {
            tool: tool.display().to_string(),
            source,
        })
}

fn tool_failed(tool: &Path, output: &Output) -> RasterError {
    RasterError::ToolFailed {
        tool: tool.display().to_string(),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

fn parse_page_count(pdfinfo: &str) -> Option<usize> {
    pdfinfo.lines().find_map(|line| {
        line.strip_prefix("Pages:")
            .and_then(|rest| rest.trim().parse().ok())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pdfinfo_page_line() {
        let stdout = "Producer:       scanner\nPages:          3\nEncrypted:      no\n";
        assert_eq!(parse_page_count(stdout), Some(3));
        assert_eq!(parse_page_count("Title: none\n"), None);
    }

    #[tokio::test]
    async fn missing_tool_is_a_spawn_error() {
        let rasterizer = PopplerRasterizer::new(
            "/nonexistent/pdfinfo",
            "/nonexistent/pdftoppm",
            DEFAULT_DPI,
        );
        let err = rasterizer.page_count(b"%PDF-1.4").await.unwrap_err();
        assert!(matches!(err, RasterError::Spawn { .. }));
    }
}
