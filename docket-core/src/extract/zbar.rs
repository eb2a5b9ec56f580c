use std::path::PathBuf;

use async_trait::async_trait;
use image::ImageFormat;
use tokio::process::Command;

use super::{Bitmap, BarcodeDecoder, DecodeError};

/// zbarimg exits with this status when the image holds no symbol.
const ZBAR_NOTHING_FOUND: i32 = 4;

/// Decoder backed by `zbarimg --raw -q`.
#[derive(Clone, Debug)]
pub struct ZbarDecoder {
    zbarimg: PathBuf,
}

impl Default for ZbarDecoder {
    fn default() -> Self {
        Self::new("zbarimg")
    }
}

impl ZbarDecoder {
    pub fn new(zbarimg: impl Into<PathBuf>) -> Self {
        Self {
            zbarimg: zbarimg.into(),
        }
    }
}

#[async_trait]
impl BarcodeDecoder for ZbarDecoder {
    async fn decode(
        &self,
        bitmap: &Bitmap,
    ) -> Result<Option<String>, DecodeError> {
        let staging = tempfile::tempdir()?;
        let image_path = staging.path().join("page.png");

        let bitmap = bitmap.clone();
        let target = image_path.clone();
        tokio::task::spawn_blocking(move || {
            bitmap.save_with_format(&target, ImageFormat::Png)
        })
        .await
        .map_err(|err| DecodeError::Encode(err.to_string()))?
        .map_err(|err| DecodeError::Encode(err.to_string()))?;

        let output = Command::new(&self.zbarimg)
            .args(["--raw", "-q"])
            .arg(&image_path)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| DecodeError::Spawn {
                tool: self.zbarimg.display().to_string(),
                source,
            })?;

        match output.status.code() {
            Some(0) => Ok(first_value(&String::from_utf8_lossy(&output.stdout))),
            Some(ZBAR_NOTHING_FOUND) => Ok(None),
            _ => Err(DecodeError::ToolFailed {
                tool: self.zbarimg.display().to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr)
                    .trim()
                    .to_string(),
            }),
        }
    }
}

fn first_value(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}
