//! Keeps the most recently analysed frame of each camera on disk as
//! `<dir>/<CAMERA>_last.jpg`, for dashboards and quick inspection.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::config::{normalize_name, ExportConfig};
use crate::error::ExportError;

#[async_trait]
pub trait FrameExporter: Send + Sync {
    async fn export(&self, camera: &str, jpeg: &[u8]) -> Result<(), ExportError>;
}

pub struct DirExporter {
    dir: PathBuf,
}

impl DirExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, camera: &str) -> PathBuf {
        self.dir.join(format!("{}_last.jpg", normalize_name(camera)))
    }
}

fn io_err(path: &Path, source: std::io::Error) -> ExportError {
    ExportError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl FrameExporter for DirExporter {
    /// Write to a sibling temp file, then rename, so readers never see a
    /// half-written JPEG.
    async fn export(&self, camera: &str, jpeg: &[u8]) -> Result<(), ExportError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_err(&self.dir, e))?;

        let target = self.path_for(camera);
        let tmp = target.with_extension("jpg.tmp");
        tokio::fs::write(&tmp, jpeg).await.map_err(|e| io_err(&tmp, e))?;
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(|e| io_err(&target, e))?;
        Ok(())
    }
}

pub struct NoExport;

#[async_trait]
impl FrameExporter for NoExport {
    async fn export(&self, _camera: &str, _jpeg: &[u8]) -> Result<(), ExportError> {
        Ok(())
    }
}

pub fn from_config(cfg: &ExportConfig) -> Box<dyn FrameExporter> {
    if cfg.enabled {
        Box::new(DirExporter::new(&cfg.dir))
    } else {
        Box::new(NoExport)
    }
}
