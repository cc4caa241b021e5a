use crate::core::BrowserTrait;
use crate::errors::{HarnessError, Result};
use crate::types::Capture;
use std::path::Path;

pub struct ScreenshotManager;

impl ScreenshotManager {
    pub async fn capture<B: BrowserTrait>(
        browser: &B,
        tab: &B::TabHandle,
        capture: Capture,
    ) -> Result<Vec<u8>> {
        let bytes = browser.take_screenshot(tab, capture).await?;
        if bytes.is_empty() {
            return Err(HarnessError::ScreenshotFailed(
                "browser returned an empty image".to_string(),
            ));
        }
        Ok(bytes)
    }

    pub async fn save_to_file(bytes: &[u8], file_path: &Path) -> Result<()> {
        if let Some(parent) = file_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(file_path, bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/shot.png");

        ScreenshotManager::save_to_file(b"\x89PNG", &path).await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"\x89PNG");
    }
}
