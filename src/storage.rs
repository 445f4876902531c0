use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};

/// 上传文件的磁盘布局
///
/// 每个飞盘独占 `{root}/{disc_id}/`，其中只存放
/// `original-{image_id}.{ext}` 和可选的 `cropped-{image_id}.{ext}`。
/// 不同飞盘的子树互不相交，并发写入不会冲突。
#[derive(Debug, Clone)]
pub struct DiscStorage {
    root: PathBuf,
}

impl DiscStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn disc_dir(&self, disc_id: i64) -> PathBuf {
        self.root.join(disc_id.to_string())
    }

    pub fn original_path(&self, disc_id: i64, image_id: i64, ext: &str) -> PathBuf {
        self.disc_dir(disc_id).join(format!("original-{image_id}.{ext}"))
    }

    pub fn cropped_path(&self, disc_id: i64, image_id: i64, ext: &str) -> PathBuf {
        self.disc_dir(disc_id).join(format!("cropped-{image_id}.{ext}"))
    }

    /// 写入原始图片字节，返回落盘路径
    pub fn save_original(
        &self,
        disc_id: i64,
        image_id: i64,
        ext: &str,
        bytes: &[u8],
    ) -> io::Result<PathBuf> {
        fs::create_dir_all(self.disc_dir(disc_id))?;
        let path = self.original_path(disc_id, image_id, ext);
        fs::write(&path, bytes)?;
        debug!("已保存原图: {}", path.display());
        Ok(path)
    }

    /// 写入裁剪后的图片，返回落盘路径
    pub fn save_cropped(
        &self,
        disc_id: i64,
        image_id: i64,
        ext: &str,
        raster: &image::RgbImage,
    ) -> io::Result<PathBuf> {
        fs::create_dir_all(self.disc_dir(disc_id))?;
        let path = self.cropped_path(disc_id, image_id, ext);
        raster
            .save(&path)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        debug!("已保存裁剪图: {}", path.display());
        Ok(path)
    }

    /// 删除单个文件，文件不存在不算错误
    pub fn remove_file(path: &Path) {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("删除文件失败 {}: {e}", path.display()),
        }
    }

    /// 删除飞盘的整个子树，目录不存在不算错误
    pub fn remove_disc_dir(&self, disc_id: i64) -> io::Result<()> {
        let dir = self.disc_dir(disc_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!("已删除目录: {}", dir.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
