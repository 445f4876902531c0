use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbImage;
use log::{info, warn};
use pgvector::Vector;
use serde::Serialize;
use sqlx::PgPool;
use tokio::task::block_in_place;

use crate::border::{self, Border, BorderDetector};
use crate::config::{BorderOptions, SearchOptions};
use crate::db::{crud, Disc, DiscImage, DiscStatus, NewDisc, SearchHit, UploadStatus};
use crate::encoder::{self, ImageEncoder, EMBED_DIM};
use crate::error::MatcherError;
use crate::imgutils::{self, NormalizedImage};
use crate::storage::DiscStorage;

/// 公开操作的截止时间，在流水线各阶段之间检查
///
/// 编码器推理本身不可抢占，因此超时只保证不产生部分提交，
/// 不保证立即中断。
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn after(timeout: Duration) -> Self {
        Self(Some(Instant::now() + timeout))
    }

    pub fn check(&self) -> Result<(), MatcherError> {
        match self.0 {
            Some(at) if Instant::now() > at => Err(MatcherError::Timeout),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatcherConfig {
    pub max_image_bytes: usize,
    pub border: BorderOptions,
    pub search: SearchOptions,
}

/// 注册结果
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub disc_id: i64,
    pub image_id: i64,
    pub encoder_name: String,
    pub border: Option<Border>,
}

/// 搜索结果中的一个飞盘
#[derive(Debug, Clone, Serialize)]
pub struct Match {
    pub disc_id: i64,
    /// 该飞盘所有图片行中的最大相似度
    pub similarity: f64,
    /// 取得最大相似度的图片行
    pub representative_image_id: i64,
    pub encoder_name: String,
    pub disc: Disc,
}

/// 识别流水线的编排器：规范化 -> 边框 -> 裁剪 -> 编码 -> 向量存储
///
/// 不持有任何请求级状态，可以被多个请求处理器并发调用。
pub struct Matcher {
    encoder: Arc<dyn ImageEncoder>,
    db: PgPool,
    storage: DiscStorage,
    detector: Option<BorderDetector>,
    config: MatcherConfig,
}

struct PipelineOutput {
    normalized: NormalizedImage,
    border: Option<Border>,
    encoder_input: RgbImage,
    /// 已补零到 [`EMBED_DIM`]
    embedding: Vec<f32>,
}

impl Matcher {
    pub fn new(
        encoder: Arc<dyn ImageEncoder>,
        db: PgPool,
        storage: DiscStorage,
        config: MatcherConfig,
    ) -> Self {
        let detector = (!config.border.no_border).then(|| BorderDetector::new(&config.border));
        info!("Matcher 初始化完成，编码器: {}", encoder.name());
        Self { encoder, db, storage, detector, config }
    }

    pub fn encoder_name(&self) -> &'static str {
        self.encoder.name()
    }

    /// 注册一张飞盘图片
    ///
    /// `disc_id` 为空时新建一个 pending 状态的飞盘；否则挂到已有飞盘上。
    /// 任何一步失败都会回滚：删除已写入的文件，新建的飞盘行随事务一起消失，
    /// 已有飞盘保持原样。
    pub async fn register(
        &self,
        bytes: &[u8],
        content_type: &str,
        meta: NewDisc,
        disc_id: Option<i64>,
        deadline: Deadline,
    ) -> Result<Registration, MatcherError> {
        let output = self.run_pipeline(bytes, content_type, deadline)?;
        deadline.check()?;

        let mut tx = self.db.begin().await?;
        let disc_id = match disc_id {
            Some(id) => {
                if !crud::disc_exists(&mut *tx, id).await? {
                    return Err(MatcherError::UnknownDisc(id));
                }
                id
            }
            None => crud::add_disc(&mut *tx, &meta).await?,
        };

        let embedding = Vector::from(output.embedding);
        let image_id =
            crud::add_image(&mut *tx, disc_id, self.encoder.name(), &embedding, output.border.as_ref())
                .await?;

        // 行先于文件：行提交失败时删文件，文件写入失败时回滚事务
        let ext = output.normalized.extension();
        let mut written: Vec<PathBuf> = Vec::new();
        let original = match self.storage.save_original(disc_id, image_id, ext, bytes) {
            Ok(path) => path,
            Err(e) => {
                drop(tx);
                return Err(e.into());
            }
        };
        written.push(original.clone());

        let cropped = if output.border.is_some() {
            match self.storage.save_cropped(disc_id, image_id, ext, &output.encoder_input) {
                Ok(path) => {
                    written.push(path.clone());
                    Some(path)
                }
                Err(e) => {
                    drop(tx);
                    remove_files(&written);
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        let finalize = async {
            crud::set_image_paths(
                &mut *tx,
                image_id,
                &original.to_string_lossy(),
                cropped.as_ref().map(|p| p.to_string_lossy()).as_deref(),
            )
            .await?;
            tx.commit().await
        };
        if let Err(e) = finalize.await {
            remove_files(&written);
            return Err(e.into());
        }

        info!(
            "已注册飞盘 {disc_id}，图片 {image_id}，边框: {}",
            if output.border.is_some() { "有" } else { "无" }
        );
        Ok(Registration {
            disc_id,
            image_id,
            encoder_name: self.encoder.name().to_string(),
            border: output.border,
        })
    }

    /// 给已有飞盘追加一张图片
    pub async fn add_image_to_disc(
        &self,
        disc_id: i64,
        bytes: &[u8],
        content_type: &str,
        deadline: Deadline,
    ) -> Result<Registration, MatcherError> {
        self.register(bytes, content_type, NewDisc::default(), Some(disc_id), deadline).await
    }

    /// 确认上传：pending -> success，重复确认是幂等的
    pub async fn confirm(&self, disc_id: i64) -> Result<(), MatcherError> {
        if crud::confirm_disc(&self.db, disc_id).await? {
            info!("飞盘 {disc_id} 已确认");
            return Ok(());
        }
        match crud::get_upload_status(&self.db, disc_id).await? {
            Some(_) => Ok(()),
            None => Err(MatcherError::UnknownDisc(disc_id)),
        }
    }

    /// 取消 pending 状态的飞盘，删除所有行和磁盘子树
    ///
    /// 对已不存在的飞盘是幂等的空操作。
    pub async fn cancel(&self, disc_id: i64) -> Result<(), MatcherError> {
        match crud::get_upload_status(&self.db, disc_id).await? {
            None => Ok(()),
            Some(UploadStatus::Success) => Err(MatcherError::InvalidTransition(format!(
                "飞盘 {disc_id} 已确认，不能取消"
            ))),
            Some(UploadStatus::Pending) => {
                crud::delete_disc(&self.db, disc_id).await?;
                self.storage.remove_disc_dir(disc_id)?;
                info!("已取消飞盘 {disc_id}");
                Ok(())
            }
        }
    }

    /// 搜索相似飞盘
    ///
    /// 先以 k * oversample 取候选图片行，再按飞盘聚合：每个飞盘的得分
    /// 是其所有行的最大相似度，代表图片即取得最大值的行。
    pub async fn find_matches(
        &self,
        bytes: &[u8],
        content_type: &str,
        k: Option<usize>,
        min_similarity: Option<f32>,
        status_filter: Option<DiscStatus>,
        deadline: Deadline,
    ) -> Result<Vec<Match>, MatcherError> {
        let k = k.unwrap_or(self.config.search.top_k).max(1);
        let min_similarity =
            min_similarity.unwrap_or(self.config.search.min_similarity).clamp(0.0, 1.0);

        let output = self.run_pipeline(bytes, content_type, deadline)?;
        deadline.check()?;

        let query = Vector::from(output.embedding);
        let k_oversampled = (k * self.config.search.oversample) as i64;
        let candidates = match crud::top_k(
            &self.db,
            &query,
            self.encoder.name(),
            k_oversampled,
            min_similarity as f64,
            status_filter,
            self.config.search.scan_threshold,
        )
        .await
        {
            Ok(hits) => hits,
            // 死锁属于瞬时故障，重试一次
            Err(e) if is_deadlock(&e) => {
                warn!("存储层死锁，重试一次: {e}");
                crud::top_k(
                    &self.db,
                    &query,
                    self.encoder.name(),
                    k_oversampled,
                    min_similarity as f64,
                    status_filter,
                    self.config.search.scan_threshold,
                )
                .await?
            }
            Err(e) => return Err(e.into()),
        };
        deadline.check()?;

        let groups = aggregate_by_disc(&candidates, k);
        if groups.is_empty() {
            info!("没有相似度超过 {min_similarity} 的匹配");
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = groups.iter().map(|g| g.disc_id).collect();
        let discs: HashMap<i64, Disc> = crud::get_discs_by_ids(&self.db, &ids)
            .await?
            .into_iter()
            .map(|d| (d.id, d))
            .collect();

        let matches: Vec<Match> = groups
            .into_iter()
            .filter_map(|g| {
                discs.get(&g.disc_id).map(|disc| Match {
                    disc_id: g.disc_id,
                    similarity: g.similarity.clamp(0.0, 1.0),
                    representative_image_id: g.image_id,
                    encoder_name: self.encoder.name().to_string(),
                    disc: disc.clone(),
                })
            })
            .collect();

        info!("返回 {} 个匹配（候选 {} 行）", matches.len(), candidates.len());
        Ok(matches)
    }

    pub async fn get_disc(&self, disc_id: i64) -> Result<(Disc, Vec<DiscImage>), MatcherError> {
        let disc = crud::get_disc(&self.db, disc_id)
            .await?
            .ok_or(MatcherError::UnknownDisc(disc_id))?;
        let images = crud::get_disc_images(&self.db, disc_id).await?;
        Ok((disc, images))
    }

    pub async fn list_discs(
        &self,
        status: Option<DiscStatus>,
        upload_status: Option<UploadStatus>,
    ) -> Result<Vec<Disc>, MatcherError> {
        Ok(crud::list_discs(&self.db, status, upload_status).await?)
    }

    /// 更新登记状态，stolen/found 会盖上对应的时间戳
    pub async fn update_status(&self, disc_id: i64, status: DiscStatus) -> Result<(), MatcherError> {
        if !crud::update_disc_status(&self.db, disc_id, status).await? {
            return Err(MatcherError::UnknownDisc(disc_id));
        }
        info!("飞盘 {disc_id} 状态更新为 {status}");
        Ok(())
    }

    /// 删除飞盘：级联删除图片行并移除磁盘子树
    pub async fn delete_disc(&self, disc_id: i64) -> Result<(), MatcherError> {
        if !crud::delete_disc(&self.db, disc_id).await? {
            return Err(MatcherError::UnknownDisc(disc_id));
        }
        self.storage.remove_disc_dir(disc_id)?;
        info!("已删除飞盘 {disc_id}");
        Ok(())
    }

    /// 手工修订某张图片的边框：按新边框重新裁剪、重新编码并改写行
    pub async fn update_border(
        &self,
        image_id: i64,
        border: Border,
        deadline: Deadline,
    ) -> Result<(), MatcherError> {
        deadline.check()?;
        let image = crud::get_image(&self.db, image_id)
            .await?
            .ok_or(MatcherError::UnknownImage(image_id))?;

        let bytes = tokio::fs::read(&image.image_path).await?;
        let content_type =
            if image.image_path.ends_with(".png") { "image/png" } else { "image/jpeg" };
        // 重新走规范化，保证和注册时编码的是同一张位图
        let normalized =
            block_in_place(|| imgutils::normalize(&bytes, content_type, self.config.max_image_bytes))?;
        deadline.check()?;

        let cropped = border::crop_and_mask(&normalized.raster, &border);
        let embedding = self.embed_checked(&cropped)?;
        deadline.check()?;

        let path =
            self.storage.save_cropped(image.disc_id, image_id, normalized.extension(), &cropped)?;
        let updated = crud::update_image_border(
            &self.db,
            image_id,
            &border,
            &path.to_string_lossy(),
            &Vector::from(embedding),
        )
        .await?;
        if !updated {
            return Err(MatcherError::UnknownImage(image_id));
        }
        info!("图片 {image_id} 的边框已更新");
        Ok(())
    }

    fn run_pipeline(
        &self,
        bytes: &[u8],
        content_type: &str,
        deadline: Deadline,
    ) -> Result<PipelineOutput, MatcherError> {
        deadline.check()?;
        let normalized =
            block_in_place(|| imgutils::normalize(bytes, content_type, self.config.max_image_bytes))?;
        deadline.check()?;

        // 边框检测失败不是错误，静默回退到整图
        let border = self.detector.as_ref().and_then(|d| block_in_place(|| d.detect(&normalized.raster)));
        let encoder_input = match &border {
            Some(b) => border::crop_and_mask(&normalized.raster, b),
            None => normalized.raster.clone(),
        };
        deadline.check()?;

        let embedding = self.embed_checked(&encoder_input)?;
        deadline.check()?;
        Ok(PipelineOutput { normalized, border, encoder_input, embedding })
    }

    /// 编码并校验：失败自动重试一次，校验维度与退化向量，补零到存储宽度
    fn embed_checked(&self, raster: &RgbImage) -> Result<Vec<f32>, MatcherError> {
        let native = match block_in_place(|| self.encoder.embed(raster)) {
            Ok(v) => v,
            Err(e) => {
                warn!("编码失败，重试一次: {e}");
                block_in_place(|| self.encoder.embed(raster))
                    .map_err(|e| MatcherError::Encode(e.to_string()))?
            }
        };

        let got = native.len();
        if got != self.encoder.dimension() {
            return Err(MatcherError::InvalidDimension { got, want: self.encoder.dimension() });
        }
        if native.iter().all(|v| *v == 0.0) {
            return Err(MatcherError::DegenerateEmbedding);
        }
        encoder::pad_embedding(native)
            .map_err(|_| MatcherError::InvalidDimension { got, want: EMBED_DIM })
    }
}

fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        DiscStorage::remove_file(path);
    }
}

/// PostgreSQL 死锁错误码 40P01
fn is_deadlock(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("40P01"))
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DiscScore {
    pub disc_id: i64,
    pub image_id: i64,
    pub similarity: f64,
}

/// 按飞盘聚合候选行：取每个飞盘的最大相似度及其对应行，
/// 按相似度降序排列，相同分数取较小的 disc_id，截断到 k 个
pub(crate) fn aggregate_by_disc(hits: &[SearchHit], k: usize) -> Vec<DiscScore> {
    let mut sorted: Vec<&SearchHit> = hits.iter().collect();
    sorted.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(Ordering::Equal)
            .then(a.image_id.cmp(&b.image_id))
    });

    let mut seen = HashSet::new();
    let mut groups = Vec::new();
    for hit in sorted {
        if seen.insert(hit.disc_id) {
            groups.push(DiscScore {
                disc_id: hit.disc_id,
                image_id: hit.image_id,
                similarity: hit.similarity,
            });
        }
    }

    groups.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(Ordering::Equal)
            .then(a.disc_id.cmp(&b.disc_id))
    });
    groups.truncate(k);
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(image_id: i64, disc_id: i64, similarity: f64) -> SearchHit {
        SearchHit { image_id, disc_id, similarity }
    }

    #[test]
    fn aggregation_takes_max_per_disc() {
        let hits = vec![hit(1, 10, 0.9), hit(2, 10, 0.8), hit(3, 20, 0.85)];
        let groups = aggregate_by_disc(&hits, 5);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].disc_id, 10);
        assert_eq!(groups[0].image_id, 1);
        assert_eq!(groups[0].similarity, 0.9);
        assert_eq!(groups[1].disc_id, 20);
    }

    #[test]
    fn aggregation_prevents_crowding_out() {
        // 一个飞盘有很多高分行，不应挤掉其他飞盘
        let hits = vec![
            hit(1, 10, 0.99),
            hit(2, 10, 0.98),
            hit(3, 10, 0.97),
            hit(4, 20, 0.8),
            hit(5, 30, 0.7),
        ];
        let groups = aggregate_by_disc(&hits, 3);
        let ids: Vec<i64> = groups.iter().map(|g| g.disc_id).collect();
        assert_eq!(ids, vec![10, 20, 30]);
    }

    #[test]
    fn aggregation_tie_breaks() {
        // 相同相似度：代表行取较小 image_id，排名取较小 disc_id
        let hits = vec![hit(7, 20, 0.9), hit(5, 20, 0.9), hit(9, 10, 0.9)];
        let groups = aggregate_by_disc(&hits, 2);
        assert_eq!(groups[0].disc_id, 10);
        assert_eq!(groups[1].disc_id, 20);
        assert_eq!(groups[1].image_id, 5);
    }

    #[test]
    fn aggregation_truncates_to_k() {
        let hits: Vec<SearchHit> = (0..10).map(|i| hit(i, i, 1.0 - i as f64 * 0.01)).collect();
        assert_eq!(aggregate_by_disc(&hits, 3).len(), 3);
        assert!(aggregate_by_disc(&[], 3).is_empty());
    }

    #[test]
    fn deadline_expiry() {
        assert!(Deadline::none().check().is_ok());
        assert!(Deadline::after(Duration::from_secs(60)).check().is_ok());
        let expired = Deadline(Some(Instant::now() - Duration::from_millis(1)));
        assert!(matches!(expired.check(), Err(MatcherError::Timeout)));
    }
}
