//! 端到端流程测试：使用确定性的假编码器驱动完整流水线
//!
//! 需要一个启用了 pgvector 的 PostgreSQL，通过 DATABASE_URL 指定；
//! 未设置时直接跳过。

use std::io::Cursor;
use std::sync::Arc;

use anyhow::Result;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

use discsearch::border::Border;
use discsearch::config::{BorderOptions, SearchOptions};
use discsearch::db::{self, NewDisc};
use discsearch::encoder::{l2_normalize, ImageEncoder};
use discsearch::matcher::{Deadline, Matcher, MatcherConfig};
use discsearch::storage::DiscStorage;
use discsearch::MatcherError;

/// 确定性编码器：3x3 网格上的分通道均值，足以区分不同的测试图片
struct FakeEncoder {
    name: &'static str,
}

impl ImageEncoder for FakeEncoder {
    fn name(&self) -> &'static str {
        self.name
    }

    fn dimension(&self) -> usize {
        27
    }

    fn embed(&self, image: &RgbImage) -> Result<Vec<f32>> {
        let (w, h) = (image.width().max(3), image.height().max(3));
        let mut sums = vec![0.0f64; 27];
        let mut counts = vec![0.0f64; 9];
        for (x, y, pixel) in image.enumerate_pixels() {
            let cell = (y * 3 / h) as usize * 3 + (x * 3 / w) as usize;
            let cell = cell.min(8);
            for c in 0..3 {
                sums[cell * 3 + c] += pixel.0[c] as f64;
            }
            counts[cell] += 1.0;
        }
        let mut out: Vec<f32> = (0..27)
            .map(|i| {
                let count = counts[i / 3].max(1.0);
                (sums[i] / count / 255.0) as f32
            })
            .collect();
        l2_normalize(&mut out);
        Ok(out)
    }
}

fn png_bytes(img: &RgbImage) -> Vec<u8> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img.clone())
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

/// 九宫格着色的测试图片，不同 seed 的图片彼此可区分
fn test_image(seed: u32) -> Vec<u8> {
    let mut img = RgbImage::new(90, 90);
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        let cell = (y / 30) * 3 + x / 30;
        let v = (seed.wrapping_mul(2654435761).wrapping_add(cell * 97)) % 256;
        *pixel = Rgb([v as u8, (v as u8).wrapping_mul(3), (v as u8).wrapping_mul(7)]);
    }
    png_bytes(&img)
}

/// 所有测试共用同一个数据库，必须串行执行
static DB_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

struct TestEnv {
    db: sqlx::PgPool,
    upload_dir: tempfile::TempDir,
    _guard: tokio::sync::MutexGuard<'static, ()>,
}

impl TestEnv {
    async fn create() -> Result<Option<Self>> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            eprintln!("跳过：未设置 DATABASE_URL");
            return Ok(None);
        };
        let guard = DB_LOCK.lock().await;
        let db = db::init_db(&url).await?;
        sqlx::query("TRUNCATE disc_images, discs RESTART IDENTITY CASCADE")
            .execute(&db)
            .await?;
        Ok(Some(Self { db, upload_dir: tempfile::tempdir()?, _guard: guard }))
    }

    fn matcher(&self, encoder_name: &'static str, border_enabled: bool) -> Matcher {
        let config = MatcherConfig {
            max_image_bytes: 10 * 1024 * 1024,
            border: BorderOptions {
                no_border: !border_enabled,
                border_confidence: 0.5,
                min_radius_ratio: 0.25,
                max_radius_ratio: 1.0,
            },
            search: SearchOptions {
                top_k: 10,
                min_similarity: 0.7,
                oversample: 3,
                scan_threshold: 5000,
            },
        };
        Matcher::new(
            Arc::new(FakeEncoder { name: encoder_name }),
            self.db.clone(),
            DiscStorage::new(self.upload_dir.path().to_path_buf()),
            config,
        )
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn register_and_search_scenarios() -> Result<()> {
    let Some(env) = TestEnv::create().await? else { return Ok(()) };
    let matcher = env.matcher("fake", false);

    // 场景 1：注册后用同一张图搜索，top-1 必须是它自己且相似度 >= 0.95
    let i1 = test_image(1);
    let r1 = matcher
        .register(&i1, "image/png", NewDisc::default(), None, Deadline::none())
        .await?;
    matcher.confirm(r1.disc_id).await?;

    let matches = matcher
        .find_matches(&i1, "image/png", Some(5), Some(0.7), None, Deadline::none())
        .await?;
    assert!(matches.len() <= 5);
    assert_eq!(matches[0].disc_id, r1.disc_id);
    assert!(matches[0].similarity >= 0.95, "similarity = {}", matches[0].similarity);
    assert_eq!(matches[0].representative_image_id, r1.image_id);
    assert_eq!(matches[0].encoder_name, "fake");

    // 场景 2：未确认的飞盘对搜索不可见
    let i2 = test_image(2);
    let r2 = matcher
        .register(&i2, "image/png", NewDisc::default(), None, Deadline::none())
        .await?;
    matcher.confirm(r2.disc_id).await?;

    let i3 = test_image(3);
    let r3 = matcher
        .register(&i3, "image/png", NewDisc::default(), None, Deadline::none())
        .await?;

    let matches = matcher
        .find_matches(&i3, "image/png", Some(10), Some(0.0), None, Deadline::none())
        .await?;
    assert!(matches.iter().all(|m| m.disc_id != r3.disc_id), "pending 的飞盘不应出现");

    // 确认后即可检索到
    matcher.confirm(r3.disc_id).await?;
    let matches = matcher
        .find_matches(&i3, "image/png", Some(10), Some(0.0), None, Deadline::none())
        .await?;
    assert_eq!(matches[0].disc_id, r3.disc_id);

    // confirm 幂等
    matcher.confirm(r3.disc_id).await?;
    assert!(matches!(
        matcher.confirm(999_999).await,
        Err(MatcherError::UnknownDisc(_))
    ));

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn encoder_isolation() -> Result<()> {
    let Some(env) = TestEnv::create().await? else { return Ok(()) };
    let clip_like = env.matcher("fake", false);
    let dino_like = env.matcher("fake2", false);

    // 场景 3：只在编码器 A 下注册的飞盘，在编码器 B 下搜不到
    let i4 = test_image(4);
    let r4 = clip_like
        .register(&i4, "image/png", NewDisc::default(), None, Deadline::none())
        .await?;
    clip_like.confirm(r4.disc_id).await?;

    let matches = dino_like
        .find_matches(&i4, "image/png", Some(10), Some(0.0), None, Deadline::none())
        .await?;
    assert!(matches.is_empty(), "不同编码器的行不应互相可见");

    // 在 B 下补一张图片后即可检索
    let rb = dino_like
        .add_image_to_disc(r4.disc_id, &i4, "image/png", Deadline::none())
        .await?;
    assert_eq!(rb.disc_id, r4.disc_id);
    let matches = dino_like
        .find_matches(&i4, "image/png", Some(10), Some(0.0), None, Deadline::none())
        .await?;
    assert_eq!(matches[0].disc_id, r4.disc_id);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn multi_image_aggregation() -> Result<()> {
    let Some(env) = TestEnv::create().await? else { return Ok(()) };
    let matcher = env.matcher("fake", false);

    // 场景 4：同一飞盘的多张图片按最大相似度聚合，代表图片取最佳行
    let i5 = test_image(5);
    let i5b = test_image(6);
    let r5 = matcher
        .register(&i5, "image/png", NewDisc::default(), None, Deadline::none())
        .await?;
    matcher.confirm(r5.disc_id).await?;
    let r5b = matcher
        .add_image_to_disc(r5.disc_id, &i5b, "image/png", Deadline::none())
        .await?;

    let matches = matcher
        .find_matches(&i5b, "image/png", Some(5), Some(0.0), None, Deadline::none())
        .await?;
    assert_eq!(matches[0].disc_id, r5.disc_id);
    assert_eq!(matches[0].representative_image_id, r5b.image_id);
    // 同一飞盘只出现一次
    assert_eq!(matches.iter().filter(|m| m.disc_id == r5.disc_id).count(), 1);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn border_below_floor_falls_back_to_full_image() -> Result<()> {
    let Some(env) = TestEnv::create().await? else { return Ok(()) };
    let matcher = env.matcher("fake", true);

    // 场景 5：无明显轮廓的图片检测不出边框，行上 border 为空，仍可检索
    let mut img = RgbImage::from_pixel(120, 120, Rgb([128, 128, 128]));
    // 一点非均匀纹理，但没有圆形轮廓
    for x in 0..120 {
        img.put_pixel(x, 0, Rgb([130, 128, 126]));
    }
    let i6 = png_bytes(&img);

    let r6 = matcher
        .register(&i6, "image/png", NewDisc::default(), None, Deadline::none())
        .await?;
    assert!(r6.border.is_none());
    matcher.confirm(r6.disc_id).await?;

    let (_, images) = matcher.get_disc(r6.disc_id).await?;
    assert_eq!(images.len(), 1);
    assert!(images[0].border.is_none());
    assert!(images[0].cropped_image_path.is_none());

    let matches = matcher
        .find_matches(&i6, "image/png", Some(5), Some(0.7), None, Deadline::none())
        .await?;
    assert_eq!(matches[0].disc_id, r6.disc_id);

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_and_delete_remove_everything() -> Result<()> {
    let Some(env) = TestEnv::create().await? else { return Ok(()) };
    let matcher = env.matcher("fake", false);

    // 场景 6：取消 pending 的飞盘，行与磁盘子树一并消失
    let i7 = test_image(7);
    let r7 = matcher
        .register(&i7, "image/png", NewDisc::default(), None, Deadline::none())
        .await?;
    let disc_dir = env.upload_dir.path().join(r7.disc_id.to_string());
    assert!(disc_dir.join(format!("original-{}.png", r7.image_id)).exists());

    matcher.cancel(r7.disc_id).await?;
    assert!(!disc_dir.exists());
    assert!(matches!(
        matcher.get_disc(r7.disc_id).await,
        Err(MatcherError::UnknownDisc(_))
    ));

    // 对已删除的 ID 再取消是幂等空操作
    matcher.cancel(r7.disc_id).await?;

    // 已确认的飞盘不能取消，但可以删除，且级联清理
    let i8 = test_image(8);
    let r8 = matcher
        .register(&i8, "image/png", NewDisc::default(), None, Deadline::none())
        .await?;
    matcher.confirm(r8.disc_id).await?;
    assert!(matches!(
        matcher.cancel(r8.disc_id).await,
        Err(MatcherError::InvalidTransition(_))
    ));

    matcher.delete_disc(r8.disc_id).await?;
    assert!(!env.upload_dir.path().join(r8.disc_id.to_string()).exists());
    assert!(matches!(
        matcher.get_disc(r8.disc_id).await,
        Err(MatcherError::UnknownDisc(_))
    ));

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn status_filter_and_update() -> Result<()> {
    let Some(env) = TestEnv::create().await? else { return Ok(()) };
    let matcher = env.matcher("fake", false);

    let i9 = test_image(9);
    let r9 = matcher
        .register(&i9, "image/png", NewDisc::default(), None, Deadline::none())
        .await?;
    matcher.confirm(r9.disc_id).await?;
    matcher.update_status(r9.disc_id, discsearch::db::DiscStatus::Stolen).await?;

    let (disc, _) = matcher.get_disc(r9.disc_id).await?;
    assert_eq!(disc.status, discsearch::db::DiscStatus::Stolen);
    assert!(disc.stolen_date.is_some());

    // 状态过滤：按 stolen 过滤能命中，按 found 过滤则为空
    let matches = matcher
        .find_matches(
            &i9,
            "image/png",
            Some(5),
            Some(0.0),
            Some(discsearch::db::DiscStatus::Stolen),
            Deadline::none(),
        )
        .await?;
    assert_eq!(matches[0].disc_id, r9.disc_id);

    let matches = matcher
        .find_matches(
            &i9,
            "image/png",
            Some(5),
            Some(0.0),
            Some(discsearch::db::DiscStatus::Found),
            Deadline::none(),
        )
        .await?;
    assert!(matches.iter().all(|m| m.disc_id != r9.disc_id));

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn manual_border_update_reencodes() -> Result<()> {
    let Some(env) = TestEnv::create().await? else { return Ok(()) };
    let matcher = env.matcher("fake", false);

    let i10 = test_image(10);
    let r10 = matcher
        .register(&i10, "image/png", NewDisc::default(), None, Deadline::none())
        .await?;
    matcher.confirm(r10.disc_id).await?;

    let border = Border::Circle { cx: 45.0, cy: 45.0, radius: 30.0, confidence: 1.0 };
    matcher.update_border(r10.image_id, border.clone(), Deadline::none()).await?;

    let (_, images) = matcher.get_disc(r10.disc_id).await?;
    let image = images.iter().find(|img| img.id == r10.image_id).unwrap();
    assert_eq!(image.border.as_ref().map(|b| b.0.clone()), Some(border));
    let cropped = image.cropped_image_path.as_ref().expect("应生成裁剪图");
    assert!(std::path::Path::new(cropped).exists());

    assert!(matches!(
        matcher
            .update_border(
                999_999,
                Border::Circle { cx: 1.0, cy: 1.0, radius: 1.0, confidence: 1.0 },
                Deadline::none()
            )
            .await,
        Err(MatcherError::UnknownImage(_))
    ));

    Ok(())
}
