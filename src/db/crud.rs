use pgvector::Vector;
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool, Result};

use super::{Disc, DiscImage, DiscStatus, NewDisc, SearchHit, UploadStatus};
use crate::border::Border;

/// 新建飞盘记录，上传状态初始为 pending
pub async fn add_disc<'e>(executor: impl PgExecutor<'e>, disc: &NewDisc) -> Result<i64> {
    sqlx::query_scalar(
        r#"
        INSERT INTO discs (owner_name, owner_contact, status, disc_model, disc_color, notes, location)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id
        "#,
    )
    .bind(&disc.owner_name)
    .bind(&disc.owner_contact)
    .bind(disc.status.as_str())
    .bind(&disc.disc_model)
    .bind(&disc.disc_color)
    .bind(&disc.notes)
    .bind(&disc.location)
    .fetch_one(executor)
    .await
}

pub async fn disc_exists<'e>(executor: impl PgExecutor<'e>, id: i64) -> Result<bool> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM discs WHERE id = $1")
        .bind(id)
        .fetch_one(executor)
        .await?;
    Ok(count > 0)
}

pub async fn get_disc<'e>(executor: impl PgExecutor<'e>, id: i64) -> Result<Option<Disc>> {
    sqlx::query_as::<_, Disc>("SELECT * FROM discs WHERE id = $1")
        .bind(id)
        .fetch_optional(executor)
        .await
}

/// 按状态筛选飞盘列表
pub async fn list_discs(
    pool: &PgPool,
    status: Option<DiscStatus>,
    upload_status: Option<UploadStatus>,
) -> Result<Vec<Disc>> {
    sqlx::query_as::<_, Disc>(
        r#"
        SELECT * FROM discs
        WHERE ($1::text IS NULL OR status = $1)
          AND ($2::text IS NULL OR upload_status = $2)
        ORDER BY id
        "#,
    )
    .bind(status.map(|s| s.as_str()))
    .bind(upload_status.map(|s| s.as_str()))
    .fetch_all(pool)
    .await
}

pub async fn get_discs_by_ids(pool: &PgPool, ids: &[i64]) -> Result<Vec<Disc>> {
    sqlx::query_as::<_, Disc>("SELECT * FROM discs WHERE id = ANY($1)")
        .bind(ids)
        .fetch_all(pool)
        .await
}

/// 更新飞盘状态，stolen/found 会顺带盖上对应的时间戳
pub async fn update_disc_status(pool: &PgPool, id: i64, status: DiscStatus) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE discs SET
            status = $2,
            stolen_date = CASE WHEN $2 = 'stolen' THEN CURRENT_TIMESTAMP ELSE stolen_date END,
            found_date = CASE WHEN $2 = 'found' THEN CURRENT_TIMESTAMP ELSE found_date END
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(status.as_str())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// pending -> success，返回是否发生了转换
pub async fn confirm_disc(pool: &PgPool, id: i64) -> Result<bool> {
    let result =
        sqlx::query("UPDATE discs SET upload_status = 'success' WHERE id = $1 AND upload_status = 'pending'")
            .bind(id)
            .execute(pool)
            .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn get_upload_status(pool: &PgPool, id: i64) -> Result<Option<UploadStatus>> {
    let status: Option<String> =
        sqlx::query_scalar("SELECT upload_status FROM discs WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
    Ok(status.and_then(|s| s.parse().ok()))
}

/// 删除飞盘，图片行由外键级联删除
pub async fn delete_disc<'e>(executor: impl PgExecutor<'e>, id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM discs WHERE id = $1").bind(id).execute(executor).await?;
    Ok(result.rows_affected() > 0)
}

/// 插入图片向量行，路径在文件落盘后补写
pub async fn add_image<'e>(
    executor: impl PgExecutor<'e>,
    disc_id: i64,
    model_name: &str,
    embedding: &Vector,
    border: Option<&Border>,
) -> Result<i64> {
    sqlx::query_scalar(
        r#"
        INSERT INTO disc_images (disc_id, model_name, embedding, image_path, border)
        VALUES ($1, $2, $3, '', $4)
        RETURNING id
        "#,
    )
    .bind(disc_id)
    .bind(model_name)
    .bind(embedding)
    .bind(border.map(Json))
    .fetch_one(executor)
    .await
}

pub async fn set_image_paths<'e>(
    executor: impl PgExecutor<'e>,
    image_id: i64,
    image_path: &str,
    cropped_image_path: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE disc_images SET image_path = $2, cropped_image_path = $3 WHERE id = $1")
        .bind(image_id)
        .bind(image_path)
        .bind(cropped_image_path)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn get_image(pool: &PgPool, image_id: i64) -> Result<Option<DiscImage>> {
    sqlx::query_as::<_, DiscImage>(
        r#"
        SELECT id, disc_id, model_name, image_path, cropped_image_path, border, created_at
        FROM disc_images WHERE id = $1
        "#,
    )
    .bind(image_id)
    .fetch_optional(pool)
    .await
}

pub async fn get_disc_images(pool: &PgPool, disc_id: i64) -> Result<Vec<DiscImage>> {
    sqlx::query_as::<_, DiscImage>(
        r#"
        SELECT id, disc_id, model_name, image_path, cropped_image_path, border, created_at
        FROM disc_images WHERE disc_id = $1
        ORDER BY created_at DESC
        "#,
    )
    .bind(disc_id)
    .fetch_all(pool)
    .await
}

/// 手工修订边框后重写向量、边框与裁剪图路径
pub async fn update_image_border<'e>(
    executor: impl PgExecutor<'e>,
    image_id: i64,
    border: &Border,
    cropped_image_path: &str,
    embedding: &Vector,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE disc_images SET border = $2, cropped_image_path = $3, embedding = $4 WHERE id = $1",
    )
    .bind(image_id)
    .bind(Json(border))
    .bind(cropped_image_path)
    .bind(embedding)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// 同编码器下的余弦相似度 top-K 查询
///
/// 只返回 upload_status = success 的飞盘；结果按相似度降序，
/// 相同相似度按 image_id 升序。小目录（低于 scan_threshold 行）
/// 禁用索引扫描，强制精确的线性扫描。
pub async fn top_k(
    pool: &PgPool,
    embedding: &Vector,
    model_name: &str,
    k: i64,
    min_similarity: f64,
    status_filter: Option<DiscStatus>,
    scan_threshold: i64,
) -> Result<Vec<SearchHit>> {
    let mut tx = pool.begin().await?;

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM disc_images WHERE model_name = $1")
        .bind(model_name)
        .fetch_one(&mut *tx)
        .await?;
    if count < scan_threshold {
        sqlx::query("SET LOCAL enable_indexscan = off").execute(&mut *tx).await?;
        sqlx::query("SET LOCAL enable_bitmapscan = off").execute(&mut *tx).await?;
    }

    let hits = sqlx::query_as::<_, SearchHit>(
        r#"
        SELECT di.id AS image_id, di.disc_id, 1 - (di.embedding <=> $1) AS similarity
        FROM disc_images di
        JOIN discs d ON d.id = di.disc_id
        WHERE di.model_name = $2
          AND d.upload_status = 'success'
          AND ($3::text IS NULL OR d.status = $3)
          AND 1 - (di.embedding <=> $1) >= $4
        ORDER BY di.embedding <=> $1, di.id
        LIMIT $5
        "#,
    )
    .bind(embedding)
    .bind(model_name)
    .bind(status_filter.map(|s| s.as_str()))
    .bind(min_similarity)
    .bind(k)
    .fetch_all(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(hits)
}
