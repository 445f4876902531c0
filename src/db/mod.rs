use log::info;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub mod crud;
pub mod model;

pub use model::*;

pub type Database = PgPool;

/// 建立连接池并执行迁移
pub async fn init_db(url: &str) -> Result<Database, sqlx::Error> {
    info!("初始化数据库连接池");
    let pool = PgPoolOptions::new()
        .max_connections((num_cpus::get() * 2) as u32)
        .connect(url)
        .await?;

    info!("检查数据库迁移");
    sqlx::migrate!().run(&pool).await?;

    Ok(pool)
}
