mod add;
mod search;
pub mod server;

pub use add::*;
pub use search::*;
pub use server::*;

use crate::config::{BorderOptions, EncoderOptions, Opts, SearchOptions};
use crate::db;
use crate::encoder;
use crate::matcher::{Matcher, MatcherConfig};
use crate::storage::DiscStorage;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

/// 按配置组装 Matcher：连接数据库、初始化活动编码器、准备存储目录
pub(crate) async fn open_matcher(
    opts: &Opts,
    encoder_opts: &EncoderOptions,
    border: &BorderOptions,
    search: &SearchOptions,
) -> anyhow::Result<Matcher> {
    let db = db::init_db(&opts.store_url).await?;
    let encoder = encoder::global(encoder_opts.encoder_type)?;
    let storage = DiscStorage::new(opts.upload_root.clone());
    let config = MatcherConfig {
        max_image_bytes: opts.max_image_bytes,
        border: border.clone(),
        search: search.clone(),
    };
    Ok(Matcher::new(encoder, db, storage, config))
}
