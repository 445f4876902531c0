use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use indicatif::ProgressBar;
use log::{info, warn};
use regex::Regex;
use walkdir::WalkDir;

use crate::cli::SubCommandExtend;
use crate::config::{BorderOptions, EncoderOptions, Opts, SearchOptions};
use crate::db::NewDisc;
use crate::matcher::Deadline;

/// 批量导入：目录下的每张图片注册为一个飞盘并直接确认
#[derive(Parser, Debug, Clone)]
pub struct AddCommand {
    #[command(flatten)]
    pub encoder: EncoderOptions,
    #[command(flatten)]
    pub border: BorderOptions,
    #[command(flatten)]
    pub search: SearchOptions,
    /// 图片所在目录
    pub path: PathBuf,
    /// 扫描的文件后缀名，多个后缀用逗号分隔
    #[arg(short, long, default_value = "jpg,jpeg,png")]
    pub suffix: String,
    /// 登记的所有者名称
    #[arg(long, default_value = "Pending")]
    pub owner_name: String,
    /// 登记的联系方式
    #[arg(long, default_value = "pending@example.com")]
    pub owner_contact: String,
}

impl SubCommandExtend for AddCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let re_suf = format!("(?i)^({})$", self.suffix.replace(',', "|"));
        let re_suf = Regex::new(&re_suf).expect("failed to build regex");

        let matcher = crate::cli::open_matcher(opts, &self.encoder, &self.border, &self.search).await?;

        let files: Vec<PathBuf> = WalkDir::new(&self.path)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| {
                path.extension()
                    .map(|ext| re_suf.is_match(&ext.to_string_lossy()))
                    .unwrap_or(false)
            })
            .collect();

        info!("共扫描到 {} 张图片", files.len());
        let pb = ProgressBar::new(files.len() as u64);
        let mut imported = 0usize;

        for path in files {
            let bytes = tokio::fs::read(&path).await?;
            let content_type = match path.extension().map(|e| e.to_string_lossy().to_lowercase()) {
                Some(ext) if ext == "png" => "image/png",
                _ => "image/jpeg",
            };
            let meta = NewDisc {
                owner_name: self.owner_name.clone(),
                owner_contact: self.owner_contact.clone(),
                notes: Some(format!("imported from {}", path.display())),
                ..NewDisc::default()
            };

            match matcher.register(&bytes, content_type, meta, None, Deadline::none()).await {
                Ok(registration) => {
                    matcher.confirm(registration.disc_id).await?;
                    imported += 1;
                }
                Err(e) => warn!("导入失败 {}: {e}", path.display()),
            }
            pb.inc(1);
        }

        pb.finish();
        info!("导入完成: {imported} 张");
        Ok(())
    }
}
