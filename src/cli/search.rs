use std::convert::Infallible;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use log::debug;

use crate::cli::SubCommandExtend;
use crate::config::{BorderOptions, EncoderOptions, Opts, SearchOptions};
use crate::matcher::{Deadline, Match};

#[derive(Parser, Debug, Clone)]
pub struct SearchCommand {
    #[command(flatten)]
    pub encoder: EncoderOptions,
    #[command(flatten)]
    pub border: BorderOptions,
    #[command(flatten)]
    pub search: SearchOptions,
    /// 被搜索的图片路径
    pub image: PathBuf,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", default_value = "table")]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for SearchCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let matcher = crate::cli::open_matcher(opts, &self.encoder, &self.border, &self.search).await?;

        let bytes = tokio::fs::read(&self.image).await?;
        let content_type = match self.image.extension().map(|e| e.to_string_lossy().to_lowercase()) {
            Some(ext) if ext == "png" => "image/png",
            _ => "image/jpeg",
        };

        let matches = matcher
            .find_matches(&bytes, content_type, None, None, None, Deadline::none())
            .await?;
        debug!("编码器: {}", matcher.encoder_name());

        print_result(&matches, self)
    }
}

fn print_result(matches: &[Match], opts: &SearchCommand) -> Result<()> {
    match opts.output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(matches)?)
        }
        OutputFormat::Table => {
            for m in matches {
                println!(
                    "{:.2}\t{}\t{}",
                    m.similarity,
                    m.disc_id,
                    m.disc.disc_model.as_deref().unwrap_or("-")
                );
            }
        }
    }
    Ok(())
}

#[derive(ValueEnum, Debug, Clone)]
pub enum OutputFormat {
    Json,
    Table,
}

impl FromStr for OutputFormat {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "table" => Ok(Self::Table),
            _ => unreachable!(),
        }
    }
}
