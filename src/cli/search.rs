use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use tokio::task::block_in_place;

use crate::cli::SubCommandExtend;
use crate::collection::CollectionBuilder;
use crate::config::{CollectionOptions, Opts, OutputFormat, ProviderOptions, SearchOptions};
use crate::index::SearchHit;
use crate::search::SearchQuery;

#[derive(Parser, Debug, Clone)]
#[command(group(ArgGroup::new("query").required(true).args(["text", "image", "like"])))]
pub struct SearchCommand {
    #[command(flatten)]
    pub collection: CollectionOptions,
    #[command(flatten)]
    pub search: SearchOptions,
    #[command(flatten)]
    pub provider: ProviderOptions,
    /// 以文字描述搜索
    #[arg(long, value_name = "TEXT")]
    pub text: Option<String>,
    /// 以图片搜索，图片不需要在集合中
    #[arg(long, value_name = "FILE")]
    pub image: Option<PathBuf>,
    /// 查找与集合中某张图片相似的图片
    #[arg(long, value_name = "PATH")]
    pub like: Option<PathBuf>,
}

impl SubCommandExtend for SearchCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let provider = self.provider.build()?;
        let hits = block_in_place(|| -> Result<_> {
            let collection =
                CollectionBuilder::new(opts.conf_dir.clone(), self.collection.config())
                    .provider(provider)
                    .open()?;
            let count = self.search.count;
            let hits = match (&self.text, &self.image, &self.like) {
                (Some(text), _, _) => collection.search(&SearchQuery::Text(text.clone()), count)?,
                (_, Some(image), _) => {
                    let data = std::fs::read(image)
                        .with_context(|| format!("无法读取图片 {}", image.display()))?;
                    collection.search(&SearchQuery::Image(data), count)?
                }
                (_, _, Some(path)) => collection.more_like(path, count)?,
                _ => unreachable!("clap 保证至少有一个查询参数"),
            };
            Ok(hits)
        })?;

        print_result(&hits, self.search.output_format)
    }
}

fn print_result(result: &[SearchHit], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(result)?)
        }
        OutputFormat::Table => {
            for hit in result {
                println!("{:.4}\t{}", hit.score, hit.path.display());
            }
        }
    }
    Ok(())
}
