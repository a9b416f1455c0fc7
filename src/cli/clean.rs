use anyhow::Result;
use clap::Parser;
use log::info;
use tokio::task::block_in_place;

use crate::cli::SubCommandExtend;
use crate::collection::CollectionBuilder;
use crate::config::{CollectionOptions, Opts};

#[derive(Parser, Debug, Clone)]
pub struct CleanCommand {
    #[command(flatten)]
    pub collection: CollectionOptions,
    /// 清理所有模型的缓存，而不只是 `--model` 指定的模型
    #[arg(long)]
    pub all: bool,
}

impl SubCommandExtend for CleanCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let config = self.collection.config();
        block_in_place(|| -> Result<()> {
            let collection = CollectionBuilder::new(opts.conf_dir.clone(), config.clone()).open()?;
            info!("清理缓存中……");
            let model = (!self.all).then_some(config.model_id.as_str());
            let removed = collection.clear(model)?;
            info!("清理完成，删除 {} 条记录", removed);
            Ok(())
        })
    }
}
