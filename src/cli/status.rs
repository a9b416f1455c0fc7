use anyhow::Result;
use clap::Parser;
use tokio::task::block_in_place;

use crate::cli::SubCommandExtend;
use crate::collection::CollectionBuilder;
use crate::config::{CollectionOptions, Opts, OutputFormat};

#[derive(Parser, Debug, Clone)]
pub struct StatusCommand {
    #[command(flatten)]
    pub collection: CollectionOptions,
    /// 输出格式
    #[arg(long, value_enum, value_name = "FORMAT", default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for StatusCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let status = block_in_place(|| -> Result<_> {
            let collection =
                CollectionBuilder::new(opts.conf_dir.clone(), self.collection.config()).open()?;
            Ok(collection.status()?)
        })?;

        match self.output_format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
            OutputFormat::Table => {
                println!("root:    {}", status.root.display());
                println!("model:   {}", status.model_id);
                println!("indexed: {}", status.indexed);
                if let Some(dim) = status.dim {
                    println!("dim:     {}", dim);
                }
                for (model, count) in &status.cached {
                    println!("cached:  {}\t{}", count, model);
                }
            }
        }
        Ok(())
    }
}
