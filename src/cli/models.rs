use anyhow::Result;
use clap::Parser;
use serde_json::json;

use crate::cli::SubCommandExtend;
use crate::config::{DEFAULT_MODEL, MODELS, Opts, OutputFormat};

#[derive(Parser, Debug, Clone)]
pub struct ModelsCommand {
    /// 输出格式
    #[arg(long, value_enum, value_name = "FORMAT", default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

impl SubCommandExtend for ModelsCommand {
    async fn run(&self, _opts: &Opts) -> Result<()> {
        match self.output_format {
            OutputFormat::Json => {
                let models = MODELS
                    .iter()
                    .map(|m| {
                        json!({
                            "alias": m.alias,
                            "id": m.id(),
                            "notes": m.notes,
                            "default": m.id() == DEFAULT_MODEL,
                        })
                    })
                    .collect::<Vec<_>>();
                println!("{}", serde_json::to_string_pretty(&models)?);
            }
            OutputFormat::Table => {
                for m in MODELS {
                    let mark = if m.id() == DEFAULT_MODEL { "*" } else { " " };
                    println!("{} {:<6}{:<32}{}", mark, m.alias, m.id(), m.notes);
                }
            }
        }
        Ok(())
    }
}
