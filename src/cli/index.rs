use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use indicatif::ProgressBar;
use log::{info, warn};
use tokio::task::{block_in_place, spawn_blocking};
use tokio_util::sync::CancellationToken;

use crate::cli::SubCommandExtend;
use crate::collection::CollectionBuilder;
use crate::config::{CollectionOptions, IndexOptions, Opts, ProviderOptions};
use crate::reconcile::{IndexEvent, event_channel};
use crate::utils::pb_style;

#[derive(Parser, Debug, Clone)]
pub struct IndexCommand {
    #[command(flatten)]
    pub collection: CollectionOptions,
    #[command(flatten)]
    pub index: IndexOptions,
    #[command(flatten)]
    pub provider: ProviderOptions,
}

impl SubCommandExtend for IndexCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let mut config = self.collection.config();
        self.index.apply(&mut config);

        let provider = self.provider.build()?;
        let collection = Arc::new(block_in_place(|| {
            CollectionBuilder::new(opts.conf_dir.clone(), config).provider(provider).open()
        })?);

        // Ctrl-C 时停止派发新任务，已完成的结果会保留
        let cancel = CancellationToken::new();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("收到中断信号，正在停止……");
                    cancel.cancel();
                }
            }
        });

        let pb = ProgressBar::no_length().with_style(pb_style());
        let (events, rx) = event_channel(1024);
        let progress = spawn_blocking({
            let pb = pb.clone();
            move || {
                for event in rx {
                    match event {
                        IndexEvent::ScanStarted { total_estimate } => {
                            pb.set_message(format!("已缓存 {}", total_estimate));
                        }
                        IndexEvent::ItemIndexed { index, total, .. } => {
                            pb.set_length(total as u64);
                            pb.set_position(index as u64);
                        }
                        IndexEvent::ItemFailed { path, reason } => {
                            pb.inc(1);
                            pb.println(format!("[ERR] {}: {}", path.display(), reason));
                        }
                        IndexEvent::ReconciliationComplete { .. } => pb.finish_and_clear(),
                    }
                }
            }
        });

        let report = spawn_blocking({
            let collection = collection.clone();
            move || collection.reconcile(&events, &cancel)
        })
        .await??;
        progress.await?;

        if report.warnings > 0 {
            warn!("扫描时出现 {} 个警告", report.warnings);
        }
        info!(
            "共 {} 个文件，新增 {}，删除 {}，更新 {}，失败 {}",
            report.scanned,
            report.added,
            report.removed,
            report.refreshed,
            report.failed.len()
        );
        if report.cancelled {
            warn!("索引未完成，再次运行将从中断处继续");
        }
        Ok(())
    }
}
