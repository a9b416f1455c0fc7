use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use prometheus::{BasicAuthentication, labels};
use rand::distr::{Alphanumeric, SampleString};
use tokio::net::TcpListener;
use tokio::task::{block_in_place, spawn_blocking};
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;

use crate::cli::SubCommandExtend;
use crate::collection::CollectionBuilder;
use crate::config::{CollectionOptions, IndexOptions, ProviderOptions};
use crate::reconcile::EventSender;
use crate::search::DEFAULT_TOP_K;
use crate::{Opts, server};

#[derive(Parser, Debug, Clone)]
pub struct ServerCommand {
    #[command(flatten)]
    pub collection: CollectionOptions,
    #[command(flatten)]
    pub index: IndexOptions,
    #[command(flatten)]
    pub provider: ProviderOptions,
    /// 默认返回的结果数量
    #[arg(long, value_name = "COUNT", default_value_t = DEFAULT_TOP_K)]
    pub count: usize,
    /// 启动时在后台同步一次索引
    #[arg(long)]
    pub reindex: bool,
    /// 监听地址
    #[arg(long, default_value = "127.0.0.1:8000")]
    pub addr: String,
    /// 请求验证 token，不填则随机生成
    #[arg(long, default_value_t = String::new())]
    pub token: String,
    /// prometheus 主动推送地址
    #[arg(long, value_name = "URL")]
    pub prometheus_push: Option<String>,
    /// 自定义 instance 标签值
    #[arg(long, value_name = "NAME")]
    pub prometheus_instance: Option<String>,
    /// prometheus 认证信息，格式为 username:password
    #[arg(long, value_name = "AUTH", value_parser = parse_auth)]
    pub prometheus_auth: Option<(String, String)>,
}

fn parse_auth(s: &str) -> Result<(String, String), String> {
    s.split_once(':')
        .map(|(username, password)| (username.to_string(), password.to_string()))
        .ok_or_else(|| "格式应为 username:password".to_string())
}

impl SubCommandExtend for ServerCommand {
    async fn run(&self, opts: &Opts) -> anyhow::Result<()> {
        let mut config = self.collection.config();
        self.index.apply(&mut config);

        let provider = self.provider.build()?;
        let collection = Arc::new(block_in_place(|| {
            CollectionBuilder::new(opts.conf_dir.clone(), config).provider(provider).open()
        })?);

        let mut token = self.token.clone();
        if token.is_empty() {
            token = Alphanumeric.sample_string(&mut rand::rng(), 32);
            info!("鉴权 token: {}", token);
        }

        // 关闭服务时取消后台同步
        let shutdown = CancellationToken::new();

        // 创建应用状态
        let state = server::AppState::new(collection.clone(), token, self.count, shutdown.clone());

        // 创建应用
        let app = server::create_app(state);

        if self.reindex {
            let cancel = shutdown.clone();
            spawn_blocking(move || match collection.reconcile(&EventSender::none(), &cancel) {
                Ok(report) => info!("启动同步完成，新增 {}，删除 {}", report.added, report.removed),
                Err(e) => error!("启动同步失败: {}", e),
            });
        }

        if let Some(url) = self.prometheus_push.clone() {
            let instance = self.prometheus_instance.clone().unwrap_or_else(|| self.addr.clone());
            let auth = self.prometheus_auth.clone();
            tokio::spawn(async move {
                loop {
                    let metric_families = prometheus::gather();
                    let url = url.clone();
                    let instance = instance.clone();
                    let auth = auth.clone();
                    let r = spawn_blocking(move || {
                        prometheus::push_metrics(
                            "clipsearch",
                            labels! {
                                "instance".to_string() => instance.clone(),
                            },
                            &url,
                            metric_families,
                            auth.map(|(username, password)| BasicAuthentication {
                                username,
                                password,
                            }),
                        )
                    })
                    .await;
                    match r {
                        Ok(Err(e)) => error!("推送指标失败: {e}"),
                        Err(e) => error!("推送任务异常: {e}"),
                        Ok(Ok(())) => {}
                    }
                    sleep(Duration::from_secs(30)).await;
                }
            });
        }

        // 启动服务器
        info!("服务器启动：http://{}", &self.addr);
        let listener = TcpListener::bind(&self.addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                info!("正在关闭服务器……");
                shutdown.cancel();
            })
            .await?;

        Ok(())
    }
}
