use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use directories::ProjectDirs;

use crate::cli::*;
use crate::collection::CollectionConfig;
use crate::db::MAX_MODEL_ID_LEN;
use crate::provider::{EmbeddingProvider, HttpEmbeddingProvider};
use crate::search::DEFAULT_TOP_K;

static CONF_DIR: LazyLock<ConfDir> = LazyLock::new(|| {
    let proj_dirs =
        ProjectDirs::from("", "clipsearch", "clipsearch").expect("failed to get project dir");
    ConfDir { path: proj_dirs.config_dir().to_path_buf() }
});

fn default_config_dir() -> &'static str {
    CONF_DIR.path().to_str().unwrap()
}

/// 预置的嵌入模型
#[derive(Debug, Clone, Copy)]
pub struct ModelPreset {
    /// 简称，可以代替完整的模型 ID 使用
    pub alias: &'static str,
    pub name: &'static str,
    pub pretrained: &'static str,
    pub notes: &'static str,
}

impl ModelPreset {
    /// 完整的模型 ID，形如 `ViT-B-32/laion2b_s34b_b79k`
    pub fn id(&self) -> String {
        format!("{}/{}", self.name, self.pretrained)
    }
}

pub const MODELS: &[ModelPreset] = &[
    ModelPreset {
        alias: "fast",
        name: "ViT-B-32",
        pretrained: "laion2b_s34b_b79k",
        notes: "Good balance of speed and quality. Recommended for most users.",
    },
    ModelPreset {
        alias: "high",
        name: "ViT-L-14",
        pretrained: "laion2b_s32b_b82k",
        notes: "Excellent quality. Requires a good GPU for reasonable speed.",
    },
    ModelPreset {
        alias: "best",
        name: "ViT-H-14",
        pretrained: "laion2b_s32b_b79k",
        notes: "State-of-the-art. Very slow. Requires a high-end GPU (12GB+ VRAM).",
    },
];

/// 默认模型 ID
pub const DEFAULT_MODEL: &str = "ViT-B-32/laion2b_s34b_b79k";

/// 将简称或模型名解析为完整的模型 ID，无法识别的字符串原样返回
pub fn resolve_model(s: &str) -> String {
    MODELS
        .iter()
        .find(|m| m.alias.eq_ignore_ascii_case(s) || m.name == s)
        .map(ModelPreset::id)
        .unwrap_or_else(|| s.to_string())
}

fn parse_model(s: &str) -> Result<String, String> {
    match s.trim() {
        "" => Err("模型 ID 不能为空".to_string()),
        s if s.contains('\0') => Err("模型 ID 不能包含 NUL 字符".to_string()),
        s if s.len() > MAX_MODEL_ID_LEN => Err(format!("模型 ID 不能超过 {} 字节", MAX_MODEL_ID_LEN)),
        s => Ok(resolve_model(s)),
    }
}

#[derive(Parser, Debug, Clone)]
pub struct CollectionOptions {
    /// 图片目录
    pub root: PathBuf,
    /// 嵌入模型，可以是完整 ID 或简称（fast / high / best）
    #[arg(short, long, value_name = "MODEL", default_value = DEFAULT_MODEL, value_parser = parse_model)]
    pub model: String,
    /// 需要索引的图片扩展名，不区分大小写
    #[arg(long = "ext", value_name = "EXT", value_delimiter = ',', default_value = "jpg,jpeg,png,bmp,webp")]
    pub extensions: Vec<String>,
}

impl CollectionOptions {
    pub fn config(&self) -> CollectionConfig {
        CollectionConfig {
            extensions: self.extensions.clone(),
            ..CollectionConfig::new(&self.root, &self.model)
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct IndexOptions {
    /// 每批计算的图片数量，每批结束后写入缓存
    #[arg(short, long, value_name = "SIZE", default_value_t = 64, value_parser = clap::value_parser!(u32).range(1..))]
    pub batch_size: u32,
    /// 并发计算的线程数，默认为 CPU 核心数
    #[arg(short = 'j', long, value_name = "N")]
    pub workers: Option<usize>,
    /// 额外校验已缓存文件的内容哈希，能发现修改时间不变的编辑，内容不变时只更新记录
    #[arg(long)]
    pub verify_content: bool,
}

impl IndexOptions {
    pub fn apply(&self, config: &mut CollectionConfig) {
        config.batch_size = self.batch_size as usize;
        if let Some(workers) = self.workers {
            config.workers = workers.max(1);
        }
        config.verify_content = self.verify_content;
    }
}

#[derive(Parser, Debug, Clone)]
pub struct ProviderOptions {
    /// 推理服务地址
    #[arg(long, value_name = "URL", default_value = "http://127.0.0.1:8008")]
    pub endpoint: String,
    /// 单次请求超时时间（秒）
    #[arg(long, value_name = "SECS", default_value_t = 60)]
    pub timeout: u64,
}

impl ProviderOptions {
    /// 必须在 tokio 运行时中调用
    pub fn build(&self) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
        let provider = HttpEmbeddingProvider::new(&self.endpoint, Duration::from_secs(self.timeout))?;
        Ok(Arc::new(provider))
    }
}

#[derive(Parser, Debug, Clone)]
pub struct SearchOptions {
    /// 显示的结果数量，最多 200
    #[arg(long, value_name = "COUNT", default_value_t = DEFAULT_TOP_K)]
    pub count: usize,
    /// 输出格式
    #[arg(long, value_enum, value_name = "FORMAT", default_value_t = OutputFormat::Table)]
    pub output_format: OutputFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Table,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "clipsearch", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// clipsearch 配置文件目录
    #[arg(short, long, global = true, default_value = default_config_dir())]
    pub conf_dir: ConfDir,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 同步图片目录与索引
    Index(IndexCommand),
    /// 以文字、图片或已索引图片搜索
    Search(SearchCommand),
    /// 列出预置模型
    Models(ModelsCommand),
    /// 查看集合状态
    Status(StatusCommand),
    /// 删除集合的缓存
    Clean(CleanCommand),
    /// 启动 HTTP 搜索服务
    Server(ServerCommand),
}

#[derive(Debug, Clone)]
pub struct ConfDir {
    path: PathBuf,
}

impl ConfDir {
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 返回某个图片目录对应的缓存目录
    ///
    /// 缓存放在配置目录下，以目录路径的哈希区分不同集合
    pub fn collection_store(&self, root: &Path) -> PathBuf {
        let hash = blake3::hash(root.as_os_str().as_encoded_bytes());
        self.path.join("collections").join(&hash.to_hex()[..16])
    }
}

impl FromStr for ConfDir {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self { path: PathBuf::from(s) })
    }
}
