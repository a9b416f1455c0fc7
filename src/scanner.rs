use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use regex::Regex;
use walkdir::{DirEntry, WalkDir};

use crate::utils::{hash_file, system_time_nanos};

/// 磁盘上的一个图片文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    /// 绝对路径，在同一个集合内唯一
    pub path: PathBuf,
    pub size_bytes: u64,
    /// 修改时间，UNIX 纪元以来的纳秒数
    pub modified_time: i64,
    /// 文件内容的 blake3 哈希，按需计算
    pub content_fingerprint: Option<[u8; 32]>,
}

impl ImageRecord {
    /// 读取文件内容计算哈希，已经计算过则直接返回
    pub fn fingerprint(&mut self) -> std::io::Result<[u8; 32]> {
        if let Some(hash) = self.content_fingerprint {
            return Ok(hash);
        }
        let hash = hash_file(&self.path)?;
        self.content_fingerprint = Some(hash);
        Ok(hash)
    }
}

/// 扫描过程中遇到的非致命问题
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScanWarning {
    #[error("permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),
    #[error("symlink loop: {}", .0.display())]
    SymlinkLoop(PathBuf),
    #[error("non utf-8 path: {}", .0.display())]
    NonUtf8Path(PathBuf),
    #[error("{}: {message}", .path.display())]
    Io { path: PathBuf, message: String },
    /// 遍历本身的错误，信息中已包含路径
    #[error("{0}")]
    Walk(String),
}

/// 递归扫描目录，产出符合后缀名的图片文件
#[derive(Debug, Clone)]
pub struct FileScanner {
    root: PathBuf,
    re_suf: Regex,
}

impl FileScanner {
    /// # Arguments
    ///
    /// * `root` - 集合根目录
    /// * `extensions` - 允许的后缀名，不区分大小写，不含 `.`
    pub fn new(root: impl Into<PathBuf>, extensions: &[String]) -> Self {
        let alternatives = extensions
            .iter()
            .map(|s| regex::escape(s.trim().trim_start_matches('.')))
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("|");
        let re_suf = Regex::new(&format!("(?i)^({})$", alternatives)).expect("failed to build regex");
        Self { root: root.into(), re_suf }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn accepts(&self, path: &Path) -> bool {
        path.extension().is_some_and(|ext| self.re_suf.is_match(&ext.to_string_lossy()))
    }

    /// 开始一次新的扫描
    ///
    /// 根目录不存在时直接返回错误，扫描过程中的问题则记录为警告，不会中断扫描。
    /// 每次调用都会从头开始遍历，产出的顺序不作保证。
    pub fn scan(&self) -> std::io::Result<Scan<'_>> {
        let meta = std::fs::metadata(&self.root)?;
        if !meta.is_dir() {
            return Err(std::io::Error::new(ErrorKind::NotADirectory, "root is not a directory"));
        }
        debug!("开始扫描目录: {}", self.root.display());
        let walker = WalkDir::new(&self.root)
            .follow_links(true)
            .into_iter()
            .filter_entry(keep_entry as fn(&DirEntry) -> bool);
        Ok(Scan { scanner: self, walker, warnings: vec![] })
    }
}

/// 跳过隐藏文件和目录，根目录本身除外
fn keep_entry(entry: &DirEntry) -> bool {
    entry.depth() == 0 || !entry.file_name().to_str().is_some_and(|s| s.starts_with('.'))
}

/// 惰性扫描迭代器
pub struct Scan<'a> {
    scanner: &'a FileScanner,
    walker: walkdir::FilterEntry<walkdir::IntoIter, fn(&DirEntry) -> bool>,
    warnings: Vec<ScanWarning>,
}

impl Scan<'_> {
    /// 到目前为止收集到的警告
    pub fn warnings(&self) -> &[ScanWarning] {
        &self.warnings
    }

    pub fn into_warnings(self) -> Vec<ScanWarning> {
        self.warnings
    }

    fn warn(&mut self, warning: ScanWarning) {
        warn!("扫描警告: {}", warning);
        self.warnings.push(warning);
    }

    fn classify(err: walkdir::Error) -> ScanWarning {
        let path = err.path().map(Path::to_path_buf);
        if err.loop_ancestor().is_some() {
            return ScanWarning::SymlinkLoop(path.unwrap_or_default());
        }
        match err.io_error().map(|e| e.kind()) {
            Some(ErrorKind::PermissionDenied) => {
                ScanWarning::PermissionDenied(path.unwrap_or_default())
            }
            _ => ScanWarning::Walk(err.to_string()),
        }
    }
}

impl Iterator for Scan<'_> {
    type Item = ImageRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    self.warn(Self::classify(err));
                    continue;
                }
            };
            if !entry.file_type().is_file() || !self.scanner.accepts(entry.path()) {
                continue;
            }
            if entry.path().to_str().is_none() {
                self.warn(ScanWarning::NonUtf8Path(entry.path().to_path_buf()));
                continue;
            }
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(err) => {
                    self.warn(Self::classify(err));
                    continue;
                }
            };
            let modified = match meta.modified() {
                Ok(t) => system_time_nanos(t),
                Err(e) => {
                    let path = entry.path().to_path_buf();
                    self.warn(ScanWarning::Io { path, message: e.to_string() });
                    continue;
                }
            };
            return Some(ImageRecord {
                path: entry.into_path(),
                size_bytes: meta.len(),
                modified_time: modified,
                content_fingerprint: None,
            });
        }
    }
}
