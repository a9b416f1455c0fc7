use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use indicatif::ProgressStyle;

/// 默认进度条样式
pub fn pb_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {eta} {wide_msg}",
    )
    .expect("invalid progress template")
    .progress_chars("##-")
}

/// 将向量原地归一化为单位长度，零向量保持不变
///
/// 返回归一化之前的 L2 范数
pub fn normalize(v: &mut [f32]) -> f32 {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    norm
}

/// 点积，调用方需保证两个向量维数相同
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// 计算文件内容的 blake3 哈希
pub fn hash_file(path: impl AsRef<Path>) -> std::io::Result<[u8; 32]> {
    let file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    hasher.update_reader(file)?;
    Ok(*hasher.finalize().as_bytes())
}

/// 将修改时间转换为 UNIX 纪元以来的纳秒数，早于纪元的时间记为负数
pub fn system_time_nanos(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        Err(e) => -(e.duration().as_nanos() as i64),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_normalize() {
        let mut v = [3.0, 4.0];
        let norm = normalize(&mut v);
        assert!((norm - 5.0).abs() < 1e-6);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_zero() {
        let mut v = [0.0; 4];
        assert_eq!(normalize(&mut v), 0.0);
        assert_eq!(v, [0.0; 4]);
    }

    #[test]
    fn test_system_time_nanos() {
        let t = UNIX_EPOCH + Duration::from_secs(2);
        assert_eq!(system_time_nanos(t), 2_000_000_000);
        let t = UNIX_EPOCH - Duration::from_secs(1);
        assert_eq!(system_time_nanos(t), -1_000_000_000);
    }

    #[test]
    fn test_hash_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        // 大于单次读取的缓冲区
        let data = (0..300_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        std::fs::write(&path, &data).unwrap();
        assert_eq!(hash_file(&path).unwrap(), *blake3::hash(&data).as_bytes());
        assert!(hash_file(dir.path().join("missing")).is_err());
    }
}
