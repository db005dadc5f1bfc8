// 文件指纹计算
//
// 指纹用于接收端的秒传判断（整文件去重）和分片标识前缀。
//
// 采样模式（默认）：
// 1. 完整读取文件前 2MB
// 2. 其余部分按 2MB 步长前进，非最后一段只取三个 2 字节锚点：
//    段首、段中点、段尾
// 3. 最后一段（可能不足 2MB）完整读取
// 4. 所有采样字节按原顺序拼接后计算 MD5
//
// ⚠️ 采样指纹只是粗粒度身份标识，仅在未采样区域不同的两个文件会得到相同指纹。
// 改变采样规则会使已存储数据的去重结果失效，因此规则必须保持不变。

use anyhow::{Context, Result};
use md5::Context as Md5Context;
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::Path;
use tracing::debug;

/// 采样步长: 2MB
pub const SAMPLE_STRIDE: u64 = 2 * 1024 * 1024;

/// 锚点窗口大小
pub const ANCHOR_SIZE: u64 = 2;

/// 读取缓冲区大小
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// 指纹计算方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintMode {
    /// 稀疏采样（近似常数时间）
    #[default]
    Sampled,
    /// 完整内容 MD5
    Full,
}

/// 文件指纹计算器
pub struct ContentFingerprinter;

impl ContentFingerprinter {
    /// 计算文件指纹
    pub async fn calculate(path: &Path, mode: FingerprintMode) -> Result<String> {
        let path = path.to_path_buf();

        // 在阻塞线程池中执行文件 I/O
        tokio::task::spawn_blocking(move || Self::calculate_sync(&path, mode))
            .await
            .context("计算指纹任务执行失败")?
    }

    fn calculate_sync(path: &Path, mode: FingerprintMode) -> Result<String> {
        let file = std::fs::File::open(path).with_context(|| format!("无法打开文件: {:?}", path))?;
        let size = file.metadata().context("无法获取文件元数据")?.len();

        let fingerprint = Self::calculate_from_reader(file, size, mode)?;

        debug!(
            "文件指纹计算完成: path={:?}, size={}, mode={:?}, fingerprint={}",
            path, size, mode, fingerprint
        );

        Ok(fingerprint)
    }

    /// 从任意可定位的读取源计算指纹
    pub fn calculate_from_reader<R: Read + Seek>(
        mut reader: R,
        size: u64,
        mode: FingerprintMode,
    ) -> Result<String> {
        let ranges = match mode {
            FingerprintMode::Sampled => sample_ranges(size),
            FingerprintMode::Full if size > 0 => vec![0..size],
            FingerprintMode::Full => Vec::new(),
        };

        let mut hasher = Md5Context::new();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];

        for range in ranges {
            reader
                .seek(SeekFrom::Start(range.start))
                .context("文件定位失败")?;

            let mut remaining = range.end - range.start;
            while remaining > 0 {
                let want = remaining.min(READ_BUFFER_SIZE as u64) as usize;
                reader
                    .read_exact(&mut buffer[..want])
                    .context("读取文件失败")?;
                hasher.consume(&buffer[..want]);
                remaining -= want as u64;
            }
        }

        Ok(format!("{:x}", hasher.compute()))
    }
}

/// 采样模式下参与哈希的字节范围（按文件顺序）
pub fn sample_ranges(size: u64) -> Vec<Range<u64>> {
    let mut ranges = Vec::new();
    if size == 0 {
        return ranges;
    }

    ranges.push(0..size.min(SAMPLE_STRIDE));

    let mut cur = SAMPLE_STRIDE;
    while cur < size {
        let end = cur + SAMPLE_STRIDE;
        if end >= size {
            // 最后一段完整读取
            ranges.push(cur..size);
        } else {
            let mid = cur + SAMPLE_STRIDE / 2;
            ranges.push(cur..cur + ANCHOR_SIZE);
            ranges.push(mid..mid + ANCHOR_SIZE);
            ranges.push(end - ANCHOR_SIZE..end);
        }
        cur = end;
    }

    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const STRIDE: usize = SAMPLE_STRIDE as usize;

    fn test_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn sampled(data: &[u8]) -> String {
        ContentFingerprinter::calculate_from_reader(
            Cursor::new(data),
            data.len() as u64,
            FingerprintMode::Sampled,
        )
        .unwrap()
    }

    #[test]
    fn test_sample_ranges_small_file() {
        assert!(sample_ranges(0).is_empty());
        assert_eq!(sample_ranges(100), vec![0..100]);
        assert_eq!(sample_ranges(SAMPLE_STRIDE), vec![0..SAMPLE_STRIDE]);
    }

    #[test]
    fn test_sample_ranges_layout() {
        let s = SAMPLE_STRIDE;
        let size = 4 * s + 100;
        let ranges = sample_ranges(size);
        assert_eq!(
            ranges,
            vec![
                0..s,
                s..s + 2,
                s + s / 2..s + s / 2 + 2,
                2 * s - 2..2 * s,
                2 * s..2 * s + 2,
                2 * s + s / 2..2 * s + s / 2 + 2,
                3 * s - 2..3 * s,
                3 * s..3 * s + 2,
                3 * s + s / 2..3 * s + s / 2 + 2,
                4 * s - 2..4 * s,
                4 * s..size,
            ]
        );

        // 恰好结束于步长边界时，最后一段完整读取
        let ranges = sample_ranges(2 * s);
        assert_eq!(ranges, vec![0..s, s..2 * s]);
    }

    #[test]
    fn test_sampled_fingerprint_is_deterministic() {
        let data = test_data(3 * STRIDE + 17);
        assert_eq!(sampled(&data), sampled(&data));
        assert_eq!(sampled(&data).len(), 32);
    }

    #[test]
    fn test_small_file_equals_full_md5() {
        let data = test_data(1000);
        assert_eq!(sampled(&data), format!("{:x}", md5::compute(&data)));
    }

    #[test]
    fn test_anchor_change_changes_fingerprint() {
        let data = test_data(4 * STRIDE + 100);
        let base = sampled(&data);

        for pos in [
            5,                      // 前 2MB
            STRIDE,                 // 段首锚点
            STRIDE + STRIDE / 2 + 1, // 段中点锚点
            2 * STRIDE - 1,         // 段尾锚点
            4 * STRIDE + 50,        // 最后一段
        ] {
            let mut changed = data.clone();
            changed[pos] ^= 0xFF;
            assert_ne!(sampled(&changed), base, "position {} should be sampled", pos);
        }
    }

    #[test]
    fn test_interior_change_keeps_fingerprint() {
        let data = test_data(4 * STRIDE + 100);
        let base = sampled(&data);

        for pos in [STRIDE + 1000, 2 * STRIDE + 10, 3 * STRIDE + STRIDE / 2 + 5] {
            let mut changed = data.clone();
            changed[pos] ^= 0xFF;
            assert_eq!(sampled(&changed), base, "position {} should not be sampled", pos);
        }
    }

    #[test]
    fn test_full_mode_hashes_everything() {
        let data = test_data(4 * STRIDE + 100);
        let full = ContentFingerprinter::calculate_from_reader(
            Cursor::new(&data),
            data.len() as u64,
            FingerprintMode::Full,
        )
        .unwrap();
        assert_eq!(full, format!("{:x}", md5::compute(&data)));

        let mut changed = data.clone();
        changed[STRIDE + 1000] ^= 0xFF;
        let full_changed = ContentFingerprinter::calculate_from_reader(
            Cursor::new(&changed),
            changed.len() as u64,
            FingerprintMode::Full,
        )
        .unwrap();
        assert_ne!(full, full_changed);
    }

    #[tokio::test]
    async fn test_calculate_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("video.mp4");
        let data = test_data(STRIDE + 10);
        std::fs::write(&path, &data).unwrap();

        let fp = ContentFingerprinter::calculate(&path, FingerprintMode::Sampled)
            .await
            .unwrap();
        assert_eq!(fp, sampled(&data));

        let empty = dir.path().join("empty.txt");
        std::fs::write(&empty, b"").unwrap();
        let fp = ContentFingerprinter::calculate(&empty, FingerprintMode::Sampled)
            .await
            .unwrap();
        assert_eq!(fp, format!("{:x}", md5::compute(b"")));
    }

    #[tokio::test]
    async fn test_missing_file_is_error() {
        let result =
            ContentFingerprinter::calculate(Path::new("/nonexistent/file"), FingerprintMode::Full)
                .await;
        assert!(result.is_err());
    }
}
