use anyhow::{Context, bail};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::write_atomic;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// 根据 URL 推断缓存文件名，取不到合适扩展名时使用 jpg
pub fn cache_file_name(url: &str) -> String {
    let path = url
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .rsplit('/')
        .next()
        .unwrap_or_default();

    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .filter(|e| matches!(e.as_str(), "jpg" | "jpeg" | "png" | "gif" | "webp"))
        .unwrap_or_else(|| "jpg".to_string());

    format!("reward.{}", ext)
}

/// 确保奖励图片已缓存在 `dir` 下，必要时下载一次。不做完整性校验。
pub async fn ensure_reward_image(url: &str, dir: &Path) -> anyhow::Result<PathBuf> {
    let path = dir.join(cache_file_name(url));
    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Ok(path);
    }

    info!(target: "SakiSaki/Asset", "正在下载奖励图片: {}", url);

    let client = reqwest::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .context("创建 HTTP 客户端失败")?;

    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("请求 {} 失败", url))?;

    if !resp.status().is_success() {
        bail!("下载 {} 失败: HTTP {}", url, resp.status());
    }

    let bytes = resp.bytes().await.context("读取图片内容失败")?;
    if bytes.is_empty() {
        bail!("下载 {} 得到空文件", url);
    }

    let target = path.clone();
    tokio::task::spawn_blocking(move || write_atomic(&target, &bytes))
        .await
        .context("写盘任务异常退出")?
        .with_context(|| format!("保存图片到 {} 失败", path.display()))?;

    info!(target: "SakiSaki/Asset", "奖励图片已缓存: {}", path.display());
    Ok(path)
}

/// 本地文件转为消息元素可用的地址
pub fn file_url(path: &Path) -> String {
    let abs = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    format!("file://{}", abs.display())
}
