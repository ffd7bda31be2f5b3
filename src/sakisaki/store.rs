use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::write_atomic;

/// 单个玩家的战绩
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerRecord {
    pub name: String,
    pub count: u64,
}

/// 持久化的排行榜状态
///
/// `play_count` 恒等于所有玩家 `count` 之和。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderboardState {
    pub play_count: u64,
    pub players: BTreeMap<String, PlayerRecord>,
}

impl LeaderboardState {
    /// 各玩家次数之和
    pub fn total_catches(&self) -> u64 {
        self.players.values().map(|p| p.count).sum()
    }
}

/// 状态的来源
#[derive(Debug)]
pub enum LoadOrigin {
    /// 从文件解析
    File,
    /// 文件不存在，使用空状态
    Missing,
    /// 文件损坏，使用空状态
    Corrupt(anyhow::Error),
}

#[derive(Debug)]
pub struct Loaded {
    pub state: LeaderboardState,
    pub origin: LoadOrigin,
}

impl Loaded {
    pub fn is_defaulted(&self) -> bool {
        !matches!(self.origin, LoadOrigin::File)
    }
}

/// 排行榜 JSON 文件的读写
#[derive(Debug, Clone)]
pub struct CounterStore {
    path: PathBuf,
}

impl CounterStore {
    pub const FILE_NAME: &'static str = "sakisaki_data.json";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// 在数据目录下使用默认文件名
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(Self::FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取状态；文件缺失或损坏时返回空状态，不报错
    pub async fn load(&self) -> Loaded {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Loaded {
                    state: LeaderboardState::default(),
                    origin: LoadOrigin::Missing,
                };
            }
            Err(e) => {
                let err = anyhow::Error::new(e)
                    .context(format!("读取 {} 失败", self.path.display()));
                warn!(target: "SakiSaki/Store", "{:#}，按空排行榜处理", err);
                return Loaded {
                    state: LeaderboardState::default(),
                    origin: LoadOrigin::Corrupt(err),
                };
            }
        };

        match serde_json::from_slice::<LeaderboardState>(&bytes)
            .with_context(|| format!("解析 {} 失败", self.path.display()))
        {
            Ok(state) => Loaded {
                state,
                origin: LoadOrigin::File,
            },
            Err(err) => {
                warn!(target: "SakiSaki/Store", "{:#}，按空排行榜处理", err);
                Loaded {
                    state: LeaderboardState::default(),
                    origin: LoadOrigin::Corrupt(err),
                }
            }
        }
    }

    /// 整体覆盖写入
    pub async fn save(&self, state: &LeaderboardState) -> anyhow::Result<()> {
        let content = serde_json::to_vec_pretty(state).context("序列化排行榜失败")?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_atomic(&path, &content))
            .await
            .context("写盘任务异常退出")?
            .with_context(|| format!("写入 {} 失败", self.path.display()))
    }

    /// 写入空状态
    pub async fn reset(&self) -> anyhow::Result<()> {
        self.save(&LeaderboardState::default()).await
    }
}
