// 该文件是 Shaobing （哨兵） 项目的一部分。
// src/model/cache.rs - 进程级模型缓存
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, info};

use crate::model::{Acquire, ModelHandle, ModelLoadError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
  Empty,
  Loading,
  Ready,
}

enum SlotState {
  Empty,
  Loading,
  Ready(Arc<ModelHandle>),
}

struct SlotInner {
  state: SlotState,
  // 每完成一次加载尝试加一，等待者据此判断自己等待的那次是否已结束
  round: u64,
  last_error: Option<ModelLoadError>,
}

struct Slot {
  inner: Mutex<SlotInner>,
  changed: Condvar,
}

impl Slot {
  fn new() -> Self {
    Self {
      inner: Mutex::new(SlotInner {
        state: SlotState::Empty,
        round: 0,
        last_error: None,
      }),
      changed: Condvar::new(),
    }
  }

  fn lock(&self) -> MutexGuard<'_, SlotInner> {
    // 状态只在持锁时整体替换，锁中毒时内部数据仍然一致
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// 按模型路径缓存句柄，每个路径同一时刻最多只有一次加载在进行
pub struct ModelCache {
  acquirer: Arc<dyn Acquire>,
  slots: Mutex<HashMap<PathBuf, Arc<Slot>>>,
}

impl ModelCache {
  pub fn new(acquirer: Arc<dyn Acquire>) -> Self {
    Self {
      acquirer,
      slots: Mutex::new(HashMap::new()),
    }
  }

  fn slot(&self, artifact: &Path) -> Arc<Slot> {
    let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
    slots
      .entry(artifact.to_path_buf())
      .or_insert_with(|| Arc::new(Slot::new()))
      .clone()
  }

  pub fn state(&self, artifact: &Path) -> CacheState {
    match self.slot(artifact).lock().state {
      SlotState::Empty => CacheState::Empty,
      SlotState::Loading => CacheState::Loading,
      SlotState::Ready(_) => CacheState::Ready,
    }
  }

  /// 只读取已缓存的句柄，不触发加载
  pub fn cached(&self, artifact: &Path) -> Option<Arc<ModelHandle>> {
    match &self.slot(artifact).lock().state {
      SlotState::Ready(handle) => Some(handle.clone()),
      _ => None,
    }
  }

  /// 获取模型句柄。
  ///
  /// 已缓存时直接返回；否则由第一个调用者执行加载，其余并发调用者等待并得到同一次加载的结果。
  /// 加载失败时缓存保持为空，下一次调用会重新尝试全部策略。
  pub fn get(&self, artifact: &Path) -> Result<Arc<ModelHandle>, ModelLoadError> {
    let slot = self.slot(artifact);
    let mut inner = slot.lock();

    loop {
      if let SlotState::Ready(handle) = &inner.state {
        return Ok(handle.clone());
      }
      if !matches!(inner.state, SlotState::Loading) {
        break;
      }

      let round = inner.round;
      debug!("等待进行中的模型加载: {}", artifact.display());
      while matches!(inner.state, SlotState::Loading) && inner.round == round {
        inner = slot
          .changed
          .wait(inner)
          .unwrap_or_else(PoisonError::into_inner);
      }
      if matches!(inner.state, SlotState::Empty)
        && let Some(err) = &inner.last_error
      {
        return Err(err.clone());
      }
    }

    inner.state = SlotState::Loading;
    drop(inner);

    let mut guard = LoadingGuard {
      slot: &slot,
      finished: false,
    };
    let result = self.acquirer.acquire(artifact);
    guard.finished = true;

    let mut inner = slot.lock();
    inner.round += 1;
    let outcome = match result {
      Ok(handle) => {
        let handle = Arc::new(handle);
        info!(
          "模型已缓存: {} (策略: {})",
          artifact.display(),
          handle.strategy()
        );
        inner.state = SlotState::Ready(handle.clone());
        inner.last_error = None;
        Ok(handle)
      }
      Err(err) => {
        inner.state = SlotState::Empty;
        inner.last_error = Some(err.clone());
        Err(err)
      }
    };
    drop(inner);
    slot.changed.notify_all();

    outcome
  }
}

// 加载过程中 panic 时把槽位恢复为空，避免停留在半初始化状态
struct LoadingGuard<'a> {
  slot: &'a Slot,
  finished: bool,
}

impl Drop for LoadingGuard<'_> {
  fn drop(&mut self) {
    if self.finished {
      return;
    }
    let mut inner = self.slot.lock();
    inner.state = SlotState::Empty;
    inner.round += 1;
    inner.last_error = None;
    drop(inner);
    self.slot.changed.notify_all();
  }
}
