//! 协调者登记表（CoordinatorRegistry）
//!
//! 进程启动时显式构建的“协调者 ID → 协调者实例”映射，构建后只读，
//! 由拦截器与确认回调共享。解析失败视为致命错误。
//!
use crate::coordinator::Coordinator;
use crate::error::{DomainError, DomainResult as Result};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct CoordinatorRegistry {
    by_id: HashMap<String, Arc<Coordinator>>,
}

impl CoordinatorRegistry {
    /// 由一组协调者构建；ID 重复时报错
    pub fn new(coordinators: impl IntoIterator<Item = Arc<Coordinator>>) -> Result<Self> {
        let mut by_id = HashMap::new();
        for coordinator in coordinators {
            let id = coordinator.id().to_string();
            if by_id.contains_key(&id) {
                return Err(DomainError::CoordinatorAlreadyRegistered { coordinator: id });
            }
            by_id.insert(id, coordinator);
        }
        Ok(Self { by_id })
    }

    pub fn resolve(&self, coordinator_id: &str) -> Result<Arc<Coordinator>> {
        self.by_id
            .get(coordinator_id)
            .cloned()
            .ok_or_else(|| DomainError::CoordinatorNotFound {
                coordinator: coordinator_id.to_string(),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Coordinator>> {
        self.by_id.values()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
