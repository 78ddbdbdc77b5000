use crate::Arg;
use std::{collections::HashMap, fmt, sync::Arc};

/// 宿主机内核函数，对每个工作项调用一次。
pub type HostFn = dyn Fn(WorkItem, &[Arg]) + Send + Sync;

/// 工作项在启动网格中的位置，对应设备内核中的线程索引。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct WorkItem {
    pub global_id: usize,
    pub group_id: usize,
    pub local_id: usize,
    pub group_size: usize,
    pub num_groups: usize,
}

/// 模拟设备上加载的程序：按入口名索引的宿主机内核集合。
#[derive(Clone, Default)]
pub struct HostProgram(HashMap<String, Arc<HostFn>>);

impl HostProgram {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加一个入口，同名入口会被替换。
    pub fn define(
        mut self,
        name: impl Into<String>,
        f: impl Fn(WorkItem, &[Arg]) + Send + Sync + 'static,
    ) -> Self {
        self.0.insert(name.into(), Arc::new(f));
        self
    }

    #[inline]
    pub(crate) fn entry(&self, name: &str) -> Option<Arc<HostFn>> {
        self.0.get(name).cloned()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for HostProgram {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut names = self.0.keys().collect::<Vec<_>>();
        names.sort_unstable();
        f.debug_tuple("HostProgram").field(&names).finish()
    }
}
