//! CPU 模拟设备：用宿主机内存充当显存，用宿主机函数充当内核。

mod blob;
mod program;

pub(crate) use blob::Blob;
pub use program::{HostFn, HostProgram, WorkItem};

use crate::{Arg, LaunchGeometry};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

/// 模拟设备的任务队列，任务在调用线程上立即执行完毕。
#[derive(Clone, Copy, Debug)]
pub struct ThisThread;

impl ThisThread {
    /// 在 `geometry` 描述的工作范围上并行执行宿主机内核。
    ///
    /// 只执行 `work_size` 个工作项，补齐的尾部线程不会运行。
    pub(crate) fn launch(&self, f: &HostFn, geometry: LaunchGeometry, args: &[Arg]) {
        let LaunchGeometry {
            num_groups,
            group_size,
            work_size,
        } = geometry;
        (0..work_size).into_par_iter().for_each(|global_id| {
            f(
                WorkItem {
                    global_id,
                    group_id: global_id / group_size,
                    local_id: global_id % group_size,
                    group_size,
                    num_groups,
                },
                args,
            )
        })
    }
}
