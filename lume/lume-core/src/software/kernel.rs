//! CPU kernels standing in for shader bytecode.

use super::resources::SoftwareBuffer;
use super::SoftwareDescriptor;
use crate::dictionary::ConcurrentDictionary;
use crate::resource::DescriptorUsage;

const LOG_TARGET: &str = "lume::resource";

/// A compute or vertex "shader" executed once per thread (or vertex).
pub trait ComputeKernel: Send + Sync {
    fn run(&self, invocation: &mut KernelInvocation<'_>);
}

impl<F> ComputeKernel for F
where
    F: Fn(&mut KernelInvocation<'_>) + Send + Sync,
{
    fn run(&self, invocation: &mut KernelInvocation<'_>) {
        self(invocation)
    }
}

/// What a kernel sees for one thread: its id, the bound push constants, and
/// descriptor-indexed buffer access.
pub struct KernelInvocation<'a> {
    pub(crate) thread_id: [u32; 3],
    pub(crate) push_constants: &'a [u32],
    pub(crate) descriptors: &'a ConcurrentDictionary<u32, SoftwareDescriptor>,
}

impl KernelInvocation<'_> {
    /// Global thread id for dispatches; `[vertex, instance, 0]` for draws.
    pub fn thread_id(&self) -> [u32; 3] {
        self.thread_id
    }

    /// Push constant at `index`; zero when out of range.
    pub fn push_constant(&self, index: usize) -> u32 {
        self.push_constants.get(index).copied().unwrap_or(0)
    }

    fn buffer(&self, descriptor: u32) -> Option<SoftwareDescriptor> {
        let found = self.descriptors.get(&descriptor);
        if found.is_none() {
            log::error!(target: LOG_TARGET, "kernel used unbound descriptor {}", descriptor);
        }
        found
    }

    /// Number of `u32` elements behind a descriptor.
    pub fn len_u32(&self, descriptor: u32) -> usize {
        self.buffer(descriptor)
            .and_then(|d| d.resource.as_any().downcast_ref::<SoftwareBuffer>().map(|b| b.len() / 4))
            .unwrap_or(0)
    }

    /// Reads element `element` of the buffer behind `descriptor`. Out-of-range reads yield zero.
    pub fn load_u32(&self, descriptor: u32, element: usize) -> u32 {
        let Some(desc) = self.buffer(descriptor) else {
            return 0;
        };
        match desc.resource.as_any().downcast_ref::<SoftwareBuffer>() {
            Some(buffer) => buffer.load_u32(element).unwrap_or(0),
            None => {
                log::error!(target: LOG_TARGET, "descriptor {} is not a buffer", descriptor);
                0
            }
        }
    }

    /// Writes element `element`. Stores through read-only descriptors are dropped.
    pub fn store_u32(&mut self, descriptor: u32, element: usize, value: u32) {
        let Some(desc) = self.buffer(descriptor) else {
            return;
        };
        if desc.usage != DescriptorUsage::Write {
            log::error!(
                target: LOG_TARGET,
                "store through read-only descriptor {}",
                descriptor
            );
            return;
        }
        match desc.resource.as_any().downcast_ref::<SoftwareBuffer>() {
            Some(buffer) => {
                if buffer.store_u32(element, value).is_none() {
                    log::error!(
                        target: LOG_TARGET,
                        "store to element {} past the end of descriptor {}",
                        element,
                        descriptor
                    );
                }
            }
            None => log::error!(target: LOG_TARGET, "descriptor {} is not a buffer", descriptor),
        }
    }
}
