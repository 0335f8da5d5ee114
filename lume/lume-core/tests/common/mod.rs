#![allow(dead_code)]

use lume_core::software::SoftwareBackend;
use lume_core::{
    BufferDescriptor, BufferUsage, ContextOptions, DeviceOptions, DiagnosticRecord,
    GraphicsContext, GraphicsDevice, Severity, ShaderMetadata, ShaderStage,
};
use std::sync::{Arc, Mutex};

pub struct Harness {
    pub context: GraphicsContext,
    pub backend: SoftwareBackend,
    pub device: GraphicsDevice,
    records: Arc<Mutex<Vec<DiagnosticRecord>>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(SoftwareBackend::new(), DeviceOptions::default())
    }

    pub fn with(backend: SoftwareBackend, options: DeviceOptions) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let context = GraphicsContext::new(ContextOptions { validation: true });
        let records = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&records);
        context.set_log_handler(move |record: &DiagnosticRecord| {
            sink.lock().unwrap().push(record.clone());
        });
        let device = context
            .create_device(
                Arc::new(backend.clone()),
                DeviceOptions {
                    arena_reserve_bytes: 4 << 20,
                    ..options
                },
            )
            .unwrap();
        Self {
            context,
            backend,
            device,
            records,
        }
    }

    pub fn records(&self) -> Vec<DiagnosticRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn errors_from(&self, function: &str) -> usize {
        self.records()
            .iter()
            .filter(|r| r.severity == Severity::Error && r.function == function)
            .count()
    }

    pub fn clear_records(&self) {
        self.records.lock().unwrap().clear();
    }
}

pub fn kernel_stage(
    name: &str,
    thread_group_size: [u32; 3],
    push_constant_count: u32,
) -> ShaderStage {
    ShaderStage {
        bytecode: name.as_bytes().to_vec(),
        entry_point: "main".into(),
        metadata: ShaderMetadata {
            thread_group_size,
            push_constant_count,
        },
    }
}

pub fn storage_buffer(label: &'static str, size: u64) -> BufferDescriptor {
    BufferDescriptor {
        label: Some(label),
        size,
        usage: BufferUsage::STORAGE | BufferUsage::COPY_SRC | BufferUsage::COPY_DST,
        ..Default::default()
    }
}
