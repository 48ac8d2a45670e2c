//! Transfer and residency contract of stages and pipelines.

mod common;

use common::init_logging;
use gllm_forward::buffer::{BufferId, BufferRegistry, TransferPolicy};
use gllm_forward::device::CpuDevice;
use gllm_forward::error::EngineError;
use gllm_forward::kernels::{Kernel, KernelOp};
use gllm_forward::layout::ThreadLayout;
use gllm_forward::pipeline::{Pipeline, PipelineBuilder};
use gllm_forward::stage::{Stage, StageId};

fn silu(data: BufferId, len: usize) -> Kernel {
    Kernel::new(
        KernelOp::Silu {
            data,
            len: len as u32,
        },
        ThreadLayout::linear(len, 4),
    )
}

fn add(out: BufferId, input: BufferId, len: usize) -> Kernel {
    Kernel::new(
        KernelOp::AddInPlace {
            out,
            input,
            len: len as u32,
        },
        ThreadLayout::linear(len, 4),
    )
}

fn build(builder: PipelineBuilder, registry: &BufferRegistry) -> Result<Pipeline, EngineError> {
    builder.build(registry, Box::new(CpuDevice::new()))
}

#[test]
fn copy_once_uploads_once_and_copy_every_call_every_time() {
    init_logging();
    let mut registry = BufferRegistry::new();
    let weight = registry.register_f32("weight", vec![1.0; 8]);
    let input = registry.register_f32("input", vec![2.0; 8]);
    let mut builder = PipelineBuilder::new();
    let s = builder.add_stage(
        Stage::new("accumulate")
            .transfer_to_device(TransferPolicy::CopyOnce, &[weight])
            .transfer_to_device(TransferPolicy::CopyEveryCall, &[input])
            .transfer_to_host(&[input])
            .task(add(input, weight, 8)),
    );
    let mut pipeline = build(builder, &registry).unwrap();

    for _ in 0..5 {
        pipeline.execute(s, &mut registry).unwrap();
    }
    let stats = pipeline.stats();
    assert_eq!(stats.uploads, 1 + 5);
    assert_eq!(stats.downloads, 5);
    assert_eq!(pipeline.invocations(s), 5);
    // each call re-uploads the host copy, which already holds the previous result
    assert_eq!(registry.f32(input).unwrap(), &[7.0; 8]);
    assert!(pipeline.is_resident(weight));
    assert!(!pipeline.is_resident(input));
}

#[test]
fn persisted_buffers_flow_to_consumers_and_others_are_released() {
    init_logging();
    let mut registry = BufferRegistry::new();
    let a = registry.register_f32("a", vec![1.0; 4]);
    let b = registry.register_f32("b", vec![3.0; 4]);
    let mut builder = PipelineBuilder::new();
    let producer = builder.add_stage(
        Stage::new("producer")
            .transfer_to_device(TransferPolicy::CopyEveryCall, &[a, b])
            .persist_on_device(&[a])
            .task(add(a, b, 4)),
    );
    let consumer = builder.add_stage(
        Stage::new("consumer")
            .consume_from(producer, &[a])
            .transfer_to_host(&[a])
            .task(silu(a, 4)),
    );
    let mut pipeline = build(builder, &registry).unwrap();

    pipeline.execute(producer, &mut registry).unwrap();
    assert!(pipeline.is_resident(a));
    assert!(!pipeline.is_resident(b));

    pipeline.execute(consumer, &mut registry).unwrap();
    assert!(!pipeline.is_resident(a));
    let expected = 4.0 / (1.0 + (-4.0f32).exp());
    assert!(registry.f32(a).unwrap().iter().all(|v| (v - expected).abs() < 1e-6));
}

#[test]
fn consuming_before_the_producer_ran_is_not_resident() {
    init_logging();
    let mut registry = BufferRegistry::new();
    let a = registry.zeros_f32("a", 4);
    let mut builder = PipelineBuilder::new();
    let producer = builder.add_stage(
        Stage::new("producer")
            .transfer_to_device(TransferPolicy::CopyEveryCall, &[a])
            .persist_on_device(&[a])
            .task(silu(a, 4)),
    );
    let consumer = builder.add_stage(Stage::new("consumer").consume_from(producer, &[a]).task(silu(a, 4)));
    let mut pipeline = build(builder, &registry).unwrap();

    let err = pipeline.execute(consumer, &mut registry).unwrap_err();
    assert!(matches!(err, EngineError::NotResident { ref buffer, .. } if buffer == "a"));

    pipeline.execute(producer, &mut registry).unwrap();
    pipeline.execute(consumer, &mut registry).unwrap();
}

#[test]
fn aliased_kernel_arguments_are_rejected() {
    let mut registry = BufferRegistry::new();
    let a = registry.zeros_f32("a", 4);
    let mut builder = PipelineBuilder::new();
    builder.add_stage(
        Stage::new("alias")
            .transfer_to_device(TransferPolicy::CopyOnce, &[a])
            .task(add(a, a, 4)),
    );
    assert!(matches!(build(builder, &registry), Err(EngineError::Layout { .. })));
}

#[test]
fn consuming_a_buffer_the_producer_does_not_persist_is_rejected() {
    let mut registry = BufferRegistry::new();
    let a = registry.zeros_f32("a", 4);
    let mut builder = PipelineBuilder::new();
    let producer = builder.add_stage(
        Stage::new("producer")
            .transfer_to_device(TransferPolicy::CopyEveryCall, &[a])
            .task(silu(a, 4)),
    );
    builder.add_stage(Stage::new("consumer").consume_from(producer, &[a]).task(silu(a, 4)));
    let err = build(builder, &registry).err().unwrap();
    assert!(matches!(err, EngineError::Ordering { ref stage, .. } if stage == "consumer"));
}

#[test]
fn consuming_from_unknown_or_self_is_rejected() {
    let mut registry = BufferRegistry::new();
    let a = registry.zeros_f32("a", 4);

    let mut builder = PipelineBuilder::new();
    builder.add_stage(Stage::new("lonely").consume_from(StageId(5), &[a]).task(silu(a, 4)));
    assert!(matches!(build(builder, &registry), Err(EngineError::Ordering { .. })));

    let mut builder = PipelineBuilder::new();
    builder.add_stage(
        Stage::new("loop")
            .consume_from(StageId(0), &[a])
            .persist_on_device(&[a])
            .task(silu(a, 4)),
    );
    assert!(matches!(build(builder, &registry), Err(EngineError::Ordering { .. })));
}

#[test]
fn conflicting_declarations_are_rejected() {
    let mut registry = BufferRegistry::new();
    let a = registry.zeros_f32("a", 4);
    let mut builder = PipelineBuilder::new();
    builder.add_stage(
        Stage::new("confused")
            .transfer_to_device(TransferPolicy::CopyOnce, &[a])
            .transfer_to_device(TransferPolicy::CopyEveryCall, &[a])
            .task(silu(a, 4)),
    );
    assert!(matches!(build(builder, &registry), Err(EngineError::Ordering { .. })));
}

#[test]
fn undeclared_buffer_is_rejected() {
    let mut registry = BufferRegistry::new();
    let a = registry.zeros_f32("a", 4);
    let b = registry.zeros_f32("b", 4);
    let mut builder = PipelineBuilder::new();
    builder.add_stage(
        Stage::new("half-declared")
            .transfer_to_device(TransferPolicy::CopyOnce, &[a])
            .task(add(a, b, 4)),
    );
    let err = build(builder, &registry).err().unwrap();
    assert!(matches!(err, EngineError::UndeclaredBuffer { ref buffer, .. } if buffer == "b"));
}

#[test]
fn kernel_larger_than_its_buffer_is_rejected() {
    let mut registry = BufferRegistry::new();
    let a = registry.zeros_f32("a", 4);
    let mut builder = PipelineBuilder::new();
    builder.add_stage(
        Stage::new("oversized")
            .transfer_to_device(TransferPolicy::CopyOnce, &[a])
            .task(silu(a, 16)),
    );
    let err = build(builder, &registry).err().unwrap();
    assert!(matches!(
        err,
        EngineError::Bounds {
            required: 16,
            actual: 4,
            ..
        }
    ));
}

#[test]
fn non_power_of_two_reduction_group_is_rejected() {
    let mut registry = BufferRegistry::new();
    let input = registry.zeros_f32("input", 12);
    let reduce = registry.zeros_f32("reduce", 4);
    let mut builder = PipelineBuilder::new();
    builder.add_stage(
        Stage::new("reduce")
            .transfer_to_device(TransferPolicy::CopyOnce, &[input])
            .scratch(&[reduce])
            .task(Kernel::new(
                KernelOp::ReduceSumSquares {
                    input,
                    reduce,
                    size: 12,
                },
                ThreadLayout::linear(12, 3),
            )),
    );
    let err = build(builder, &registry).err().unwrap();
    assert!(matches!(err, EngineError::Layout { .. }));
}

#[test]
fn ensure_resident_is_idempotent() {
    init_logging();
    let mut registry = BufferRegistry::new();
    let a = registry.register_f32("a", vec![0.5; 4]);
    let mut builder = PipelineBuilder::new();
    let s = builder.add_stage(
        Stage::new("act")
            .transfer_to_device(TransferPolicy::CopyEveryCall, &[a])
            .task(silu(a, 4)),
    );
    let other = registry.zeros_f32("other", 4);
    let mut pipeline = build(builder, &registry).unwrap();

    pipeline.ensure_resident(a, s, &registry).unwrap();
    pipeline.ensure_resident(a, s, &registry).unwrap();
    assert_eq!(pipeline.stats().uploads, 1);
    assert!(pipeline.is_resident(a));

    let err = pipeline.ensure_resident(other, s, &registry).unwrap_err();
    assert!(matches!(err, EngineError::UndeclaredBuffer { .. }));
}

#[test]
fn reading_a_released_buffer_fails() {
    let mut registry = BufferRegistry::new();
    let a = registry.register_f32("a", vec![0.5; 4]);
    let mut builder = PipelineBuilder::new();
    let s = builder.add_stage(
        Stage::new("act")
            .transfer_to_device(TransferPolicy::CopyEveryCall, &[a])
            .task(silu(a, 4)),
    );
    let mut pipeline = build(builder, &registry).unwrap();
    pipeline.execute(s, &mut registry).unwrap();
    let err = pipeline.read_to_host(a, &mut registry).unwrap_err();
    assert!(matches!(err, EngineError::NotResident { .. }));
}

#[test]
fn unknown_stage_is_reported() {
    let mut registry = BufferRegistry::new();
    let pipeline = build(PipelineBuilder::new(), &registry);
    let mut pipeline = pipeline.unwrap();
    assert!(matches!(
        pipeline.execute(StageId(0), &mut registry),
        Err(EngineError::UnknownStage(0))
    ));
}
