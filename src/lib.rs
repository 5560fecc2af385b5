//! Mandelbench renders the Mandelbrot set under nine execution strategies and compares them.
//!
//! A strategy is a combination of compute mode (whole frame or row by row), cancellability,
//! backend (managed kernel, native kernel, GPU compute) and execution context (the caller's
//! thread or a worker reached by message passing). All of them honor one callback contract:
//!
//! - Pick a [`Strategy`] and [`RenderParams`]
//! - Run a [`RenderJob`] through a [`StrategyExecutor`], locally or via a [`CrossThreadProxy`]
//! - Receive rows or a full frame through [`RenderCallbacks`], then exactly one finish or cancel
//!
//! [`BenchmarkController`] ties these together and filters deliveries from superseded jobs.
#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod foundation;

/// Benchmark run configuration.
pub mod config;
/// Strategy selection, job lifecycle and presentation.
pub mod controller;
/// One-shot GPU compute path.
pub mod gpu;
/// CPU escape-time kernels.
pub mod kernel;
/// Cross-thread binding to an executor.
pub mod proxy;
/// Frame storage.
pub mod render;
/// Strategy descriptors, jobs and the executor.
pub mod strategy;

pub use crate::foundation::core::{JobId, MAX_ITERATION_PRESETS, RenderParams, Viewport};
pub use crate::foundation::error::{MandelError, MandelResult};

pub use crate::config::BenchConfig;
pub use crate::controller::{
    BenchmarkController, CanvasPresenter, ControllerHandle, ControllerState, Delivery, Presenter,
};
pub use crate::gpu::{GpuAdapterState, GpuKernelAdapter, GpuParams};
pub use crate::kernel::{KernelContext, ManagedKernel, NativeKernel, Palette, PixelKernel};
pub use crate::proxy::client::{CrossThreadProxy, ProxyCallbacks};
pub use crate::render::frame::{FrameBuffer, FrameRGBA};
pub use crate::strategy::descriptor::{
    Backend, ComputeMode, ExecutionContext, Strategy, StrategyDescriptor,
};
pub use crate::strategy::executor::{
    ExecutorState, JobOutcome, RenderCallbacks, Scheduler, StrategyExecutor, ThreadYield,
};
pub use crate::strategy::job::{CancelToken, RenderJob};
