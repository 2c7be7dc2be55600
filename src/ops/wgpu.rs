//! GPU-accelerated operator kernels using WGPU.
//!
//! This module implements the gather-style forward passes (flex convolution
//! and neighborhood max-pool) as WGSL compute shaders. It handles GPU context
//! initialization, shader precompilation (via `lazy_static`), and compute
//! dispatch.
//!
//! All shaders are compiled and cached once at runtime. Tensor data is
//! already `f32`, so it uploads without conversion; argmax indices come back
//! as `u32`.
//!
//! Backward closures evaluate on the CPU: gradient accumulation scatters into
//! shared tensors, and WGSL has no floating-point atomics to make that
//! race-free on the GPU. The same limitation keeps the transposed
//! convolution's forward pass off this backend entirely.
//!
//! Every public function returns `Option`; `None` tells the dispatch layer
//! to fall back to the CPU kernel.

use crate::ops::dispatch::{ConvBack, PoolBack};
use crate::tensors::{Ten32, Tensor, WithGrad};
use briny::prelude::*;
use wgpu::util::DeviceExt;

const FLEX_CONV: &str = include_str!("shaders/flex_conv.wgsl");
const FLEX_POOL: &str = include_str!("shaders/flex_pool.wgsl");

/// Basic wrapper for common GPU errors.
#[derive(Debug)]
pub enum GpuError {
    /// An error in requesting the adapter.
    Adapter(wgpu::RequestAdapterError),
    /// An error in requesting the GPU (device).
    Device(wgpu::RequestDeviceError),
}

impl std::fmt::Display for GpuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuError::Adapter(e) => write!(f, "Adapter error: {e}"),
            GpuError::Device(e) => write!(f, "Device error: {e}"),
        }
    }
}

/// A GPU-side failure: initialization, shader validation, or readback.
#[derive(Debug)]
pub enum GpuFailure {
    /// An error resulting from the GPU.
    Gpu(GpuError),
    /// An error resulting from validating shader source.
    Validation(ValidationError),
    /// A malformed readback buffer.
    Readback(&'static str),
}

impl From<GpuError> for GpuFailure {
    fn from(err: GpuError) -> Self {
        Self::Gpu(err)
    }
}

impl From<ValidationError> for GpuFailure {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err)
    }
}

impl std::fmt::Display for GpuFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuFailure::Gpu(err) => write!(f, "GPU failure: {err}"),
            GpuFailure::Validation(_) => write!(f, "GPU failure: shader validation"),
            GpuFailure::Readback(msg) => write!(f, "GPU failure: {msg}"),
        }
    }
}

impl std::error::Error for GpuFailure {}

/// Holds the WGPU device and queue used for executing compute pipelines.
///
/// Initialized once globally and reused for all operations via `lazy_static`.
pub struct GpuContext {
    /// The actual GPU device.
    pub device: wgpu::Device,
    /// The submission queue of the device.
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Initializes a new GPU context, selecting the default adapter and
    /// creating a device + queue.
    ///
    /// # Errors
    /// Returns [`GpuError`] if adapter or device acquisition fails.
    pub fn new() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::default();
        let adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
                .map_err(GpuError::Adapter)?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: None,
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(GpuError::Device)?;

        Ok(Self { device, queue })
    }
}

/// Secure wrapper for WGSL source code extracted from files.
pub struct WgslSource<'a>(pub &'a str);

impl<'a> Validate for WgslSource<'a> {
    fn validate(&self) -> Result<(), ValidationError> {
        let src = self.0;

        if src.len() > 65536 {
            return Err(ValidationError);
        }

        if !src.contains("fn main") {
            return Err(ValidationError);
        }

        // source inclusion is disallowed
        if src.contains("import") || src.contains("#include") {
            return Err(ValidationError);
        }

        Ok(())
    }
}

/// Validates a WGSL shader and compiles it into a labeled module.
pub fn load_shader(
    device: &wgpu::Device,
    label: &str,
    source: &str,
) -> Result<wgpu::ShaderModule, GpuFailure> {
    WgslSource(source).validate()?;

    Ok(device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    }))
}

/// Builds a uniform-buffer bind group layout entry.
fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Builds a storage-buffer bind group layout entry.
fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn make_pipeline(
    device: &wgpu::Device,
    label: &str,
    module: &wgpu::ShaderModule,
    layout: &wgpu::BindGroupLayout,
) -> wgpu::ComputePipeline {
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[layout],
        push_constant_ranges: &[],
    });
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        module,
        entry_point: Some("main"),
        cache: None,
        compilation_options: wgpu::PipelineCompilationOptions::default(),
    })
}

lazy_static::lazy_static! {
    static ref GPU_CONTEXT: GpuContext =
        GpuContext::new().expect("Failed to initialize GPU context");

    static ref FLEX_CONV_SHADER: wgpu::ShaderModule = load_shader(
        &GPU_CONTEXT.device,
        "flex_conv",
        FLEX_CONV
    ).expect("flex_conv shader failed validation or compilation");
    static ref FLEX_CONV_BIND_GROUP_LAYOUT: wgpu::BindGroupLayout = {
        GPU_CONTEXT.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("flex_conv_bgl"),
            entries: &[
                uniform_entry(0),
                storage_entry(1, true),  // features
                storage_entry(2, true),  // theta
                storage_entry(3, true),  // bias
                storage_entry(4, true),  // neighborhood
                storage_entry(5, true),  // positions
                storage_entry(6, false), // output
            ],
        })
    };
    static ref FLEX_CONV_PIPELINE: wgpu::ComputePipeline = make_pipeline(
        &GPU_CONTEXT.device,
        "flex_conv_pipeline",
        &FLEX_CONV_SHADER,
        &FLEX_CONV_BIND_GROUP_LAYOUT,
    );

    static ref FLEX_POOL_SHADER: wgpu::ShaderModule = load_shader(
        &GPU_CONTEXT.device,
        "flex_pool",
        FLEX_POOL
    ).expect("flex_pool shader failed validation or compilation");
    static ref FLEX_POOL_BIND_GROUP_LAYOUT: wgpu::BindGroupLayout = {
        GPU_CONTEXT.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("flex_pool_bgl"),
            entries: &[
                uniform_entry(0),
                storage_entry(1, true),  // features
                storage_entry(2, true),  // neighborhood
                storage_entry(3, false), // output
                storage_entry(4, false), // argmax
            ],
        })
    };
    static ref FLEX_POOL_PIPELINE: wgpu::ComputePipeline = make_pipeline(
        &GPU_CONTEXT.device,
        "flex_pool_pipeline",
        &FLEX_POOL_SHADER,
        &FLEX_POOL_BIND_GROUP_LAYOUT,
    );
}

fn as_bytes<T: Copy>(data: &[T]) -> &[u8] {
    let len = std::mem::size_of_val(data);
    unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, len) }
}

fn bytes_to_f32_slice(data: &[u8]) -> Result<&[f32], GpuFailure> {
    use std::mem::{align_of, size_of};

    if data.as_ptr() as usize % align_of::<f32>() != 0 {
        return Err(GpuFailure::Readback("unaligned buffer"));
    }
    if data.len() % size_of::<f32>() != 0 {
        return Err(GpuFailure::Readback("buffer length is not a multiple of f32"));
    }

    let len = data.len() / size_of::<f32>();
    unsafe { Ok(std::slice::from_raw_parts(data.as_ptr() as *const f32, len)) }
}

fn bytes_to_u32_slice(data: &[u8]) -> Result<&[u32], GpuFailure> {
    use std::mem::{align_of, size_of};

    if data.as_ptr() as usize % align_of::<u32>() != 0 {
        return Err(GpuFailure::Readback("unaligned buffer"));
    }
    if data.len() % size_of::<u32>() != 0 {
        return Err(GpuFailure::Readback("buffer length is not a multiple of u32"));
    }

    let len = data.len() / size_of::<u32>();
    unsafe { Ok(std::slice::from_raw_parts(data.as_ptr() as *const u32, len)) }
}

fn storage_input(device: &wgpu::Device, label: &str, contents: &[u8]) -> wgpu::Buffer {
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents,
        usage: wgpu::BufferUsages::STORAGE,
    })
}

/// Reads a storage buffer back into host memory through a staging copy.
fn read_back(
    device: &wgpu::Device,
    encoder: &mut wgpu::CommandEncoder,
    source: &wgpu::Buffer,
    size: u64,
) -> wgpu::Buffer {
    let staging = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("staging"),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    encoder.copy_buffer_to_buffer(source, 0, &staging, 0, size);
    staging
}

fn map_staging(device: &wgpu::Device, staging: &wgpu::Buffer) -> Result<(), GpuFailure> {
    let slice = staging.slice(..);
    slice.map_async(wgpu::MapMode::Read, |result| {
        assert!(result.is_ok());
    });
    device
        .poll(wgpu::PollType::Wait)
        .map_err(|_| GpuFailure::Readback("device poll failed"))?;
    Ok(())
}

/// Runs the flex convolution forward pass on the GPU.
///
/// The backward closure evaluates on the CPU; see the module docs.
///
/// # Returns
/// - `Some((output, backward_fn))` on success
/// - `None` if GPU execution fails (dispatch falls back to the CPU kernel)
pub fn wgpu_flex_conv(
    features: &WithGrad<Ten32>,
    theta: &WithGrad<Ten32>,
    bias: &WithGrad<Ten32>,
    neighborhood: &Tensor<u32>,
    positions: &Ten32,
) -> Option<(Ten32, Box<ConvBack>)> {
    let b = neighborhood.shape[0];
    let n = neighborhood.shape[2];
    let dout = theta.value.shape[2];

    let mut out_data = vec![0.0f32; b * dout * n];
    let result = pollster::block_on(run_flex_conv_shader(
        &features.value,
        &theta.value,
        &bias.value,
        neighborhood,
        positions,
        &mut out_data,
    ));
    if result.is_err() {
        return None;
    }

    let out = Tensor::new(vec![b, dout, n], out_data);

    let feat_val = features.value.clone();
    let theta_val = theta.value.clone();
    let bias_val = bias.value.clone();
    let neigh_val = neighborhood.clone();
    let pos_val = positions.clone();

    let back: Box<ConvBack> = Box::new(move |topdiff: &Ten32| {
        crate::ops::cpu::flex_conv_grads(
            &feat_val, &theta_val, &bias_val, &neigh_val, &pos_val, topdiff,
        )
    });

    Some((out, back))
}

async fn run_flex_conv_shader(
    features: &Ten32,
    theta: &Ten32,
    bias: &Ten32,
    neighborhood: &Tensor<u32>,
    positions: &Ten32,
    out: &mut [f32],
) -> Result<(), GpuFailure> {
    let device = &GPU_CONTEXT.device;
    let queue = &GPU_CONTEXT.queue;

    let b = neighborhood.shape[0] as u32;
    let k = neighborhood.shape[1] as u32;
    let n = neighborhood.shape[2] as u32;
    let din = theta.shape[1] as u32;
    let dout = theta.shape[2] as u32;
    let dp = theta.shape[0] as u32;

    let dims = [b, k, n, din, dout, dp, 0u32, 0u32];
    let dims_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("dims"),
        contents: as_bytes(&dims),
        usage: wgpu::BufferUsages::UNIFORM,
    });

    let features_buffer = storage_input(device, "features", as_bytes(&features.data));
    let theta_buffer = storage_input(device, "theta", as_bytes(&theta.data));
    let bias_buffer = storage_input(device, "bias", as_bytes(&bias.data));
    let neigh_buffer = storage_input(device, "neighborhood", as_bytes(&neighborhood.data));
    let pos_buffer = storage_input(device, "positions", as_bytes(&positions.data));

    let out_size = (out.len() * 4) as u64;
    let out_buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("output"),
        size: out_size,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    });

    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("flex_conv_bind_group"),
        layout: &FLEX_CONV_BIND_GROUP_LAYOUT,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: dims_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: features_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: theta_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 3,
                resource: bias_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 4,
                resource: neigh_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 5,
                resource: pos_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 6,
                resource: out_buffer.as_entire_binding(),
            },
        ],
    });

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("flex_conv_encoder"),
    });

    {
        let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("flex_conv_pass"),
            timestamp_writes: None,
        });
        compute_pass.set_pipeline(&FLEX_CONV_PIPELINE);
        compute_pass.set_bind_group(0, &bind_group, &[]);
        compute_pass.dispatch_workgroups(n.div_ceil(8), dout.div_ceil(8), b);
    }

    let staging = read_back(device, &mut encoder, &out_buffer, out_size);
    queue.submit(Some(encoder.finish()));

    map_staging(device, &staging)?;
    let data = staging.slice(..).get_mapped_range();
    out.copy_from_slice(bytes_to_f32_slice(&data)?);
    drop(data);
    staging.unmap();

    Ok(())
}

/// Runs the neighborhood max-pool forward pass on the GPU.
///
/// # Returns
/// - `Some((output, argmax, backward_fn))` on success
/// - `None` if GPU execution fails (dispatch falls back to the CPU kernel)
pub fn wgpu_flex_pool(
    features: &WithGrad<Ten32>,
    neighborhood: &Tensor<u32>,
) -> Option<(Ten32, Tensor<u32>, Box<PoolBack>)> {
    let b = neighborhood.shape[0];
    let n = neighborhood.shape[2];
    let din = features.value.shape[1];

    let mut out_data = vec![0.0f32; b * din * n];
    let mut arg_data = vec![0u32; b * din * n];
    let result = pollster::block_on(run_flex_pool_shader(
        &features.value,
        neighborhood,
        &mut out_data,
        &mut arg_data,
    ));
    if result.is_err() {
        return None;
    }

    let out = Tensor::new(vec![b, din, n], out_data);
    let argmax = Tensor::new(vec![b, din, n], arg_data);

    let feat_shape = features.value.shape.clone();
    let arg_val = argmax.clone();

    let back: Box<PoolBack> = Box::new(move |topdiff: &Ten32| {
        crate::ops::cpu::flex_pool_grads(&feat_shape, &arg_val, topdiff)
    });

    Some((out, argmax, back))
}

async fn run_flex_pool_shader(
    features: &Ten32,
    neighborhood: &Tensor<u32>,
    out: &mut [f32],
    argmax: &mut [u32],
) -> Result<(), GpuFailure> {
    let device = &GPU_CONTEXT.device;
    let queue = &GPU_CONTEXT.queue;

    let b = neighborhood.shape[0] as u32;
    let k = neighborhood.shape[1] as u32;
    let n = neighborhood.shape[2] as u32;
    let din = features.shape[1] as u32;

    let dims = [b, k, n, din, 0u32, 0u32, 0u32, 0u32];
    let dims_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("dims"),
        contents: as_bytes(&dims),
        usage: wgpu::BufferUsages::UNIFORM,
    });

    let features_buffer = storage_input(device, "features", as_bytes(&features.data));
    let neigh_buffer = storage_input(device, "neighborhood", as_bytes(&neighborhood.data));

    let out_size = (out.len() * 4) as u64;
    let out_buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("output"),
        size: out_size,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    });
    let arg_buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("argmax"),
        size: out_size,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    });

    let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("flex_pool_bind_group"),
        layout: &FLEX_POOL_BIND_GROUP_LAYOUT,
        entries: &[
            wgpu::BindGroupEntry {
                binding: 0,
                resource: dims_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: features_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: neigh_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 3,
                resource: out_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 4,
                resource: arg_buffer.as_entire_binding(),
            },
        ],
    });

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("flex_pool_encoder"),
    });

    {
        let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("flex_pool_pass"),
            timestamp_writes: None,
        });
        compute_pass.set_pipeline(&FLEX_POOL_PIPELINE);
        compute_pass.set_bind_group(0, &bind_group, &[]);
        compute_pass.dispatch_workgroups(n.div_ceil(8), din.div_ceil(8), b);
    }

    let out_staging = read_back(device, &mut encoder, &out_buffer, out_size);
    let arg_staging = read_back(device, &mut encoder, &arg_buffer, out_size);
    queue.submit(Some(encoder.finish()));

    map_staging(device, &out_staging)?;
    {
        let data = out_staging.slice(..).get_mapped_range();
        out.copy_from_slice(bytes_to_f32_slice(&data)?);
    }
    out_staging.unmap();

    map_staging(device, &arg_staging)?;
    {
        let data = arg_staging.slice(..).get_mapped_range();
        argmax.copy_from_slice(bytes_to_u32_slice(&data)?);
    }
    arg_staging.unmap();

    Ok(())
}
