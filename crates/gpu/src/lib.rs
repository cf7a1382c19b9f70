//! `wgpu`-backed implementation of spec.md §4.6's two Coulomb kernels.
//!
//! `langmuir-core` only knows about the `CoulombBackend` trait; this crate
//! supplies the hardware-accelerated implementation so that `langmuir-core`
//! stays free of a GPU dependency (spec.md §9 "Design Notes: GPU optional
//! ... treat it as an optimization, not a semantic dependency"). Grounded on
//! the teacher's pattern of an optional accelerator crate the front end
//! chooses to wire in (`zkm-cuda`), with the actual on-device numeric
//! kernel idiom (`wgpu` + `pollster` + `bytemuck`, buffers built fresh per
//! dispatch, blocking readback via a oneshot channel) taken from
//! `other_examples/paris26-1D-FDTD` and
//! `other_examples/Momijiichigo-wgpu-hartree-fock-2d`.

use std::borrow::Cow;
use std::sync::mpsc;

use bytemuck::{Pod, Zeroable};
use thiserror::Error;
use wgpu::util::DeviceExt;

use langmuir_core::{CoulombBackend, Grid, GpuError, PrecomputedTables, Site};

const WORKGROUP_SIZE: u32 = 64;

/// Failures specific to standing up a `wgpu` device, mapped onto
/// `langmuir_core::GpuError`'s variants at the boundary.
#[derive(Debug, Error)]
enum InitError {
    #[error("no suitable GPU adapter found (requested index {0:?})")]
    NoAdapter(Option<usize>),
    #[error("device request failed: {0}")]
    DeviceRequest(String),
}

impl From<InitError> for GpuError {
    fn from(err: InitError) -> Self {
        match err {
            InitError::NoAdapter(_) => GpuError::NoAdapter,
            InitError::DeviceRequest(msg) => GpuError::DeviceRequest(msg),
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct GpuParams {
    grid_x: u32,
    grid_y: u32,
    grid_z: u32,
    cutoff: u32,
    kappa: f32,
    gaussian_enabled: u32,
    source_count: u32,
    query_count: u32,
}

/// A `wgpu` compute device plus the two pipelines of spec.md §4.6.
/// `query_count` in `GpuParams` doubles as `site_count` for kernel 1:
/// the two kernels share a `Params` layout and only differ in whether the
/// query list is the full grid or the packed current/future carrier sites.
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    bind_group_layout: wgpu::BindGroupLayout,
    batch_pipeline: wgpu::ComputePipeline,
    landscape_pipeline: wgpu::ComputePipeline,
    adapter_name: String,
}

impl WgpuBackend {
    /// Stand up a `wgpu` device. `gpu_index` selects a specific enumerated
    /// adapter (the CLI's `--gpu` option); `None` requests the
    /// highest-performance default adapter. spec.md §7 "GPU" error kind:
    /// platform/device missing surfaces as `GpuError::NoAdapter`/
    /// `DeviceRequest`, recoverable by the caller falling back to
    /// `CpuBackend` when `use.opencl=false`.
    pub fn new(gpu_index: Option<usize>) -> Result<Self, GpuError> {
        pollster::block_on(Self::new_async(gpu_index)).map_err(GpuError::from)
    }

    async fn new_async(gpu_index: Option<usize>) -> Result<Self, InitError> {
        let instance = wgpu::Instance::default();

        let adapter = match gpu_index {
            Some(idx) => {
                let adapters = instance.enumerate_adapters(wgpu::Backends::all());
                adapters.into_iter().nth(idx).ok_or(InitError::NoAdapter(Some(idx)))?
            }
            None => instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    ..Default::default()
                })
                .await
                .ok_or(InitError::NoAdapter(None))?,
        };

        let adapter_name = adapter.get_info().name;
        tracing::info!(adapter = %adapter_name, "selected GPU adapter for Coulomb offload");

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("langmuir coulomb device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| InitError::DeviceRequest(e.to_string()))?;

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("coulomb_bgl"),
            entries: &[
                uniform_entry(0),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, true),
                storage_entry(4, true),
                storage_entry(5, true),
                storage_entry(6, false),
            ],
        });
        let landscape_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("coulomb_landscape_bgl"),
                entries: &[
                    uniform_entry(0),
                    storage_entry(1, true),
                    storage_entry(2, true),
                    storage_entry(3, true),
                    storage_entry(4, true),
                    storage_entry(5, false),
                ],
            });

        let batch_pipeline = build_pipeline(
            &device,
            &bind_group_layout,
            "coulomb_batch",
            include_str!("shaders/coulomb_batch.wgsl"),
        );
        let landscape_pipeline = build_pipeline(
            &device,
            &landscape_bind_group_layout,
            "coulomb_landscape",
            include_str!("shaders/coulomb_landscape.wgsl"),
        );

        Ok(WgpuBackend {
            device,
            queue,
            bind_group_layout,
            batch_pipeline,
            landscape_pipeline,
            adapter_name,
        })
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    /// Kernel 1 of spec.md §4.6: accumulate `κ·Σ q_j·iR(site, pos_j)` over
    /// every grid site. Diagnostic-export use only; never called from the
    /// per-tick decide step.
    #[tracing::instrument(level = "debug", skip_all, fields(sites = grid.len()))]
    pub fn full_landscape(
        &self,
        grid: &Grid,
        tables: &PrecomputedTables,
        sources: &[(Site, i32)],
        gaussian: bool,
    ) -> Result<Vec<f64>, GpuError> {
        let site_count = grid.len();
        if site_count == 0 {
            return Ok(Vec::new());
        }
        let (cutoff, i_r, e_r) = tables.raw_distance_tables();
        let (gx, gy, gz) = grid.dims();
        let params = GpuParams {
            grid_x: gx,
            grid_y: gy,
            grid_z: gz,
            cutoff,
            kappa: tables.kappa as f32,
            gaussian_enabled: gaussian as u32,
            source_count: sources.len() as u32,
            query_count: site_count,
        };
        let out = self.dispatch(
            &self.landscape_pipeline,
            params,
            i_r,
            e_r,
            sources,
            None,
            site_count,
        )?;
        Ok(out)
    }

    /// Shared dispatch path for both kernels: build the buffers, run the
    /// compute pass, and read back `output_len` `f32`s as `f64`.
    /// `queries` is `None` for kernel 1 (the shader itself derives the
    /// query site from its invocation index) and `Some` for kernel 2.
    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        pipeline: &wgpu::ComputePipeline,
        params: GpuParams,
        i_r: &[f64],
        e_r: &[f64],
        sources: &[(Site, i32)],
        queries: Option<&[Site]>,
        output_len: u32,
    ) -> Result<Vec<f64>, GpuError> {
        let i_r_f32: Vec<f32> = i_r.iter().map(|&v| v as f32).collect();
        let e_r_f32: Vec<f32> = e_r.iter().map(|&v| v as f32).collect();
        let source_sites: Vec<u32> = sources.iter().map(|&(s, _)| s).collect();
        let source_charges: Vec<i32> = sources.iter().map(|&(_, q)| q).collect();
        // Every table/source array needs at least one element so wgpu
        // never sees a zero-size binding.
        let i_r_f32 = if i_r_f32.is_empty() { vec![0.0f32] } else { i_r_f32 };
        let e_r_f32 = if e_r_f32.is_empty() { vec![0.0f32] } else { e_r_f32 };
        let source_sites = if source_sites.is_empty() { vec![0u32] } else { source_sites };
        let source_charges = if source_charges.is_empty() { vec![0i32] } else { source_charges };

        let device = &self.device;
        let storage_ro = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST;
        let make_ro = |label: &str, data: &[u8]| {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: data,
                usage: storage_ro,
            })
        };

        let buf_i_r = make_ro("inverse_r_table", bytemuck::cast_slice(&i_r_f32));
        let buf_e_r = make_ro("screen_table", bytemuck::cast_slice(&e_r_f32));
        let buf_sites = make_ro("source_sites", bytemuck::cast_slice(&source_sites));
        let buf_charges = make_ro("source_charges", bytemuck::cast_slice(&source_charges));
        let buf_params = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let output_bytes = (output_len.max(1) as u64) * 4;
        let buf_output = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("output"),
            size: output_bytes,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let buf_readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: output_bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let bind_group = if let Some(queries) = queries {
            let query_sites: Vec<u32> = queries.to_vec();
            let buf_queries = make_ro("queries", bytemuck::cast_slice(&query_sites));
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("coulomb_bg"),
                layout: &self.bind_group_layout,
                entries: &[
                    bg_entry(0, buf_params.as_entire_binding()),
                    bg_entry(1, buf_i_r.as_entire_binding()),
                    bg_entry(2, buf_e_r.as_entire_binding()),
                    bg_entry(3, buf_sites.as_entire_binding()),
                    bg_entry(4, buf_charges.as_entire_binding()),
                    bg_entry(5, buf_queries.as_entire_binding()),
                    bg_entry(6, buf_output.as_entire_binding()),
                ],
            })
        } else {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("coulomb_landscape_bg"),
                layout: &self.landscape_layout(),
                entries: &[
                    bg_entry(0, buf_params.as_entire_binding()),
                    bg_entry(1, buf_i_r.as_entire_binding()),
                    bg_entry(2, buf_e_r.as_entire_binding()),
                    bg_entry(3, buf_sites.as_entire_binding()),
                    bg_entry(4, buf_charges.as_entire_binding()),
                    bg_entry(5, buf_output.as_entire_binding()),
                ],
            })
        };

        let mut encoder =
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("coulomb_pass") });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("coulomb_compute"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            let workgroups = output_len.div_ceil(WORKGROUP_SIZE).max(1);
            pass.dispatch_workgroups(workgroups, 1, 1);
        }
        encoder.copy_buffer_to_buffer(&buf_output, 0, &buf_readback, 0, output_bytes);
        self.queue.submit(Some(encoder.finish()));

        let slice = buf_readback.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| GpuError::MapFailure("readback channel closed".to_string()))?
            .map_err(|e| GpuError::MapFailure(e.to_string()))?;

        let data = slice.get_mapped_range();
        let values: Vec<f32> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        buf_readback.unmap();

        Ok(values.into_iter().take(output_len as usize).map(|v| v as f64).collect())
    }

    /// `dispatch`'s landscape branch needs the smaller bind-group layout;
    /// rebuilding it per call would be wasteful, so kernel 1's layout is
    /// derived from its own pipeline instead of stored twice.
    fn landscape_layout(&self) -> wgpu::BindGroupLayout {
        self.landscape_pipeline.get_bind_group_layout(0)
    }
}

impl CoulombBackend for WgpuBackend {
    /// Kernel 2 of spec.md §4.6: the per-carrier batched Coulomb sum
    /// consumed by `World::decide_future_phase` in place of the CPU path.
    #[tracing::instrument(level = "debug", skip_all, fields(carriers = current.len()))]
    fn coulomb_batch(
        &self,
        grid: &Grid,
        tables: &PrecomputedTables,
        current: &[Site],
        future: &[Site],
        sources: &[(Site, i32)],
        gaussian: bool,
    ) -> Result<Vec<f64>, GpuError> {
        if current.is_empty() {
            return Ok(Vec::new());
        }
        let (cutoff, i_r, e_r) = tables.raw_distance_tables();
        let (gx, gy, gz) = grid.dims();
        let mut queries = Vec::with_capacity(current.len() + future.len());
        queries.extend_from_slice(current);
        queries.extend_from_slice(future);

        let params = GpuParams {
            grid_x: gx,
            grid_y: gy,
            grid_z: gz,
            cutoff,
            kappa: tables.kappa as f32,
            gaussian_enabled: gaussian as u32,
            source_count: sources.len() as u32,
            query_count: queries.len() as u32,
        };

        self.dispatch(&self.batch_pipeline, params, i_r, e_r, sources, Some(&queries), queries.len() as u32)
    }
}

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

fn bg_entry(binding: u32, resource: wgpu::BindingResource<'_>) -> wgpu::BindGroupEntry<'_> {
    wgpu::BindGroupEntry { binding, resource }
}

fn build_pipeline(
    device: &wgpu::Device,
    layout: &wgpu::BindGroupLayout,
    label: &str,
    source: &str,
) -> wgpu::ComputePipeline {
    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source)),
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[layout],
        push_constant_ranges: &[],
    });
    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        module: &shader,
        entry_point: Some("main"),
        compilation_options: Default::default(),
        cache: None,
    })
}

#[cfg(test)]
mod tests {
    // `WgpuBackend` requires a real adapter, unavailable in headless CI,
    // spec.md §8 property 5 (GPU/CPU agreement) is exercised as a manual
    // integration check rather than a unit test here; `CpuBackend`'s own
    // tests in `langmuir-core` cover the reference values this backend
    // must agree with.
}
