//! Linked programs and launches.

use std::fmt;
use std::mem;

use bytemuck::Pod;
use photon_gpu::{BufferView, Stream};

use crate::backend::{PipelineCompileOptions, PipelineHandle, PipelineLinkOptions};
use crate::context::{DeviceContext, LogLevel};
use crate::error::{Result, RtError, Status};
use crate::module::Program;
use crate::sbt::ShaderBindingTable;

/// Programs linked into a launchable configuration.
///
/// A pipeline holds no per-launch state; any number of launches may be
/// enqueued against it on any streams of its device.
pub struct Pipeline {
    context: DeviceContext,
    handle: PipelineHandle,
    /// Keeps the program groups alive while linked.
    programs: Vec<Program>,
    compile_options: PipelineCompileOptions,
    link_options: PipelineLinkOptions,
}

impl Pipeline {
    pub(crate) fn new(
        context: &DeviceContext,
        programs: &[Program],
        compile_options: &PipelineCompileOptions,
        link_options: &PipelineLinkOptions,
    ) -> Result<Self> {
        Self::link(context, programs, compile_options, link_options).map_err(|e| {
            context.log(LogLevel::Error, &format!("Failed to create pipeline: {e}"));
            e.context(context.device_id(), "create_pipeline")
        })
    }

    fn link(
        context: &DeviceContext,
        programs: &[Program],
        compile_options: &PipelineCompileOptions,
        link_options: &PipelineLinkOptions,
    ) -> Result<Self> {
        if programs.is_empty() {
            return Err(RtError::invalid_value("pipeline has no programs"));
        }
        if let Some(foreign) = programs.iter().find(|p| !p.context().same_as(context)) {
            return Err(RtError::invalid_value(format!(
                "program '{}' belongs to another context",
                foreign.name()
            )));
        }
        let max_depth = context.properties().max_trace_depth;
        if link_options.max_trace_depth > max_depth {
            return Err(RtError::invalid_value(format!(
                "trace depth {} exceeds the device limit of {max_depth}",
                link_options.max_trace_depth
            )));
        }

        let groups: Vec<_> = programs.iter().map(Program::group).collect();
        let handle = context
            .backend()
            .pipeline_create(&groups, compile_options, link_options)
            .map_err(|e| {
                if e.status() == Status::Internal {
                    e.with_status(Status::PipelineCreationFailed)
                } else {
                    e
                }
            })?;
        tracing::info!(
            "Created pipeline with {} programs on device {}",
            programs.len(),
            context.device_id()
        );
        Ok(Self {
            context: context.clone(),
            handle,
            programs: programs.to_vec(),
            compile_options: compile_options.clone(),
            link_options: link_options.clone(),
        })
    }

    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    /// Linked programs, in link order.
    pub fn programs(&self) -> &[Program] {
        &self.programs
    }

    pub fn compile_options(&self) -> &PipelineCompileOptions {
        &self.compile_options
    }

    pub fn link_options(&self) -> &PipelineLinkOptions {
        &self.link_options
    }

    /// Enqueue a `width x height x depth` launch.
    ///
    /// `params` must hold one `P` in device memory, fully written (in
    /// stream order) before the launch. The binding table is passed
    /// through unchecked unless the context validates.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn launch<P: Pod>(
        &self,
        stream: &dyn Stream,
        params: BufferView<P>,
        sbt: &ShaderBindingTable,
        width: usize,
        height: usize,
        depth: usize,
    ) -> Result<()> {
        self.launch_inner(stream, params, sbt, [width, height, depth])
            .map_err(|e| {
                self.context
                    .log(LogLevel::Error, &format!("Launch failed: {e}"));
                e.context(self.context.device_id(), "launch")
            })
    }

    fn launch_inner<P: Pod>(
        &self,
        stream: &dyn Stream,
        params: BufferView<P>,
        sbt: &ShaderBindingTable,
        dims: [usize; 3],
    ) -> Result<()> {
        let [width, height, depth] = dims.map(u32::try_from);
        let (Ok(width), Ok(height), Ok(depth)) = (width, height, depth) else {
            return Err(RtError::invalid_value(format!(
                "launch of {dims:?} exceeds 32-bit dimensions"
            )));
        };
        if stream.device_id() != self.context.device_id() {
            return Err(RtError::invalid_value(format!(
                "stream of device {} used with a pipeline of device {}",
                stream.device_id(),
                self.context.device_id()
            )));
        }
        if self.context.options().validation {
            validate_launch(params, sbt)?;
        }
        if width == 0 || height == 0 || depth == 0 {
            return Ok(());
        }
        self.context
            .backend()
            .launch(
                self.handle,
                stream,
                params.ptr(),
                mem::size_of::<P>() as u64,
                sbt,
                width,
                height,
                depth,
            )
            .map_err(|e| {
                if e.status() == Status::Internal {
                    e.with_status(Status::LaunchFailed)
                } else {
                    e
                }
            })
    }
}

fn validate_launch<P>(params: BufferView<P>, sbt: &ShaderBindingTable) -> Result<()> {
    if mem::size_of::<P>() > 0 && (params.ptr().is_null() || params.is_empty()) {
        return Err(RtError::invalid_value("launch parameters are not in device memory"));
    }
    if sbt.raygen_record.is_null() {
        return Err(RtError::invalid_value("binding table has no raygen record"));
    }
    let regions = [
        ("miss", sbt.miss_record_base, sbt.miss_record_count),
        ("hit group", sbt.hitgroup_record_base, sbt.hitgroup_record_count),
        ("callable", sbt.callables_record_base, sbt.callables_record_count),
    ];
    for (name, base, count) in regions {
        if count > 0 && base.is_null() {
            return Err(RtError::invalid_value(format!(
                "binding table declares {count} {name} records without a base address"
            )));
        }
    }
    Ok(())
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("handle", &self.handle)
            .field("programs", &self.programs.len())
            .field("max_trace_depth", &self.link_options.max_trace_depth)
            .finish()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.context.backend().pipeline_destroy(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ModuleCompileOptions, ModuleSource};
    use crate::context::ContextOptions;
    use crate::host::HostProgramImage;
    use photon_core::DevicePtr;
    use photon_gpu::HostDeviceBuilder;

    fn context(validation: bool) -> DeviceContext {
        let device = HostDeviceBuilder::new().build().unwrap();
        DeviceContext::with_options(device.as_ref(), ContextOptions::new().validation(validation))
            .unwrap()
    }

    fn raygen(context: &DeviceContext) -> Program {
        let image = HostProgramImage::builder("pipeline")
            .raygen("__raygen__", |_| {})
            .build();
        context
            .create_module(
                ModuleSource::Host(image),
                &ModuleCompileOptions::default(),
                &PipelineCompileOptions::default(),
            )
            .unwrap()
            .at("__raygen__")
            .unwrap()
    }

    #[test]
    fn foreign_programs_are_rejected() {
        let a = context(false);
        let b = context(false);
        let program = raygen(&b);
        let error = a
            .create_pipeline(
                &[program],
                &PipelineCompileOptions::default(),
                &PipelineLinkOptions::default(),
            )
            .unwrap_err();
        assert_eq!(error.status(), Status::InvalidValue);
        assert_eq!(
            error.error_context().map(|c| c.operation),
            Some("create_pipeline")
        );
    }

    #[test]
    fn empty_pipeline_is_rejected() {
        let context = context(false);
        assert!(context
            .create_pipeline(
                &[],
                &PipelineCompileOptions::default(),
                &PipelineLinkOptions::default()
            )
            .is_err());
    }

    #[test]
    fn validation_requires_raygen_record() {
        let context = context(true);
        let pipeline = context
            .create_pipeline(
                &[raygen(&context)],
                &PipelineCompileOptions::default(),
                &PipelineLinkOptions::default(),
            )
            .unwrap();
        let params = BufferView::<u32>::from_raw_parts(DevicePtr(0x1000), 1);
        let sbt = ShaderBindingTable::default();
        let device = HostDeviceBuilder::new().build().unwrap();
        let error = pipeline
            .launch(device.host_stream(), params, &sbt, 1, 1, 1)
            .unwrap_err();
        assert_eq!(error.status(), Status::InvalidValue);
    }

    #[test]
    fn oversized_launch_is_rejected() {
        let context = context(false);
        let pipeline = context
            .create_pipeline(
                &[raygen(&context)],
                &PipelineCompileOptions::default(),
                &PipelineLinkOptions::default(),
            )
            .unwrap();
        let device = HostDeviceBuilder::new().build().unwrap();
        let error = pipeline
            .launch(
                device.host_stream(),
                BufferView::<u32>::default(),
                &ShaderBindingTable::default(),
                usize::MAX,
                1,
                1,
            )
            .unwrap_err();
        assert_eq!(error.status(), Status::InvalidValue);
    }
}
