//! Frame pacing: fences and binary semaphores per frame in flight.
//!
//! Frame `N` records into slot `N mod FRAMES_IN_FLIGHT` after waiting on
//! that slot's fence; the double-buffered resource guarantee follows from
//! this wait, not from any per-resource locking.

use ash::vk;

use kiln_core::{RenderError, FRAMES_IN_FLIGHT};
use kiln_resource::Device;

use crate::target::Target;

/// Per-frame-in-flight synchronization primitives.
pub struct FramePacer {
    in_flight: Vec<vk::Fence>,
    image_available: Vec<vk::Semaphore>,
    render_finished: Vec<vk::Semaphore>,
    compute_finished: Vec<vk::Semaphore>,
    frame: u64,
}

impl std::fmt::Debug for FramePacer {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("FramePacer")
            .field("frame", &self.frame)
            .finish()
    }
}

impl FramePacer {
    /// Create the fences (signalled) and semaphores for every slot.
    pub fn new(device: &Device) -> Result<Self, RenderError> {
        unsafe {
            let mut in_flight = Vec::with_capacity(FRAMES_IN_FLIGHT);
            let mut image_available = Vec::with_capacity(FRAMES_IN_FLIGHT);
            let mut render_finished = Vec::with_capacity(FRAMES_IN_FLIGHT);
            let mut compute_finished = Vec::with_capacity(FRAMES_IN_FLIGHT);
            for _ in 0..FRAMES_IN_FLIGHT {
                in_flight.push(
                    device
                        .raw()
                        .create_fence(
                            &vk::FenceCreateInfo::builder()
                                .flags(vk::FenceCreateFlags::SIGNALED),
                            None,
                        )
                        .map_err(RenderError::from)?,
                );
                image_available.push(
                    device
                        .raw()
                        .create_semaphore(&vk::SemaphoreCreateInfo::builder(), None)
                        .map_err(RenderError::from)?,
                );
                render_finished.push(
                    device
                        .raw()
                        .create_semaphore(&vk::SemaphoreCreateInfo::builder(), None)
                        .map_err(RenderError::from)?,
                );
                compute_finished.push(
                    device
                        .raw()
                        .create_semaphore(&vk::SemaphoreCreateInfo::builder(), None)
                        .map_err(RenderError::from)?,
                );
            }
            Ok(FramePacer {
                in_flight,
                image_available,
                render_finished,
                compute_finished,
                frame: 0,
            })
        }
    }

    /// Monotonic frame number.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Slot of the current frame.
    pub fn frame_index(&self) -> usize {
        (self.frame % FRAMES_IN_FLIGHT as u64) as usize
    }

    /// Block until the current slot's previous submission completed, then
    /// reset its fence. This is the only CPU-side suspension point of the
    /// steady state.
    pub fn wait_current(&self, device: &Device) -> Result<(), RenderError> {
        let fence = self.in_flight[self.frame_index()];
        unsafe {
            device
                .raw()
                .wait_for_fences(&[fence], true, u64::MAX)
                .map_err(RenderError::from)?;
            device
                .raw()
                .reset_fences(&[fence])
                .map_err(RenderError::from)?;
        }
        Ok(())
    }

    /// Acquire the next swapchain image for this frame.
    pub fn acquire(&self, target: &Target) -> Result<(u32, bool), RenderError> {
        target.acquire(self.image_available[self.frame_index()])
    }

    /// Submit the frame's command buffers and present.
    ///
    /// When `compute` is given it is submitted first on the compute queue,
    /// signalling a semaphore the graphics submit waits on at the stages
    /// that consume compute output. The graphics submit waits the acquire
    /// semaphore at color-attachment output, signals `render_finished` and
    /// the slot's fence; present waits `render_finished`.
    pub fn submit_and_present(
        &mut self,
        device: &Device,
        target: &Target,
        image_index: u32,
        graphics: vk::CommandBuffer,
        compute: Option<vk::CommandBuffer>,
    ) -> Result<bool, RenderError> {
        let slot = self.frame_index();
        unsafe {
            if let Some(compute_cmd) = compute {
                let cmds = [compute_cmd];
                let signal = [self.compute_finished[slot]];
                let submit = vk::SubmitInfo::builder()
                    .command_buffers(&cmds)
                    .signal_semaphores(&signal)
                    .build();
                device
                    .raw()
                    .queue_submit(device.compute().queue, &[submit], vk::Fence::null())
                    .map_err(RenderError::from)?;
            }

            let cmds = [graphics];
            let signal = [self.render_finished[slot]];
            let mut waits = vec![self.image_available[slot]];
            let mut stages = vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
            if compute.is_some() {
                waits.push(self.compute_finished[slot]);
                stages.push(
                    vk::PipelineStageFlags::DRAW_INDIRECT | vk::PipelineStageFlags::VERTEX_SHADER,
                );
            }
            let submit = vk::SubmitInfo::builder()
                .wait_semaphores(&waits)
                .wait_dst_stage_mask(&stages)
                .command_buffers(&cmds)
                .signal_semaphores(&signal)
                .build();
            device
                .raw()
                .queue_submit(device.graphics().queue, &[submit], self.in_flight[slot])
                .map_err(RenderError::from)?;
        }

        let suboptimal =
            target.present(device.graphics().queue, image_index, self.render_finished[slot])?;

        self.frame += 1;
        Ok(suboptimal)
    }

    /// Destroy fences and semaphores. The device must be idle.
    pub fn dispose(self, device: &Device) {
        unsafe {
            for fence in self.in_flight {
                device.raw().destroy_fence(fence, None);
            }
            for semaphore in self
                .image_available
                .into_iter()
                .chain(self.render_finished)
                .chain(self.compute_finished)
            {
                device.raw().destroy_semaphore(semaphore, None);
            }
        }
    }
}
