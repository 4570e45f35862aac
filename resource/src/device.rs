//! Instance and device ownership.
//!
//! The device wrapper owns the Vulkan instance, the logical device, the
//! graphics and compute queues and a pool for one-shot transfer commands.
//! It is passed explicitly everywhere; there are no globals.

use std::ffi::CStr;

use ash::vk;
use raw_window_handle::RawDisplayHandle;

use kiln_core::RenderError;

/// The queues the renderer submits to.
#[derive(Clone, Copy, Debug)]
pub struct QueueInfo {
    /// Queue family index.
    pub family: u32,
    /// Queue handle.
    pub queue: vk::Queue,
}

/// Owner of instance, physical device, logical device and queues.
pub struct Device {
    entry: ash::Entry,
    instance: ash::Instance,
    physical: vk::PhysicalDevice,
    device: ash::Device,
    graphics: QueueInfo,
    compute: QueueInfo,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    limits: vk::PhysicalDeviceLimits,
    one_shot_pool: vk::CommandPool,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Device")
            .field("physical", &self.physical)
            .field("graphics_family", &self.graphics.family)
            .field("compute_family", &self.compute.family)
            .finish()
    }
}

impl Device {
    /// Create the instance and the logical device.
    ///
    /// Enables the features the render core depends on: geometry shaders,
    /// multi-draw-indirect with count, descriptor indexing with
    /// update-after-bind, and min/max reduction samplers for the depth
    /// pyramid.
    pub fn new(display: RawDisplayHandle) -> Result<Self, RenderError> {
        unsafe {
            let entry = ash::Entry::load().map_err(|err| {
                RenderError::InitializationFailed(format!("failed to load Vulkan: {err}"))
            })?;

            let app_info = vk::ApplicationInfo::builder()
                .application_name(CStr::from_bytes_with_nul_unchecked(b"kiln\0"))
                .api_version(vk::make_api_version(0, 1, 2, 0));

            let extensions = ash_window::enumerate_required_extensions(display)
                .map_err(RenderError::from)?
                .to_vec();

            let instance_info = vk::InstanceCreateInfo::builder()
                .application_info(&app_info)
                .enabled_extension_names(&extensions);
            let instance = entry
                .create_instance(&instance_info, None)
                .map_err(|err| RenderError::InitializationFailed(format!("{err:?}")))?;

            let physical = pick_physical_device(&instance)?;
            let (graphics_family, compute_family) = pick_queue_families(&instance, physical)?;

            let priorities = [1.0f32];
            let mut queue_infos = vec![vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(graphics_family)
                .queue_priorities(&priorities)
                .build()];
            if compute_family != graphics_family {
                queue_infos.push(
                    vk::DeviceQueueCreateInfo::builder()
                        .queue_family_index(compute_family)
                        .queue_priorities(&priorities)
                        .build(),
                );
            }

            let features = vk::PhysicalDeviceFeatures::builder()
                .geometry_shader(true)
                .multi_draw_indirect(true)
                .sampler_anisotropy(true)
                .fill_mode_non_solid(true)
                .shader_int64(false)
                .build();

            let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::builder()
                .runtime_descriptor_array(true)
                .descriptor_binding_partially_bound(true)
                .descriptor_binding_variable_descriptor_count(true)
                .descriptor_binding_sampled_image_update_after_bind(true)
                .shader_sampled_image_array_non_uniform_indexing(true)
                .draw_indirect_count(true)
                .sampler_filter_minmax(true);

            let device_extensions = [ash::extensions::khr::Swapchain::name().as_ptr()];
            let device_info = vk::DeviceCreateInfo::builder()
                .queue_create_infos(&queue_infos)
                .enabled_extension_names(&device_extensions)
                .enabled_features(&features)
                .push_next(&mut vulkan12);

            let device = instance
                .create_device(physical, &device_info, None)
                .map_err(RenderError::from)?;

            let graphics = QueueInfo {
                family: graphics_family,
                queue: device.get_device_queue(graphics_family, 0),
            };
            let compute = QueueInfo {
                family: compute_family,
                queue: device.get_device_queue(compute_family, 0),
            };

            let memory_properties = instance.get_physical_device_memory_properties(physical);
            let limits = instance
                .get_physical_device_properties(physical)
                .limits;

            let one_shot_pool = device
                .create_command_pool(
                    &vk::CommandPoolCreateInfo::builder()
                        .flags(vk::CommandPoolCreateFlags::TRANSIENT)
                        .queue_family_index(graphics_family),
                    None,
                )
                .map_err(RenderError::from)?;

            log::debug!(
                "device created: graphics family {graphics_family}, compute family {compute_family}"
            );

            Ok(Device {
                entry,
                instance,
                physical,
                device,
                graphics,
                compute,
                memory_properties,
                limits,
                one_shot_pool,
            })
        }
    }

    /// Raw entry, for surface creation.
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// Raw instance, for surface creation.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Physical device.
    pub fn physical(&self) -> vk::PhysicalDevice {
        self.physical
    }

    /// Logical device.
    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    /// Graphics queue.
    pub fn graphics(&self) -> QueueInfo {
        self.graphics
    }

    /// Compute queue. May alias the graphics queue when the hardware has no
    /// dedicated compute family.
    pub fn compute(&self) -> QueueInfo {
        self.compute
    }

    /// Whether a dedicated compute family exists.
    pub fn has_dedicated_compute(&self) -> bool {
        self.graphics.family != self.compute.family
    }

    /// Physical-device memory properties.
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// Physical-device limits.
    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.limits
    }

    /// Record and synchronously execute a one-shot command buffer on the
    /// graphics queue. Used by staging uploads and mip generation.
    pub fn execute_one_shot(
        &self,
        record: impl FnOnce(vk::CommandBuffer),
    ) -> Result<(), RenderError> {
        unsafe {
            let cmd = self
                .device
                .allocate_command_buffers(
                    &vk::CommandBufferAllocateInfo::builder()
                        .command_pool(self.one_shot_pool)
                        .level(vk::CommandBufferLevel::PRIMARY)
                        .command_buffer_count(1),
                )
                .map_err(RenderError::from)?[0];

            self.device
                .begin_command_buffer(
                    cmd,
                    &vk::CommandBufferBeginInfo::builder()
                        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                )
                .map_err(RenderError::from)?;

            record(cmd);

            self.device.end_command_buffer(cmd).map_err(RenderError::from)?;

            let fence = self
                .device
                .create_fence(&vk::FenceCreateInfo::builder(), None)
                .map_err(RenderError::from)?;

            let cmds = [cmd];
            let submit = vk::SubmitInfo::builder().command_buffers(&cmds).build();
            let result = self
                .device
                .queue_submit(self.graphics.queue, &[submit], fence)
                .and_then(|()| self.device.wait_for_fences(&[fence], true, u64::MAX));

            self.device.destroy_fence(fence, None);
            self.device
                .free_command_buffers(self.one_shot_pool, &cmds);

            result.map_err(RenderError::from)
        }
    }

    /// Block until the device is idle. Required before swapchain recreation
    /// and before freeing resources a frame in flight may still reference.
    pub fn wait_idle(&self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
    }

    /// Destroy the device and instance. All resources created from the
    /// device must have been disposed first.
    pub fn dispose(self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_command_pool(self.one_shot_pool, None);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

unsafe fn pick_physical_device(instance: &ash::Instance) -> Result<vk::PhysicalDevice, RenderError> {
    let devices = instance
        .enumerate_physical_devices()
        .map_err(RenderError::from)?;
    devices
        .iter()
        .copied()
        .max_by_key(|&physical| {
            let properties = instance.get_physical_device_properties(physical);
            match properties.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 2,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
                _ => 0,
            }
        })
        .ok_or_else(|| RenderError::InitializationFailed("no Vulkan device".into()))
}

unsafe fn pick_queue_families(
    instance: &ash::Instance,
    physical: vk::PhysicalDevice,
) -> Result<(u32, u32), RenderError> {
    let families = instance.get_physical_device_queue_family_properties(physical);

    let graphics = families
        .iter()
        .position(|family| {
            family
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .ok_or_else(|| {
            RenderError::InitializationFailed("no graphics+compute queue family".into())
        })? as u32;

    // Prefer a dedicated compute family for async compute; otherwise share.
    let compute = families
        .iter()
        .enumerate()
        .position(|(index, family)| {
            index as u32 != graphics
                && family.queue_flags.contains(vk::QueueFlags::COMPUTE)
                && !family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
        })
        .map_or(graphics, |index| index as u32);

    Ok((graphics, compute))
}
