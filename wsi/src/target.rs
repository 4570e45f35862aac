//! Surface and swapchain ownership.

use ash::extensions::khr;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use relevant::Relevant;

use kiln_core::RenderError;
use kiln_resource::Device;

use crate::select::{choose_present_mode, choose_surface_format, clamp_extent};

/// Surface + swapchain + image views.
///
/// The `Relevant` guard enforces explicit disposal: the swapchain must not
/// be dropped silently while the device may still present to it.
pub struct Target {
    surface: vk::SurfaceKHR,
    surface_loader: khr::Surface,
    swapchain: vk::SwapchainKHR,
    swapchain_loader: khr::Swapchain,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    relevant: Relevant,
}

impl std::fmt::Debug for Target {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Target")
            .field("images", &self.images.len())
            .field("extent", &self.extent)
            .field("format", &self.format.format)
            .finish()
    }
}

impl Target {
    /// Create the surface and the first swapchain.
    pub fn new(
        device: &Device,
        display: RawDisplayHandle,
        window: RawWindowHandle,
        desired: vk::Extent2D,
    ) -> Result<Self, RenderError> {
        unsafe {
            let surface = ash_window::create_surface(
                device.entry(),
                device.instance(),
                display,
                window,
                None,
            )
            .map_err(RenderError::from)?;
            let surface_loader = khr::Surface::new(device.entry(), device.instance());

            let supported = surface_loader
                .get_physical_device_surface_support(
                    device.physical(),
                    device.graphics().family,
                    surface,
                )
                .map_err(RenderError::from)?;
            if !supported {
                surface_loader.destroy_surface(surface, None);
                return Err(RenderError::InitializationFailed(
                    "graphics queue cannot present to surface".into(),
                ));
            }

            let swapchain_loader = khr::Swapchain::new(device.instance(), device.raw());

            let mut target = Target {
                surface,
                surface_loader,
                swapchain: vk::SwapchainKHR::null(),
                swapchain_loader,
                images: Vec::new(),
                views: Vec::new(),
                format: vk::SurfaceFormatKHR::default(),
                extent: vk::Extent2D::default(),
                relevant: Relevant,
            };
            target.create_swapchain(device, desired)?;
            Ok(target)
        }
    }

    fn create_swapchain(
        &mut self,
        device: &Device,
        desired: vk::Extent2D,
    ) -> Result<(), RenderError> {
        unsafe {
            let capabilities = self
                .surface_loader
                .get_physical_device_surface_capabilities(device.physical(), self.surface)
                .map_err(RenderError::from)?;
            let formats = self
                .surface_loader
                .get_physical_device_surface_formats(device.physical(), self.surface)
                .map_err(RenderError::from)?;
            let modes = self
                .surface_loader
                .get_physical_device_surface_present_modes(device.physical(), self.surface)
                .map_err(RenderError::from)?;

            let format = choose_surface_format(&formats);
            let present_mode = choose_present_mode(&modes);
            let extent = clamp_extent(&capabilities, desired);

            let mut image_count = capabilities.min_image_count + 1;
            if capabilities.max_image_count > 0 {
                image_count = image_count.min(capabilities.max_image_count);
            }

            let old_swapchain = self.swapchain;
            let swapchain = self
                .swapchain_loader
                .create_swapchain(
                    &vk::SwapchainCreateInfoKHR::builder()
                        .surface(self.surface)
                        .min_image_count(image_count)
                        .image_format(format.format)
                        .image_color_space(format.color_space)
                        .image_extent(extent)
                        .image_array_layers(1)
                        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
                        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
                        .pre_transform(capabilities.current_transform)
                        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
                        .present_mode(present_mode)
                        .clipped(true)
                        .old_swapchain(old_swapchain),
                    None,
                )
                .map_err(RenderError::from)?;

            self.destroy_views(device);
            if old_swapchain != vk::SwapchainKHR::null() {
                self.swapchain_loader.destroy_swapchain(old_swapchain, None);
            }

            self.swapchain = swapchain;
            self.format = format;
            self.extent = extent;
            self.images = self
                .swapchain_loader
                .get_swapchain_images(swapchain)
                .map_err(RenderError::from)?;
            self.views = self
                .images
                .iter()
                .map(|&image| {
                    device
                        .raw()
                        .create_image_view(
                            &vk::ImageViewCreateInfo::builder()
                                .image(image)
                                .view_type(vk::ImageViewType::TYPE_2D)
                                .format(format.format)
                                .subresource_range(vk::ImageSubresourceRange {
                                    aspect_mask: vk::ImageAspectFlags::COLOR,
                                    base_mip_level: 0,
                                    level_count: 1,
                                    base_array_layer: 0,
                                    layer_count: 1,
                                }),
                            None,
                        )
                        .map_err(RenderError::from)
                })
                .collect::<Result<_, _>>()?;

            log::debug!(
                "swapchain created: {}x{} {:?}, {} images, {:?}",
                extent.width,
                extent.height,
                format.format,
                self.images.len(),
                present_mode
            );
            Ok(())
        }
    }

    /// Destroy and rebuild the swapchain at a new extent. The caller must
    /// have waited for device idle.
    pub fn recreate(&mut self, device: &Device, desired: vk::Extent2D) -> Result<(), RenderError> {
        self.create_swapchain(device, desired)
    }

    /// Acquire the next image, signalling `semaphore`. Returns the image
    /// index and whether the swapchain is suboptimal.
    pub fn acquire(&self, semaphore: vk::Semaphore) -> Result<(u32, bool), RenderError> {
        unsafe {
            self.swapchain_loader
                .acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null())
                .map_err(RenderError::from)
        }
    }

    /// Present an image after `wait` signals. Returns `true` when the
    /// swapchain is suboptimal and should be recreated.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<bool, RenderError> {
        unsafe {
            let swapchains = [self.swapchain];
            let indices = [image_index];
            let semaphores = [wait];
            self.swapchain_loader
                .queue_present(
                    queue,
                    &vk::PresentInfoKHR::builder()
                        .wait_semaphores(&semaphores)
                        .swapchains(&swapchains)
                        .image_indices(&indices),
                )
                .map_err(RenderError::from)
        }
    }

    /// Number of swapchain images.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Raw image by swapchain index.
    pub fn image(&self, index: u32) -> vk::Image {
        self.images[index as usize]
    }

    /// View by swapchain index.
    pub fn view(&self, index: u32) -> vk::ImageView {
        self.views[index as usize]
    }

    /// Current extent.
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Chosen surface format.
    pub fn format(&self) -> vk::Format {
        self.format.format
    }

    fn destroy_views(&mut self, device: &Device) {
        unsafe {
            for view in self.views.drain(..) {
                device.raw().destroy_image_view(view, None);
            }
        }
    }

    /// Destroy swapchain and surface. The device must be idle.
    pub fn dispose(mut self, device: &Device) {
        unsafe {
            self.destroy_views(device);
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
            self.surface_loader.destroy_surface(self.surface, None);
        }
        self.relevant.dispose();
    }
}
