// Vertex buffer upload
//
// One host-visible buffer holding the triangle. Memory is mapped, filled and
// unmapped inside a single call; nothing stays mapped across frames.

use ash::vk;
use glam::Vec3;

use super::error::{RendererError, RendererResult, VkResultExt};
use crate::config::CopyMismatchPolicy;

/// The triangle, in clip space.
pub const TRIANGLE: [Vec3; 3] = [
    Vec3::new(-1.0, -1.0, 0.0),
    Vec3::new(1.0, -1.0, 0.0),
    Vec3::new(0.0, 1.0, 0.0),
];

/// Byte stride of one vertex (a single 3-float position)
pub const VERTEX_STRIDE: u32 = std::mem::size_of::<Vec3>() as u32;

/// Raw bytes of a vertex slice, as they land in GPU memory.
pub fn vertex_bytes(vertices: &[Vec3]) -> &[u8] {
    bytemuck::cast_slice(vertices)
}

/// First memory type allowed by `type_bits` that has all `required` flags.
///
/// No preference between types beyond index order.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> RendererResult<u32> {
    let count = memory_properties.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);

    (0..count)
        .find(|&i| {
            let allowed = type_bits & (1 << i) != 0;
            allowed
                && memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(required)
        })
        .ok_or(RendererError::NoCompatibleMemoryType { type_bits, required })
}

/// Whether writes through a mapping of memory type `index` must be flushed
/// before the device can see them.
pub fn needs_flush(memory_properties: &vk::PhysicalDeviceMemoryProperties, index: u32) -> bool {
    !memory_properties.memory_types[index as usize]
        .property_flags
        .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
}

/// Copy `src` into the mapped range, returning how many bytes made it.
pub fn copy_into_mapped(mapped: &mut [u8], src: &[u8]) -> usize {
    let n = mapped.len().min(src.len());
    mapped[..n].copy_from_slice(&src[..n]);
    n
}

/// Apply the configured policy to a short copy.
pub fn check_copy(expected: usize, copied: usize, policy: CopyMismatchPolicy) -> RendererResult<()> {
    if copied == expected {
        return Ok(());
    }
    match policy {
        CopyMismatchPolicy::Warn => {
            log::warn!("Failed to copy vertex buffer data: {} of {} bytes", copied, expected);
            Ok(())
        }
        CopyMismatchPolicy::Error => Err(RendererError::CopySizeMismatch { expected, copied }),
    }
}

#[derive(Debug, Default)]
pub struct VertexBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    /// Size of the vertex data in bytes (the allocation may be larger)
    pub size: vk::DeviceSize,
    pub vertex_count: u32,
}

impl VertexBuffer {
    /// Create, allocate, fill and bind a host-visible vertex buffer.
    ///
    /// Anything created before a failure is released before returning.
    pub fn upload(
        device: &ash::Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        vertices: &[Vec3],
        policy: CopyMismatchPolicy,
    ) -> RendererResult<Self> {
        let bytes = vertex_bytes(vertices);
        let size = bytes.len() as vk::DeviceSize;

        let mut vertex_buffer = Self {
            size,
            vertex_count: vertices.len() as u32,
            ..Default::default()
        };

        let result = vertex_buffer.fill(device, memory_properties, bytes, policy);
        if let Err(err) = result {
            vertex_buffer.destroy_buffer(device);
            vertex_buffer.free_memory(device);
            return Err(err);
        }

        log::info!("Uploaded {} vertices ({} bytes)", vertex_buffer.vertex_count, size);
        Ok(vertex_buffer)
    }

    fn fill(
        &mut self,
        device: &ash::Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        bytes: &[u8],
        policy: CopyMismatchPolicy,
    ) -> RendererResult<()> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(self.size)
            .usage(vk::BufferUsageFlags::VERTEX_BUFFER)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        self.buffer = unsafe { device.create_buffer(&buffer_info, None) }.phase("vertex buffer creation")?;

        let requirements = unsafe { device.get_buffer_memory_requirements(self.buffer) };
        let memory_type_index = find_memory_type(
            memory_properties,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        )?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        self.memory = unsafe { device.allocate_memory(&alloc_info, None) }.phase("vertex memory allocation")?;

        // Scoped mapping: map, copy, unmap before anything else can fail.
        let copied = unsafe {
            let ptr = device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
                .phase("vertex memory map")?;
            let mapped = std::slice::from_raw_parts_mut(ptr.cast::<u8>(), self.size as usize);
            let copied = copy_into_mapped(mapped, bytes);

            let flushed = if needs_flush(memory_properties, memory_type_index) {
                let range = vk::MappedMemoryRange::builder()
                    .memory(self.memory)
                    .offset(0)
                    .size(vk::WHOLE_SIZE)
                    .build();
                device
                    .flush_mapped_memory_ranges(&[range])
                    .phase("vertex memory flush")
            } else {
                Ok(())
            };

            device.unmap_memory(self.memory);
            flushed?;
            copied
        };
        check_copy(bytes.len(), copied, policy)?;

        unsafe { device.bind_buffer_memory(self.buffer, self.memory, 0) }.phase("vertex memory bind")?;

        Ok(())
    }

    pub(crate) fn destroy_buffer(&mut self, device: &ash::Device) {
        if self.buffer != vk::Buffer::null() {
            unsafe { device.destroy_buffer(self.buffer, None) };
        }
        self.buffer = vk::Buffer::null();
    }

    pub(crate) fn free_memory(&mut self, device: &ash::Device) {
        if self.memory != vk::DeviceMemory::null() {
            unsafe { device.free_memory(self.memory, None) };
        }
        self.memory = vk::DeviceMemory::null();
    }
}
