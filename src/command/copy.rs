//! Copy and upload commands, available on every queue kind.
//!
//! Uploads go through the list's CPU-writable linear allocator: the data is written
//! into upload memory right away and copied on the GPU when the list executes. The
//! upload memory is recycled once the list's fence completes.
use crate::{
    Result,
    backend::{Api, RawCommandList},
    linear::DynAlloc,
    resource::TrackedResource,
    tracking::ResourceStates,
};

use super::CommandList;

/// Alignment of buffer uploads.
const UPLOAD_ALIGNMENT: u64 = 512;

impl<A: Api> CommandList<A> {
    fn transition_for_copy(
        &mut self,
        dest: &mut impl TrackedResource<A>,
        src: Option<&mut dyn TrackedResource<A>>,
    ) {
        self.transition_resource(dest, ResourceStates::COPY_DEST, false);
        if let Some(src) = src {
            self.transition_resource(src.gpu_resource_mut(), ResourceStates::COPY_SOURCE, false);
        }
        self.flush_resource_barriers();
    }

    /// Copies all of `src` into `dest`. Both are transitioned for the copy.
    pub fn copy_buffer(&mut self, dest: &mut impl TrackedResource<A>, src: &mut impl TrackedResource<A>) {
        self.copy_resource(dest, src);
    }

    pub fn copy_buffer_region(
        &mut self,
        dest: &mut impl TrackedResource<A>,
        dest_offset: u64,
        src: &mut impl TrackedResource<A>,
        src_offset: u64,
        size: u64,
    ) {
        self.transition_for_copy(dest, Some(&mut *src));
        unsafe {
            self.context.raw.copy_buffer_region(
                dest.gpu_resource().raw(),
                dest_offset,
                src.gpu_resource().raw(),
                src_offset,
                size,
            )
        };
    }

    /// Copies a whole resource. Both are transitioned for the copy.
    pub fn copy_resource(&mut self, dest: &mut impl TrackedResource<A>, src: &mut impl TrackedResource<A>) {
        self.transition_for_copy(dest, Some(&mut *src));
        unsafe {
            self.context
                .raw
                .copy_resource(dest.gpu_resource().raw(), src.gpu_resource().raw())
        };
    }

    /// Uploads `data` to `dest` at `dest_offset`. `dest` is left in `COPY_DEST`.
    pub fn write_buffer(
        &mut self,
        dest: &mut impl TrackedResource<A>,
        dest_offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let mut upload = self
            .recording()
            .cpu_linear
            .allocate(data.len() as u64, UPLOAD_ALIGNMENT)?;
        upload.write(data);
        self.copy_from_upload(dest, dest_offset, &upload, data.len() as u64);
        Ok(())
    }

    /// Fills `size` bytes of `dest` at `dest_offset` with `value`. `size` must be a
    /// multiple of 4. `dest` is left in `COPY_DEST`.
    pub fn fill_buffer(
        &mut self,
        dest: &mut impl TrackedResource<A>,
        dest_offset: u64,
        value: u32,
        size: u64,
    ) -> Result<()> {
        assert_eq!(size % 4, 0, "fill size {size} is not a multiple of 4");
        let mut upload = self
            .recording()
            .cpu_linear
            .allocate(size, UPLOAD_ALIGNMENT)?;
        if let Some(bytes) = upload.as_mut_slice() {
            let words: &mut [u32] = bytemuck::cast_slice_mut(bytes);
            words.fill(value);
        }
        self.copy_from_upload(dest, dest_offset, &upload, size);
        Ok(())
    }

    fn copy_from_upload(
        &mut self,
        dest: &mut impl TrackedResource<A>,
        dest_offset: u64,
        upload: &DynAlloc<A>,
        size: u64,
    ) {
        self.transition_for_copy(dest, None);
        unsafe {
            self.context.raw.copy_buffer_region(
                dest.gpu_resource().raw(),
                dest_offset,
                upload.buffer(),
                upload.offset(),
                size,
            )
        };
    }

    /// CPU-writable memory that stays valid until this list completes on the GPU.
    pub fn reserve_upload_memory(&mut self, size: u64) -> Result<DynAlloc<A>> {
        let alignment = self.manager.config().linear_allocation_alignment;
        self.recording().cpu_linear.allocate(size, alignment)
    }

    /// GPU-exclusive scratch memory that stays valid until this list completes.
    pub fn allocate_gpu_scratch(&mut self, size: u64, alignment: u64) -> Result<DynAlloc<A>> {
        self.recording().gpu_linear.allocate(size, alignment)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        Device,
        backend::{
            QueueKind,
            headless::{Headless, HeadlessDevice},
        },
        config::ManagerConfig,
        manager::CommandListManager,
        resource::{GpuBuffer, TrackedResource},
        tracking::ResourceStates,
    };

    fn manager() -> CommandListManager<Headless> {
        CommandListManager::new(
            Device::<Headless>::new(HeadlessDevice::default()),
            ManagerConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_write_then_copy_between_buffers() {
        let manager = manager();
        let mut staging = GpuBuffer::new(&manager, "staging", 16, 1, None).unwrap();
        let mut target = GpuBuffer::new(&manager, "target", 16, 1, None).unwrap();
        let data: Vec<u8> = (0..16).collect();

        let mut list = manager.begin(QueueKind::Copy).unwrap();
        list.write_buffer(&mut staging, 0, &data).unwrap();
        list.copy_buffer_region(&mut target, 4, &mut staging, 0, 8);
        assert_eq!(staging.gpu_resource().usage_state(), ResourceStates::COPY_SOURCE);
        assert_eq!(target.gpu_resource().usage_state(), ResourceStates::COPY_DEST);
        list.close_and_execute(true).unwrap();

        let bytes = target.gpu_resource().raw().read_bytes(0..16);
        assert_eq!(&bytes[4..12], &data[..8]);
        assert_eq!(&bytes[..4], &[0; 4]);
    }

    #[test]
    fn test_fill_buffer() {
        let manager = manager();
        let mut buffer = GpuBuffer::new(&manager, "fill", 8, 4, None).unwrap();
        let mut list = manager.begin(QueueKind::Direct).unwrap();
        list.fill_buffer(&mut buffer, 8, 0xdead_beef, 16).unwrap();
        list.close_and_execute(true).unwrap();

        let bytes = buffer.gpu_resource().raw().read_bytes(0..32);
        assert_eq!(&bytes[..8], &[0; 8]);
        assert_eq!(&bytes[8..12], &0xdead_beef_u32.to_ne_bytes());
        assert_eq!(&bytes[20..24], &0xdead_beef_u32.to_ne_bytes());
        assert_eq!(&bytes[24..], &[0; 8]);
    }

    #[test]
    fn test_transient_memory_kinds() {
        let manager = manager();
        let mut list = manager.begin(QueueKind::Compute).unwrap();
        let mut upload = list.reserve_upload_memory(100).unwrap();
        assert_eq!(upload.size(), 256);
        upload.write(&[1u32; 25]);
        let scratch = list.allocate_gpu_scratch(4096, 4096).unwrap();
        assert!(scratch.as_slice().is_none());
        assert_eq!(scratch.gpu_address() % 4096, 0);
        list.discard();
        assert_eq!(manager.linear_page_pool_size(crate::linear::LinearAllocatorKind::CpuWritable), 1);
    }
}
